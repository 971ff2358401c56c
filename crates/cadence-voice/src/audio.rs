//! PCM16 helpers.
//!
//! All buffers are 16-bit signed little-endian samples. Multi-channel audio
//! is interleaved.

use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::VoiceError;

/// Sample rate of the audio handed to the speech recognizer.
pub const ASR_SAMPLE_RATE: u32 = 16_000;

fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
}

fn to_bytes(samples: impl IntoIterator<Item = i16>) -> Vec<u8> {
    samples.into_iter().flat_map(i16::to_le_bytes).collect()
}

/// Root mean square of the samples, on the raw PCM16 scale (0 to 32767).
pub fn rms_pcm16(pcm: &[u8]) -> f64 {
    let mut count = 0usize;
    let mut sum_squares = 0.0f64;
    for s in samples(pcm) {
        let s = f64::from(s);
        sum_squares += s * s;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_squares / count as f64).sqrt()
}

/// Averages interleaved channels into mono.
pub fn downmix(pcm: &[u8], channels: u16) -> Vec<u8> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return pcm.to_vec();
    }
    let all: Vec<i16> = samples(pcm).collect();
    to_bytes(all.chunks_exact(channels).map(|frame| {
        let sum: i32 = frame.iter().map(|s| i32::from(*s)).sum();
        (sum / channels as i32) as i16
    }))
}

/// Duplicates mono samples across `channels`.
pub fn upmix(mono: &[u8], channels: u16) -> Vec<u8> {
    if channels <= 1 {
        return mono.to_vec();
    }
    to_bytes(samples(mono).flat_map(|s| std::iter::repeat(s).take(usize::from(channels))))
}

/// Converts PCM16 to f32 samples in [-1.0, 1.0).
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    samples(pcm).map(|s| f32::from(s) / 32768.0).collect()
}

/// Converts f32 samples back to PCM16, clipping out-of-range values.
pub fn f32_to_pcm16(values: &[f32]) -> Vec<u8> {
    to_bytes(values.iter().map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16))
}

/// Band-limited mono resampler over rubato's `SincFixedIn`.
///
/// Input is consumed in fixed 10 ms chunks; samples that do not fill a
/// chunk stay buffered until the next call.
pub struct AudioResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
}

impl AudioResampler {
    /// # Errors
    ///
    /// Returns [`VoiceError::Audio`] if either rate is zero or rubato
    /// rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, VoiceError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::Audio(format!(
                "cannot resample {from_rate} Hz to {to_rate} Hz"
            )));
        }
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let chunk_size = (from_rate as usize / 100).max(1);
        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
            .map_err(|e| VoiceError::Audio(format!("resampler setup failed: {e}")))?;
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Output samples the filter lags behind its input.
    pub fn output_delay(&self) -> usize {
        self.inner.output_delay()
    }

    /// Samples the next chunk needs.
    pub fn chunk_len(&self) -> usize {
        self.inner.input_frames_next()
    }

    /// Feeds `input` and returns every sample the completed chunks produce.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Audio`] if rubato fails on a chunk.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, VoiceError> {
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut channels = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| VoiceError::Audio(format!("resampling failed: {e}")))?;
            if let Some(channel) = channels.pop() {
                output.extend(channel);
            }
        }
        Ok(output)
    }
}

/// Resamples a complete mono PCM16 buffer.
///
/// The filter delay is trimmed and the tail flushed with silence, so the
/// result is exactly `len * to_rate / from_rate` samples long.
///
/// # Errors
///
/// Returns [`VoiceError::Audio`] if the resampler cannot be built or fails.
pub fn resample_pcm16(
    mono: &[u8],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<u8>, VoiceError> {
    if from_rate == to_rate {
        return Ok(mono.to_vec());
    }
    let input = pcm16_to_f32(mono);
    let expected = if from_rate == 0 {
        0
    } else {
        (input.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize
    };
    if expected == 0 {
        return Ok(Vec::new());
    }

    let mut resampler = AudioResampler::new(from_rate, to_rate)?;
    let delay = resampler.output_delay();
    let mut output = resampler.process(&input)?;
    while output.len() < delay + expected {
        let silence = vec![0.0f32; resampler.chunk_len()];
        output.extend(resampler.process(&silence)?);
    }
    Ok(f32_to_pcm16(&output[delay..delay + expected]))
}

/// Playback duration of `byte_len` bytes of PCM16 audio.
pub fn pcm16_duration(byte_len: usize, sample_rate: u32, channels: u16) -> Duration {
    let frame_bytes = 2 * u64::from(channels.max(1));
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let frames = byte_len as u64 / frame_bytes;
    Duration::from_micros(frames * 1_000_000 / u64::from(sample_rate))
}

/// Wraps raw PCM16 in a canonical 44-byte-header WAV container.
pub fn to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;
    let data_size = pcm.len().min(u32::MAX as usize) as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&36u32.saturating_add(data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Returns the PCM payload of a WAV file, or the input unchanged if it has
/// no RIFF header.
pub fn strip_wav_header(data: &[u8]) -> &[u8] {
    if data.len() > 44 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        &data[44..]
    } else {
        data
    }
}

/// Splits PCM16 into fixed-duration frames. The last frame is zero-padded.
pub fn frame_pcm16(pcm: &[u8], sample_rate: u32, channels: u16, frame_ms: u32) -> Vec<Vec<u8>> {
    let frame_bytes =
        (sample_rate as usize * frame_ms as usize / 1000) * 2 * usize::from(channels.max(1));
    if frame_bytes == 0 {
        return Vec::new();
    }
    pcm.chunks(frame_bytes)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_bytes, 0);
            frame
        })
        .collect()
}

/// Converts captured client audio to what the recognizer expects:
/// 16 kHz mono PCM16 in a WAV container.
///
/// # Errors
///
/// Returns [`VoiceError::Audio`] if the capture rate cannot be resampled.
pub fn prepare_for_asr(
    pcm: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<u8>, VoiceError> {
    let mono = downmix(pcm, channels);
    let resampled = resample_pcm16(&mono, sample_rate, ASR_SAMPLE_RATE)?;
    Ok(to_wav(&resampled, ASR_SAMPLE_RATE, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(values: &[i16]) -> Vec<u8> {
        to_bytes(values.iter().copied())
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms_pcm16(&pcm(&[1000, -1000, 1000, -1000])), 1000.0);
        assert_eq!(rms_pcm16(&[]), 0.0);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = pcm(&[100, 300, -200, 200]);
        assert_eq!(downmix(&stereo, 2), pcm(&[200, 0]));
        assert_eq!(upmix(&pcm(&[7]), 2), pcm(&[7, 7]));
    }

    fn sine(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<u8> {
        to_bytes((0..len).map(|i| {
            let t = i as f32 / rate as f32;
            ((2.0 * std::f32::consts::PI * freq * t).sin() * amplitude * 32767.0) as i16
        }))
    }

    #[test]
    fn resample_changes_length() {
        let mono = pcm(&[0; 480]);
        let down = resample_pcm16(&mono, 48_000, 16_000).unwrap();
        assert_eq!(down.len(), 160 * 2);
        assert!(down.iter().all(|b| *b == 0));
        assert_eq!(resample_pcm16(&mono, 48_000, 48_000).unwrap(), mono);
        assert!(resample_pcm16(&[], 22_050, 48_000).unwrap().is_empty());
    }

    #[test]
    fn resample_keeps_tone_level() {
        // 200 ms of a 1 kHz tone, 22.05 kHz piper output to 48 kHz playback.
        let tone = sine(1_000.0, 22_050, 4_410, 0.5);
        let up = resample_pcm16(&tone, 22_050, 48_000).unwrap();
        assert_eq!(up.len(), 9_600 * 2);

        // Ignore the edges where the filter sees silence.
        let middle = &up[2_000 * 2..7_600 * 2];
        let expected = 0.5 * 32767.0 / std::f64::consts::SQRT_2;
        let rms = rms_pcm16(middle);
        assert!((rms - expected).abs() < expected * 0.05, "rms {rms}");
    }

    #[test]
    fn streaming_resampler_buffers_partial_chunks() {
        let mut resampler = AudioResampler::new(48_000, 16_000).unwrap();
        assert_eq!(resampler.chunk_len(), 480);
        assert!(resampler.process(&[0.0; 300]).unwrap().is_empty());
        let out = resampler.process(&[0.0; 300]).unwrap();
        assert!((150..=170).contains(&out.len()), "got {}", out.len());
        assert!(AudioResampler::new(0, 16_000).is_err());
    }

    #[test]
    fn asr_input_is_16k_mono_wav() {
        let stereo = upmix(&sine(440.0, 48_000, 4_800, 0.3), 2);
        let wav = prepare_for_asr(&stereo, 48_000, 2).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(strip_wav_header(&wav).len(), 1_600 * 2);
    }

    #[test]
    fn duration_of_stereo_buffer() {
        // 48 kHz stereo: 192 bytes per millisecond.
        assert_eq!(pcm16_duration(192_000, 48_000, 2), Duration::from_secs(1));
        assert_eq!(pcm16_duration(1_920, 48_000, 2), Duration::from_millis(10));
    }

    #[test]
    fn wav_header_round_trip() {
        let data = pcm(&[1, 2, 3]);
        let wav = to_wav(&data, 16_000, 1);
        assert_eq!(wav.len(), 44 + data.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(strip_wav_header(&wav), &data[..]);
        assert_eq!(strip_wav_header(&data), &data[..]);
    }

    #[test]
    fn frames_are_padded() {
        // 20 ms at 1 kHz mono = 20 samples = 40 bytes.
        let frames = frame_pcm16(&pcm(&[1; 50]), 1_000, 1, 20);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 40));
        assert_eq!(&frames[2][20..], &[0u8; 20][..]);
    }
}
