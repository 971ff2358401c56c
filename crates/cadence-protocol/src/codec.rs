//! MessagePack encoding of [`Envelope`]s.
//!
//! The outer envelope is a map with the keys `stanza_id`, `conversation_id`,
//! `type`, `meta` and `body`. `body` is a binary blob holding the payload,
//! itself a MessagePack map with camelCase keys.

use crate::body::{Body, MessageType};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize)]
struct WireOut<'a> {
    stanza_id: i32,
    conversation_id: &'a str,
    #[serde(rename = "type")]
    type_id: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    meta: &'a BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    body: &'a [u8],
}

#[derive(Deserialize)]
struct WireIn {
    stanza_id: i32,
    conversation_id: String,
    #[serde(rename = "type")]
    type_id: u16,
    #[serde(default)]
    meta: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

/// Serializes an envelope to bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = encode_body(&envelope.body)?;
    let wire = WireOut {
        stanza_id: envelope.stanza_id,
        conversation_id: &envelope.conversation_id,
        type_id: envelope.body.type_id(),
        meta: &envelope.meta,
        body: &body,
    };
    Ok(rmp_serde::to_vec_named(&wire)?)
}

/// Parses bytes produced by [`encode`] or by a client.
///
/// Unknown type ids are not an error: they decode to [`Body::Unknown`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let wire: WireIn = rmp_serde::from_slice(bytes)?;
    let body = decode_body(wire.type_id, wire.body)?;
    Ok(Envelope {
        stanza_id: wire.stanza_id,
        conversation_id: wire.conversation_id,
        meta: wire.meta,
        body,
    })
}

fn encode_body(body: &Body) -> Result<Vec<u8>, ProtocolError> {
    let bytes = match body {
        Body::Error(b) => rmp_serde::to_vec_named(b)?,
        Body::UserMessage(b) => rmp_serde::to_vec_named(b)?,
        Body::AssistantMessage(b) => rmp_serde::to_vec_named(b)?,
        Body::AudioChunk(b) => rmp_serde::to_vec_named(b)?,
        Body::ReasoningStep(b) => rmp_serde::to_vec_named(b)?,
        Body::ToolUseRequest(b) => rmp_serde::to_vec_named(b)?,
        Body::ToolUseResult(b) => rmp_serde::to_vec_named(b)?,
        Body::Acknowledgement(b) => rmp_serde::to_vec_named(b)?,
        Body::Transcription(b) => rmp_serde::to_vec_named(b)?,
        Body::ControlStop(b) => rmp_serde::to_vec_named(b)?,
        Body::ControlVariation(b) => rmp_serde::to_vec_named(b)?,
        Body::Configuration(b) => rmp_serde::to_vec_named(b)?,
        Body::StartAnswer(b) => rmp_serde::to_vec_named(b)?,
        Body::MemoryTrace(b) => rmp_serde::to_vec_named(b)?,
        Body::Commentary(b) => rmp_serde::to_vec_named(b)?,
        Body::AssistantSentence(b) => rmp_serde::to_vec_named(b)?,
        Body::Unknown { raw, .. } => raw.clone(),
    };
    Ok(bytes)
}

fn body_as<T: DeserializeOwned>(t: MessageType, raw: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(raw).map_err(|source| ProtocolError::Body {
        message_type: t.name(),
        source,
    })
}

fn decode_body(type_id: u16, raw: Vec<u8>) -> Result<Body, ProtocolError> {
    let Some(t) = MessageType::from_u16(type_id) else {
        return Ok(Body::Unknown { type_id, raw });
    };
    let body = match t {
        MessageType::ErrorMessage => Body::Error(body_as(t, &raw)?),
        MessageType::UserMessage => Body::UserMessage(body_as(t, &raw)?),
        MessageType::AssistantMessage => Body::AssistantMessage(body_as(t, &raw)?),
        MessageType::AudioChunk => Body::AudioChunk(body_as(t, &raw)?),
        MessageType::ReasoningStep => Body::ReasoningStep(body_as(t, &raw)?),
        MessageType::ToolUseRequest => Body::ToolUseRequest(body_as(t, &raw)?),
        MessageType::ToolUseResult => Body::ToolUseResult(body_as(t, &raw)?),
        MessageType::Acknowledgement => Body::Acknowledgement(body_as(t, &raw)?),
        MessageType::Transcription => Body::Transcription(body_as(t, &raw)?),
        MessageType::ControlStop => Body::ControlStop(body_as(t, &raw)?),
        MessageType::ControlVariation => Body::ControlVariation(body_as(t, &raw)?),
        MessageType::Configuration => Body::Configuration(body_as(t, &raw)?),
        MessageType::StartAnswer => Body::StartAnswer(body_as(t, &raw)?),
        MessageType::MemoryTrace => Body::MemoryTrace(body_as(t, &raw)?),
        MessageType::Commentary => Body::Commentary(body_as(t, &raw)?),
        MessageType::AssistantSentence => Body::AssistantSentence(body_as(t, &raw)?),
    };
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::*;
    use serde_json::json;

    fn envelope(body: Body) -> Envelope {
        Envelope::new("conv_abc", body)
            .with_stanza_id(12)
            .with_meta("timestamp", "1700000000000")
    }

    fn sample_bodies() -> Vec<Body> {
        vec![
            Body::Error(ErrorMessage {
                id: "err_1".into(),
                conversation_id: "conv_abc".into(),
                code: error_codes::SERVICE_UNAVAILABLE,
                message: "upstream unavailable".into(),
                severity: Severity::Error,
                recoverable: true,
                originating_id: Some("msg_1".into()),
            }),
            Body::UserMessage(UserMessage {
                id: "msg_1".into(),
                previous_id: None,
                conversation_id: "conv_abc".into(),
                content: "What's 2+2?".into(),
                timestamp: Some(1_700_000_000_000),
            }),
            Body::AudioChunk(AudioChunk {
                conversation_id: "conv_abc".into(),
                format: "audio/pcm".into(),
                sequence: 3,
                duration_ms: 20,
                data: vec![0, 1, 2, 255],
                is_last: true,
            }),
            Body::ToolUseRequest(ToolUseRequest {
                id: "tool_1".into(),
                message_id: "msg_2".into(),
                conversation_id: "conv_abc".into(),
                tool_name: "calculator".into(),
                parameters: json!({"expression": "2+2"}),
                execution: ToolExecution::Server,
                timeout_ms: 30_000,
            }),
            Body::ToolUseResult(ToolUseResult {
                id: "res_1".into(),
                request_id: "tool_1".into(),
                conversation_id: "conv_abc".into(),
                success: true,
                result: Some(json!("4")),
                error_code: None,
                error_message: None,
            }),
            Body::Transcription(Transcription {
                id: "msg_3".into(),
                previous_id: None,
                conversation_id: "conv_abc".into(),
                text: "hello there".into(),
                is_final: true,
                confidence: Some(0.5),
                language: Some("en".into()),
                error: None,
            }),
            Body::ControlStop(ControlStop {
                conversation_id: "conv_abc".into(),
                target_id: Some("msg_2".into()),
                reason: None,
                stop_type: StopType::Speech,
            }),
            Body::ControlVariation(ControlVariation {
                conversation_id: "conv_abc".into(),
                target_id: "msg_1".into(),
                mode: VariationMode::Edit,
                new_content: Some("What's 3+3?".into()),
            }),
            Body::Configuration(Configuration {
                conversation_id: "conv_abc".into(),
                last_sequence_seen: 41,
                features: vec!["streaming".into(), "audio_output".into()],
                ..Default::default()
            }),
            Body::StartAnswer(StartAnswer {
                id: "msg_2".into(),
                previous_id: "msg_1".into(),
                conversation_id: "conv_abc".into(),
                answer_type: Some(AnswerType::TextVoice),
                planned_sentence_count: 0,
            }),
            Body::AssistantSentence(AssistantSentence {
                id: "sent_1".into(),
                previous_id: "msg_2".into(),
                conversation_id: "conv_abc".into(),
                sequence: 0,
                text: "The answer is 4.".into(),
                is_final: true,
                audio: Some(vec![9, 8, 7]),
            }),
        ]
    }

    #[test]
    fn envelopes_survive_round_trip() {
        for body in sample_bodies() {
            let env = envelope(body);
            let bytes = encode(&env).unwrap();
            assert_eq!(decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn unknown_type_decodes_to_unknown_variant() {
        let raw = rmp_serde::to_vec_named(&json!({"x": 1})).unwrap();
        let env = envelope(Body::Unknown {
            type_id: 77,
            raw: raw.clone(),
        });
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.body, Body::Unknown { type_id: 77, raw });
        assert_eq!(decoded.stanza_id, 12);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&envelope(sample_bodies().remove(1))).unwrap();
        let err = decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn body_missing_mandatory_field_is_rejected() {
        // A UserMessage body without `content`.
        let partial = rmp_serde::to_vec_named(&json!({"id": "m", "conversationId": "c"})).unwrap();
        let wire = WireOut {
            stanza_id: 1,
            conversation_id: "c",
            type_id: MessageType::UserMessage.as_u16(),
            meta: &BTreeMap::new(),
            body: &partial,
        };
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Body {
                message_type: "UserMessage",
                ..
            }
        ));
    }

    #[test]
    fn body_uses_camel_case_keys() {
        let body = Body::Acknowledgement(Acknowledgement {
            conversation_id: "c".into(),
            acknowledged_stanza_id: 5,
            success: true,
        });
        let raw = encode_body(&body).unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&raw).unwrap();
        assert_eq!(value["acknowledgedStanzaId"], 5);
        assert_eq!(value["conversationId"], "c");
    }
}
