//! Incremental sentence boundary detection over streamed model tokens.
//!
//! A sentence ends at `.`, `!` or `?` (plus any closing quotes or brackets)
//! followed by whitespace, or at a line break. A period directly after a
//! known abbreviation, or after a leading list number, is not a boundary.
//! Text that grows past the length cap without a boundary is cut at its
//! last whitespace.

const TERMINATORS: [char; 3] = ['.', '!', '?'];
const CLOSERS: [char; 6] = ['"', '\'', ')', ']', '\u{201d}', '\u{2019}'];

#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    buffer: String,
    abbreviations: Vec<String>,
    max_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(abbreviations: &[String], max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            abbreviations: abbreviations.iter().map(|a| a.to_lowercase()).collect(),
            max_chars: max_chars.max(1),
        }
    }

    /// Appends streamed text and returns every sentence it completes.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        while let Some(sentence) = self.next_sentence() {
            sentences.push(sentence);
        }
        sentences
    }

    /// Flushes whatever is left as a final sentence.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Text received but not yet part of a sentence.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn next_sentence(&mut self) -> Option<String> {
        let end = self.find_boundary().or_else(|| self.length_cut())?;
        let sentence = self.buffer[..end].trim().to_string();
        let rest = self.buffer[end..].trim_start().to_string();
        self.buffer = rest;
        if sentence.is_empty() {
            return if self.buffer.is_empty() {
                None
            } else {
                self.next_sentence()
            };
        }
        Some(sentence)
    }

    /// Byte offset just past the first sentence boundary, if one is settled.
    fn find_boundary(&self) -> Option<usize> {
        let text = self.buffer.as_str();
        let mut chars = text.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c == '\n' {
                if text[..i].trim().is_empty() {
                    continue;
                }
                return Some(i + 1);
            }
            if !TERMINATORS.contains(&c) {
                continue;
            }

            let mut end = i + c.len_utf8();
            let mut run = 1;
            while let Some(&(j, next)) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    end = j + next.len_utf8();
                    run += 1;
                    chars.next();
                } else {
                    break;
                }
            }

            // The character after the run decides; without one, wait.
            let next = text[end..].chars().next()?;
            if !next.is_whitespace() {
                continue;
            }
            if c == '.' && run == 1 && self.is_abbreviation_period(&text[..i]) {
                continue;
            }
            return Some(end);
        }
        None
    }

    fn is_abbreviation_period(&self, before: &str) -> bool {
        let word = before
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or_default()
            .trim_start_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            return false;
        }
        if self.abbreviations.iter().any(|a| *a == word) {
            return true;
        }
        // "1. First item" style list markers.
        word.chars().all(|c| c.is_ascii_digit()) && before.trim() == word
    }

    fn length_cut(&self) -> Option<usize> {
        let limit = self.buffer.char_indices().nth(self.max_chars)?.0;
        let head = &self.buffer[..limit];
        match head.rfind(char::is_whitespace) {
            Some(ws) if !head[..ws].trim().is_empty() => Some(ws),
            _ => Some(limit),
        }
    }
}
