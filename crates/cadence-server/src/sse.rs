//! Incremental parser for `text/event-stream` bodies.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `data: [DONE]` sentinel of OpenAI-compatible streams.
    Done,
}

/// Collects `data:` payloads from chunks that may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.line_buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer[..newline_pos].to_string();
            self.line_buffer.drain(..=newline_pos);

            // Comments, event names and blank separators carry nothing we use.
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Data("{\"b\":2}".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn line_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"te").is_empty());
        assert_eq!(
            parser.feed("xt\":\"hi\"}\r\n\r\n"),
            vec![SseEvent::Data("{\"text\":\"hi\"}".to_string())]
        );
    }

    #[test]
    fn comments_and_event_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\nevent: ping\ndata: x\n\n");
        assert_eq!(events, vec![SseEvent::Data("x".to_string())]);
    }
}
