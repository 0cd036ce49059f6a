//! Incremental server-sent-events framing. The parser holds only the
//! current line buffer and the event under construction, so it can sit on a
//! streaming tee without buffering the response body.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The OpenAI-style terminator frame.
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }

    pub fn is_error_event(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of the response body. Returns every event completed by
    /// this chunk, in order. Non-UTF-8 chunks are skipped; LLM SSE streams
    /// are JSON text.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };

        let mut completed = Vec::new();
        self.line_buf.push_str(text);

        while let Some(newline) = self.line_buf.find('\n') {
            let mut line = self.line_buf[..newline].to_string();
            self.line_buf.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut completed);
        }

        completed
    }

    /// Flushes a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut completed = Vec::new();
        if !self.line_buf.is_empty() {
            let mut line = std::mem::take(&mut self.line_buf);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut completed);
        }
        self.flush_event(&mut completed);
        completed
    }

    fn consume_line(&mut self, line: &str, completed: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_event(completed);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_event(&mut self, completed: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        completed.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"part\":").is_empty());
        assert!(parser.push(b"1}\nda").is_empty());
        let events = parser.push(b"ta: {\"part\":2}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"part\":1}\n{\"part\":2}");
    }

    #[test]
    fn crlf_and_comment_lines() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn done_marker_is_recognized() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn error_event_name_is_recognized() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: error\ndata: {\"type\":\"error\"}\n\n");
        assert!(events[0].is_error_event());
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
        assert!(events[2].is_done());
    }
}
