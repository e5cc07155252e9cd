//! Server-sent-event line parsing for streamed completions.

/// Incremental SSE parser.
///
/// Feed raw body chunks in; complete `data:` payloads come out. The
/// `[DONE]` sentinel is swallowed and flips `done`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume a chunk and return any completed data payloads.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                } else if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }

        payloads
    }
}

/// Split text into pseudo-chunks of at most `max_chars` characters.
///
/// Used when a server answers a `stream:true` request with a single JSON
/// payload: the client synthesizes chunks and yields to the event loop
/// between them.
pub fn pseudo_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_reassembles_split_frames() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"a\":").is_empty());
        let payloads = parser.feed("1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_done_sentinel() {
        let mut parser = SseParser::new();
        let payloads = parser.feed("data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads.len(), 1);
        assert!(parser.is_done());
    }

    #[test]
    fn test_pseudo_chunks_bound() {
        let chunks = pseudo_chunks(&"x".repeat(200), 80);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 80));
        assert_eq!(chunks.concat().len(), 200);
    }

    #[test]
    fn test_pseudo_chunks_multibyte() {
        let chunks = pseudo_chunks(&"你好".repeat(100), 80);
        assert!(chunks.iter().all(|c| c.chars().count() <= 80));
    }
}
