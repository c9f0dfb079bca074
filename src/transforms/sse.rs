//! Incremental server-sent-event frame decoder.
//!
//! Bytes are buffered until a blank line terminates a frame, so frames (and
//! multi-byte UTF-8 sequences) split across network chunks decode correctly.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Event {
        #[allow(dead_code)]
        event: Option<String>,
        data: String,
    },
    /// `retry:` field without data
    ReconnectInterval(u64),
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already scanned without finding a frame end
    scanned: usize,
    /// Whether `scanned` sits at the start of a line
    line_start: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            line_start: true,
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event, if one is buffered. Frames without data or retry are skipped.
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        while let Some((frame_len, delimiter_len)) = self.find_frame_end() {
            let frame: Vec<u8> = self.buffer.drain(..frame_len + delimiter_len).collect();
            self.scanned = 0;
            self.line_start = true;
            if let Some(event) = parse_frame(&frame[..frame_len]) {
                return Some(event);
            }
        }
        None
    }

    /// Decode whatever is left once the source has ended.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        *self = Self::default();
        parse_frame(&rest)
    }

    /// Locate the blank line ending the first frame: `(frame length, delimiter length)`.
    ///
    /// Lines end in LF, CRLF or a lone CR. Scanning resumes where the last call
    /// stopped, so each buffered byte is inspected once per frame.
    fn find_frame_end(&mut self) -> Option<(usize, usize)> {
        let buf = &self.buffer;
        let mut i = self.scanned;

        while i < buf.len() {
            let terminator = match buf[i] {
                b'\n' => 1,
                b'\r' => match buf.get(i + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // may be the first half of a CRLF split across chunks
                    None => break,
                },
                _ => {
                    self.line_start = false;
                    i += 1;
                    continue;
                }
            };
            if self.line_start {
                return Some((i, terminator));
            }
            self.line_start = true;
            i += terminator;
        }

        self.scanned = i;
        None
    }
}

fn parse_frame(frame: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(frame);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut retry = None;

    // a frame holds no blank lines, so CRLF splitting into an empty piece is harmless
    for line in text.split(['\r', '\n']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data.push(value),
            "event" => event = Some(value.to_string()),
            "retry" => retry = value.trim().parse().ok(),
            _ => {}
        }
    }

    if !data.is_empty() {
        Some(StreamEvent::Event {
            event,
            data: data.join("\n"),
        })
    } else {
        retry.map(StreamEvent::ReconnectInterval)
    }
}
