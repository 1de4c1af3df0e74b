//! Incremental server-sent events decoder.

use bytes::BytesMut;

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Last event id seen on the stream, carried over from earlier events
    pub id: Option<String>,
    pub data: String,
}

/// Buffers raw bytes from an event stream and yields complete events.
///
/// Lines end in `\n` (a trailing `\r` is dropped). A blank line dispatches
/// the event collected so far; multiple `data:` lines are joined with `\n`.
/// Event types are ignored: the channel only sends `message` events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            id: self.id.clone(),
            data,
        })
    }
}
