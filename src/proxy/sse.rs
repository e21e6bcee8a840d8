//! Incremental Server-Sent Events framing.
//!
//! Consumes raw byte chunks (which may split events, lines, or even UTF-8
//! sequences are assumed line-safe in practice) and yields complete
//! `event:`/`data:` frames. Payload interpretation is left to callers.


/// One complete SSE frame: the optional `event:` name plus the joined
/// `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Stateful framer that buffers partial events across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: String,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = find_frame_boundary(&self.buffer) {
            let block: String = self.buffer.drain(..pos).collect();
            // Drop the blank separator line itself.
            let sep = if self.buffer.starts_with("\r\n\r\n") { 4 } else { 2 };
            self.buffer.drain(..sep.min(self.buffer.len()));

            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush any trailing partial frame once the stream ends.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&rest)
    }
}

/// Byte offset of the next `\n\n` (or `\r\n\r\n`) separator, if any.
fn find_frame_boundary(buffer: &str) -> Option<usize> {
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Parse one event block into a frame. Multiple `data:` lines are joined
/// with newlines per the SSE spec; comment lines are ignored.
fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = String::new();
    let mut saw_data = false;

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("data:") {
            if saw_data {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
            saw_data = true;
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // id:/retry:/comment lines carry nothing we consume.
    }

    if event.is_none() && !saw_data {
        return None;
    }
    Some(SseFrame { event, data })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
