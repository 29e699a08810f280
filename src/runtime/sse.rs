//! Incremental parser for the runtime's `text/event-stream` body.

use crate::runtime::RawEvent;

/// Buffers raw bytes and yields complete events as frames arrive.
///
/// Bytes are only decoded once a whole frame is buffered, so a UTF-8
/// sequence split across chunks survives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a frame boundary.
    scanned: usize,
}

impl SseParser {
    /// Feed arbitrary bytes and drain every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawEvent> {
        // CR only ever appears as part of a line ending; JSON escapes it.
        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        loop {
            // Back up one byte so a boundary split across chunks is found.
            let from = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[from..]
                .windows(2)
                .position(|pair| pair == b"\n\n")
            else {
                self.scanned = self.buffer.len();
                break;
            };
            let split = from + offset;
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            self.scanned = 0;
            let frame = String::from_utf8_lossy(&frame[..split]);

            let Some(payload) = extract_data(&frame) else {
                continue;
            };

            match serde_json::from_str::<RawEvent>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => tracing::debug!("Skipping malformed event frame: {}", e),
            }
        }

        events
    }

    /// Whether any partial frame is still buffered.
    pub fn has_pending(&self) -> bool {
        self.buffer.iter().any(|byte| !byte.is_ascii_whitespace())
    }
}

/// Join the `data:` lines of one frame. Comment-only frames yield `None`.
fn extract_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    let payload = lines.join("\n");
    if payload.trim().is_empty() {
        None
    } else {
        Some(payload)
    }
}
