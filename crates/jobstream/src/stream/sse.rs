//! Server-sent events framing.
//!
//! Splits a byte stream into events: lines end in `\n`, `\r\n` or `\r`, a
//! blank line dispatches the pending event, lines starting with `:` are
//! comments. An event with a type but no `data:` line is still dispatched so
//! bare `event: heartbeat` frames count as liveness.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Default cap on the bytes buffered for a single event.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// One undecoded event as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The `event:` field, `message` when absent.
    pub event_type: String,
    /// The joined `data:` lines.
    pub data: Vec<u8>,
    /// The `id:` field, if this event set one.
    pub id: Option<String>,
    /// The `retry:` hint, if this event carried one.
    pub retry: Option<Duration>,
}

impl RawEvent {
    /// Create an event with a type and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Set the event ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Default)]
struct PendingEvent {
    event_type: Option<String>,
    data: Vec<u8>,
    has_data: bool,
    id: Option<String>,
    retry: Option<Duration>,
}

impl PendingEvent {
    fn is_empty(&self) -> bool {
        self.event_type.is_none() && !self.has_data
    }

    fn take(&mut self) -> RawEvent {
        let pending = std::mem::take(self);
        RawEvent {
            event_type: pending.event_type.unwrap_or_else(|| "message".to_string()),
            data: pending.data,
            id: pending.id,
            retry: pending.retry,
        }
    }
}

/// Decoder turning an SSE byte stream into [`RawEvent`]s.
#[derive(Debug)]
pub struct SseCodec {
    pending: PendingEvent,
    max_event_bytes: usize,
    started: bool,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseCodec {
    /// Create a codec with the default size cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_event_bytes(DEFAULT_MAX_EVENT_BYTES)
    }

    /// Create a codec that rejects events larger than `max_event_bytes`.
    #[must_use]
    pub fn with_max_event_bytes(max_event_bytes: usize) -> Self {
        Self {
            pending: PendingEvent::default(),
            max_event_bytes,
            started: false,
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Option<RawEvent> {
        if line.is_empty() {
            if self.pending.is_empty() {
                self.pending = PendingEvent::default();
                return None;
            }
            return Some(self.pending.take());
        }
        if line[0] == b':' {
            return None;
        }

        let (field, value) = match line.iter().position(|b| *b == b':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };

        match field {
            b"event" => {
                self.pending.event_type = Some(String::from_utf8_lossy(value).into_owned());
            }
            b"data" => {
                if self.pending.has_data {
                    self.pending.data.push(b'\n');
                }
                self.pending.data.extend_from_slice(value);
                self.pending.has_data = true;
            }
            b"id" => {
                if !value.contains(&0) {
                    self.pending.id = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            b"retry" => {
                if let Some(ms) = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    self.pending.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn check_size(&self, buffered: usize) -> Result<(), io::Error> {
        if self.pending.data.len() + buffered > self.max_event_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("event exceeds {} bytes", self.max_event_bytes),
            ));
        }
        Ok(())
    }
}

impl Decoder for SseCodec {
    type Item = RawEvent;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawEvent>, io::Error> {
        if !self.started {
            if buf.len() < BOM.len() && BOM.starts_with(buf) {
                return Ok(None);
            }
            if buf.starts_with(BOM) {
                buf.advance(BOM.len());
            }
            self.started = true;
        }

        loop {
            let Some(end) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                self.check_size(buf.len())?;
                return Ok(None);
            };
            // A trailing '\r' may be the first half of "\r\n".
            if buf[end] == b'\r' && end + 1 == buf.len() {
                self.check_size(buf.len())?;
                return Ok(None);
            }

            let line = buf.split_to(end);
            let terminator = if buf.starts_with(b"\r\n") { 2 } else { 1 };
            buf.advance(terminator);

            self.check_size(line.len())?;
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawEvent>, io::Error> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        // Nothing follows a held-back '\r', so it ends the line.
        if buf.last() == Some(&b'\r') {
            let line = buf.split_to(buf.len() - 1);
            buf.advance(1);
            self.check_size(line.len())?;
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        // An event without its terminating blank line is incomplete.
        buf.clear();
        self.pending = PendingEvent::default();
        Ok(None)
    }
}
