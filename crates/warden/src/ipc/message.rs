//! Fixed-size result message exchanged between supervisor and worker
//!
//! Every message is exactly [`MESSAGE_SIZE`] bytes on the wire:
//!
//! ```text
//! [i32 status_code][i32 data_len][payload: MESSAGE_SIZE - 8 bytes]
//! ```
//!
//! Header integers use native byte order; both ends are the same binary on the
//! same host. There is no version field.

use std::num::NonZeroI32;

/// Total on-wire size of one message.
pub const MESSAGE_SIZE: usize = 4096;

const HEADER_SIZE: usize = 2 * std::mem::size_of::<i32>();

/// Payload capacity. At most `PAYLOAD_CAPACITY - 1` bytes carry data; the
/// byte after the data is always 0.
pub const PAYLOAD_CAPACITY: usize = MESSAGE_SIZE - HEADER_SIZE;

/// Page-aligned wire buffer for one encoded message.
#[repr(C, align(4096))]
pub struct WireBuffer(pub [u8; MESSAGE_SIZE]);

impl WireBuffer {
    fn zeroed() -> Self {
        WireBuffer([0u8; MESSAGE_SIZE])
    }
}

/// One protocol message.
///
/// Constructed zeroed, populated by exactly one of [`Message::set_data`] or
/// [`Message::set_error`], sent once and consumed once.
#[derive(Clone)]
pub struct Message {
    status_code: i32,
    data_len: usize,
    payload: Box<[u8; PAYLOAD_CAPACITY]>,
}

impl Message {
    /// A zeroed message: status 0, no data.
    #[must_use]
    pub fn new() -> Self {
        Message {
            status_code: 0,
            data_len: 0,
            payload: Box::new([0u8; PAYLOAD_CAPACITY]),
        }
    }

    /// Mark the message successful and copy `data` into the payload.
    ///
    /// Data longer than `PAYLOAD_CAPACITY - 1` is truncated. Returns the number
    /// of bytes actually copied.
    pub fn set_data(&mut self, data: Option<&[u8]>) -> usize {
        self.status_code = 0;
        self.fill(data)
    }

    /// Mark the message failed with `code` and an optional diagnostic text.
    ///
    /// The text is copied with the same truncation rule as [`Message::set_data`].
    pub fn set_error(&mut self, code: NonZeroI32, detail: Option<&str>) -> usize {
        self.status_code = code.get();
        self.fill(detail.map(str::as_bytes))
    }

    fn fill(&mut self, data: Option<&[u8]>) -> usize {
        self.payload.fill(0);
        let src = data.unwrap_or_default();
        let len = src.len().min(PAYLOAD_CAPACITY - 1);
        self.payload[..len].copy_from_slice(&src[..len]);
        self.payload[len] = 0;
        self.data_len = len;
        len
    }

    /// Status reported by the worker. 0 means success.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        self.status_code
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }

    /// The valid payload bytes (without the terminating 0).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.data_len]
    }

    /// The payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.data()).into_owned()
    }

    /// Serialize into the fixed-size wire layout.
    #[must_use]
    pub fn encode(&self) -> WireBuffer {
        let mut buf = WireBuffer::zeroed();
        buf.0[0..4].copy_from_slice(&self.status_code.to_ne_bytes());
        // data_len < PAYLOAD_CAPACITY, which always fits in an i32
        buf.0[4..8].copy_from_slice(&(self.data_len as i32).to_ne_bytes());
        buf.0[HEADER_SIZE..].copy_from_slice(&self.payload[..]);
        buf
    }

    /// Deserialize a received buffer of exactly `MESSAGE_SIZE` bytes.
    ///
    /// The sender is untrusted: a `data_len` outside `[0, PAYLOAD_CAPACITY)`
    /// is clamped to `PAYLOAD_CAPACITY - 1`, and the byte at `data_len` is
    /// forced to 0 regardless of what the sender put there.
    #[must_use]
    pub fn decode(raw: &[u8; MESSAGE_SIZE]) -> Self {
        let status_code = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let raw_len = i32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let data_len = clamp_len(raw_len);

        let mut payload = Box::new([0u8; PAYLOAD_CAPACITY]);
        payload.copy_from_slice(&raw[HEADER_SIZE..]);
        payload[data_len] = 0;

        Message {
            status_code,
            data_len,
            payload,
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("status_code", &self.status_code)
            .field("data_len", &self.data_len)
            .finish_non_exhaustive()
    }
}

fn clamp_len(raw_len: i32) -> usize {
    match usize::try_from(raw_len) {
        Ok(len) if len < PAYLOAD_CAPACITY => len,
        _ => PAYLOAD_CAPACITY - 1,
    }
}
