//! Binary VNC frame codec.
//!
//! Layout: 16-byte header — 1 byte version (`0x01`), 1 byte direction,
//! 14 bytes session key (ASCII, zero-padded on the right) — followed by the
//! opaque VNC payload. Large payloads split along transport framing; there
//! is no application-level chunking.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub const FRAME_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 16;
pub const SESSION_KEY_LEN: usize = 14;

/// Which way the bytes are flowing through the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Control plane → agent (client keystrokes, pointer events).
    ToAgent,
    /// Agent → control plane (framebuffer updates).
    ToControlPlane,
}

impl Direction {
    fn byte(self) -> u8 {
        match self {
            Self::ToAgent => 0x00,
            Self::ToControlPlane => 0x01,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported frame version {0:#04x}")]
    BadVersion(u8),
    #[error("unknown direction byte {0:#04x}")]
    BadDirection(u8),
    #[error("session key is not ascii")]
    BadKey,
}

/// The fixed-width key identifying a session inside binary frames: the
/// first 14 hex chars of the session UUID's simple form. Full UUIDs travel
/// in the `vnc_open`/`vnc_close` JSON messages; both ends key their tunnel
/// tables by this form.
pub fn session_key(session_id: Uuid) -> String {
    let mut simple = session_id.simple().to_string();
    simple.truncate(SESSION_KEY_LEN);
    simple
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncFrame {
    pub direction: Direction,
    pub session_key: String,
    pub payload: Bytes,
}

impl VncFrame {
    pub fn new(direction: Direction, session_key: &str, payload: Bytes) -> Self {
        Self {
            direction,
            session_key: session_key.to_owned(),
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.direction.byte());

        let key = self.session_key.as_bytes();
        let used = key.len().min(SESSION_KEY_LEN);
        buf.put_slice(&key[..used]);
        buf.put_bytes(0, SESSION_KEY_LEN - used);

        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_LEN {
            return Err(FrameError::TooShort(raw.len()));
        }
        if raw[0] != FRAME_VERSION {
            return Err(FrameError::BadVersion(raw[0]));
        }
        let direction = match raw[1] {
            0x00 => Direction::ToAgent,
            0x01 => Direction::ToControlPlane,
            other => return Err(FrameError::BadDirection(other)),
        };

        let key_bytes = &raw[2..HEADER_LEN];
        let key_len = key_bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(SESSION_KEY_LEN);
        let session_key = std::str::from_utf8(&key_bytes[..key_len])
            .map_err(|_| FrameError::BadKey)?
            .to_owned();

        Ok(Self {
            direction,
            session_key,
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
        })
    }
}
