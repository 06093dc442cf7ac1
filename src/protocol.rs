//! Wire protocol codec for the session control/data channel.
//!
//! Length-prefixed frames with a leading type byte:
//!
//! ```text
//! [u8 type] [u32 BE length] [payload: length bytes]
//! ```
//!
//! Frame types:
//! - `0x01` Data: client→daemon keystrokes, daemon→client PTY output
//! - `0x02` Resize (client→daemon) — `[u16 BE rows][u16 BE cols]`
//! - `0x03` Signal (client→daemon) — `[u8 signum]`
//! - `0x04` Kick (daemon→client) — empty; receiver was displaced
//! - `0x05` Mode (client→daemon, MUST be first) — `[u8 role]`
//! - `0x06` Env (client→daemon) — `KEY=VALUE` bytes
//!
//! Integers are big-endian. There is no magic number or version byte;
//! cross-version changes require a coordinated upgrade.

use crate::error::SessionError;

/// Maximum allowed payload size for a single frame (64 KiB).
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Size of the fixed frame header (type byte + length word).
pub const HEADER_LEN: usize = 5;

/// Frame type constants.
pub mod frame_type {
    /// Raw byte data (bidirectional).
    pub const DATA: u8 = 0x01;
    /// PTY window size update (client → daemon).
    pub const RESIZE: u8 = 0x02;
    /// Process-termination signal for the shell (client → daemon).
    pub const SIGNAL: u8 = 0x03;
    /// Master displacement notice (daemon → client).
    pub const KICK: u8 = 0x04;
    /// Role declaration, first frame on every connection (client → daemon).
    pub const MODE: u8 = 0x05;
    /// Environment variable propagation (client → daemon).
    pub const ENV: u8 = 0x06;
}

/// Peer role declared in the `Mode` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Drives input, resize, and signals. At most one per session.
    Master,
    /// Passive receiver; all input frames are ignored.
    Observer,
}

impl Role {
    /// Wire encoding of the role byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Role::Master => 0x00,
            Role::Observer => 0x01,
        }
    }

    /// Decode a role byte. Any value other than `0x01` is master, matching
    /// the daemon's historical lenience.
    pub fn from_byte(b: u8) -> Self {
        if b == 0x01 {
            Role::Observer
        } else {
            Role::Master
        }
    }
}

/// A decoded frame from the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw bytes: keystrokes toward the shell, PTY output toward clients.
    Data(Vec<u8>),
    /// New PTY window size.
    Resize {
        /// Terminal height in rows.
        rows: u16,
        /// Terminal width in columns.
        cols: u16,
    },
    /// Signal number to deliver to the shell process.
    Signal(u8),
    /// The receiver has been displaced by a new master.
    Kick,
    /// Role declaration; must be the first frame on a connection.
    Mode(Role),
    /// `KEY=VALUE` environment propagation.
    Env(Vec<u8>),
}

impl Frame {
    /// Encode this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Data(data) => encode_raw(frame_type::DATA, data),
            Frame::Resize { rows, cols } => {
                let mut payload = [0u8; 4];
                payload[..2].copy_from_slice(&rows.to_be_bytes());
                payload[2..].copy_from_slice(&cols.to_be_bytes());
                encode_raw(frame_type::RESIZE, &payload)
            }
            Frame::Signal(signum) => encode_raw(frame_type::SIGNAL, &[*signum]),
            Frame::Kick => encode_raw(frame_type::KICK, &[]),
            Frame::Mode(role) => encode_raw(frame_type::MODE, &[role.to_byte()]),
            Frame::Env(kv) => encode_raw(frame_type::ENV, kv),
        }
    }

    /// Build an `Env` frame for a single `KEY=VALUE` pair.
    pub fn env(key: &str, value: &str) -> Self {
        Frame::Env(format!("{key}={value}").into_bytes())
    }
}

/// Encode a raw frame with a type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single frame from its type byte and payload.
fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame, SessionError> {
    match frame_type {
        frame_type::DATA => Ok(Frame::Data(payload.to_vec())),
        frame_type::RESIZE => {
            if payload.len() < 4 {
                return Err(SessionError::Protocol(format!(
                    "resize frame too short: {} bytes",
                    payload.len()
                )));
            }
            let rows = u16::from_be_bytes([payload[0], payload[1]]);
            let cols = u16::from_be_bytes([payload[2], payload[3]]);
            Ok(Frame::Resize { rows, cols })
        }
        frame_type::SIGNAL => {
            if payload.is_empty() {
                return Err(SessionError::Protocol("empty signal frame".into()));
            }
            Ok(Frame::Signal(payload[0]))
        }
        frame_type::KICK => Ok(Frame::Kick),
        frame_type::MODE => {
            if payload.is_empty() {
                return Err(SessionError::Protocol("empty mode frame".into()));
            }
            Ok(Frame::Mode(Role::from_byte(payload[0])))
        }
        frame_type::ENV => Ok(Frame::Env(payload.to_vec())),
        other => Err(SessionError::Protocol(format!(
            "unknown frame type: 0x{other:02x}"
        ))),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles stream-style byte reassembly: a frame split across any number
/// of reads decodes once its last byte arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] if a frame is malformed or its
    /// declared payload exceeds [`MAX_PAYLOAD`]. The decoder is unusable
    /// after an error; the connection should be closed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, SessionError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let frame_type = self.buf[0];
            let length =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

            if length > MAX_PAYLOAD {
                return Err(SessionError::Protocol(format!(
                    "oversize payload: {length} bytes (max {MAX_PAYLOAD})"
                )));
            }

            let total = HEADER_LEN + length;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            let frame = decode_frame(frame_type, &self.buf[HEADER_LEN..total])?;
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder holds buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Write one encoded frame to an async stream. Refuses payloads over
/// [`MAX_PAYLOAD`] instead of emitting a frame the peer must reject.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let encoded = frame.encode();
    if encoded.len() - HEADER_LEN > MAX_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame payload exceeds 64 KiB",
        ));
    }
    writer.write_all(&encoded).await
}
