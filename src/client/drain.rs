//! Best-effort swallowing of terminal responses provoked by replay.
//!
//! Replayed output may contain sequences that query the terminal (Device
//! Attributes, cursor position, ...). The terminal answers on stdin, and
//! those answers must not reach the shell as if the user typed them. We
//! cannot distinguish them perfectly, so a Cursor Position Report request
//! is emitted as a drainable sentinel and everything response-shaped on
//! stdin is swallowed inside a bounded window.
//!
//! The loop reads from an injectable channel of stdin chunks, which is
//! also how tests synthesize terminal responses without a real terminal.

use std::io;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc::Receiver;
use tokio::time::Instant;

use crate::client::input::InputProcessor;
use crate::protocol::{write_frame, Frame};

/// Request sent to the terminal before draining: Cursor Position Report.
/// The reply acts as the sentinel that something drainable arrives.
pub const CPR_REQUEST: &[u8] = b"\x1b[6n";

/// Wall-clock bound on the whole drain window.
const DRAIN_DEADLINE: Duration = Duration::from_millis(1000);
/// Inactivity bound before the first swallowed response.
const INITIAL_INACTIVITY: Duration = Duration::from_millis(250);
/// Inactivity bound once at least one response has been swallowed.
const MATCHED_INACTIVITY: Duration = Duration::from_millis(100);
/// Safety cap: beyond this the buffer is flushed as user input.
const DRAIN_CAP: usize = 4096;

/// Outcome of the drain phase.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainResult {
    /// Proceed to the steady-state pumps.
    Continue,
    /// The detach sequence was typed during the drain window.
    Detach,
    /// Stdin closed.
    StdinClosed,
}

/// Locate the first complete terminal response sequence in `data`.
///
/// Returns `(esc_index, length_from_esc)` for:
/// - CSI: `ESC [` ... final byte `0x40..=0x7E`
/// - OSC: `ESC ]` ... `BEL` or ST (`ESC \`)
/// - DCS / APC / PM / title: `ESC {P,_,^,k}` ... ST
/// - any other two-byte escape
pub fn match_terminal_response(data: &[u8]) -> Option<(usize, usize)> {
    let esc_idx = data.iter().position(|&b| b == 0x1b)?;
    let remaining = &data[esc_idx..];
    if remaining.len() < 2 {
        return None;
    }

    match remaining[1] {
        b'[' => {
            for i in 2..remaining.len() {
                if (0x40..=0x7e).contains(&remaining[i]) {
                    return Some((esc_idx, i + 1));
                }
            }
            None
        }
        b']' => {
            for i in 2..remaining.len() {
                if remaining[i] == 0x07 {
                    return Some((esc_idx, i + 1));
                }
                if remaining[i] == b'\\' && remaining[i - 1] == 0x1b {
                    return Some((esc_idx, i + 1));
                }
            }
            None
        }
        b'P' | b'_' | b'^' | b'k' => {
            for i in 2..remaining.len() {
                if remaining[i] == b'\\' && remaining[i - 1] == 0x1b {
                    return Some((esc_idx, i + 1));
                }
            }
            None
        }
        _ => Some((esc_idx, 2)),
    }
}

/// Run the drain loop: swallow terminal responses, forward everything
/// else through the input processor as `Data` frames.
///
/// Exits on inactivity, on the wall-clock deadline, or once the buffer
/// exceeds the safety cap (flushing the remainder as user input).
pub async fn drain_responses<W>(
    stdin_rx: &mut Receiver<Vec<u8>>,
    processor: &mut InputProcessor,
    writer: &mut W,
) -> io::Result<DrainResult>
where
    W: AsyncWrite + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();

    let deadline = tokio::time::sleep(DRAIN_DEADLINE);
    tokio::pin!(deadline);
    let inactivity = tokio::time::sleep(INITIAL_INACTIVITY);
    tokio::pin!(inactivity);

    'drain: loop {
        tokio::select! {
            chunk = stdin_rx.recv() => {
                let Some(chunk) = chunk else {
                    return Ok(DrainResult::StdinClosed);
                };
                buf.extend_from_slice(&chunk);

                while let Some((esc_idx, seq_len)) = match_terminal_response(&buf) {
                    // Bytes before the response are user input.
                    if esc_idx > 0 {
                        let head: Vec<u8> = buf[..esc_idx].to_vec();
                        if forward(&head, processor, writer).await? == DrainResult::Detach {
                            return Ok(DrainResult::Detach);
                        }
                    }
                    buf.drain(..esc_idx + seq_len);
                    inactivity.as_mut().reset(Instant::now() + MATCHED_INACTIVITY);
                }

                // Response-free input does not wait out the window.
                if !buf.is_empty() && !buf.contains(&0x1b) {
                    let pending = std::mem::take(&mut buf);
                    if forward(&pending, processor, writer).await? == DrainResult::Detach {
                        return Ok(DrainResult::Detach);
                    }
                }

                if buf.len() > DRAIN_CAP {
                    break 'drain;
                }
            }
            _ = &mut inactivity => break 'drain,
            _ = &mut deadline => break 'drain,
        }
    }

    // Flush whatever is left as user input.
    if !buf.is_empty() && forward(&buf, processor, writer).await? == DrainResult::Detach {
        return Ok(DrainResult::Detach);
    }
    Ok(DrainResult::Continue)
}

async fn forward<W>(
    bytes: &[u8],
    processor: &mut InputProcessor,
    writer: &mut W,
) -> io::Result<DrainResult>
where
    W: AsyncWrite + Unpin,
{
    let outcome = processor.process(bytes);
    for payload in outcome.payloads {
        write_frame(writer, &Frame::Data(payload)).await?;
    }
    if outcome.stop {
        Ok(DrainResult::Detach)
    } else {
        Ok(DrainResult::Continue)
    }
}
