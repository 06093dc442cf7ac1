//! Terminal state guard for RAII cleanup.
//!
//! The attach front-end owns the terminal while a session is attached.
//! This guard puts it into raw mode and guarantees restoration on every
//! exit path, including panics: attributes reset, alternate screen left,
//! mouse reporting and bracketed paste disabled, cursor shown, screen
//! cleared, and the prior termios reinstated.

use std::io::{self, Write};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

/// Escape bytes that return the terminal to a sane state regardless of
/// what the session's full-screen applications left enabled.
///
/// ```text
/// ESC [ m          reset attributes
/// ESC [ ?1049 l    leave alternate screen
/// ESC [ ?1000 l    disable mouse X10
/// ESC [ ?1002 l    disable mouse button-event
/// ESC [ ?1003 l    disable mouse any-event
/// ESC [ ?1006 l    disable SGR mouse
/// ESC [ ?2004 l    disable bracketed paste
/// ESC [ ?25 h      show cursor
/// ESC [ H ESC [ 2J home + clear
/// ```
pub const RESTORE_SEQUENCE: &[u8] =
    b"\x1b[m\x1b[?1049l\x1b[?1000l\x1b[?1002l\x1b[?1003l\x1b[?1006l\x1b[?2004l\x1b[?25h\x1b[H\x1b[2J";

/// Write the restoration byte string to stdout, ignoring errors. Safe to
/// call from a panic hook.
pub fn emit_restore_sequence() {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(RESTORE_SEQUENCE);
    let _ = stdout.flush();
}

/// Guard that enables raw mode and restores the terminal on drop
/// (including panics).
#[derive(Debug)]
pub struct RawModeGuard;

impl RawModeGuard {
    /// Put the controlling terminal into raw mode. The prior termios is
    /// remembered by the terminal layer and reinstated on drop.
    pub fn acquire() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // Always attempt restoration, ignoring errors on teardown.
        emit_restore_sequence();
        let _ = disable_raw_mode();
    }
}
