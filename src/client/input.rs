//! Keystroke processing for attached front-ends.
//!
//! A one-byte-lookahead state machine around the detach prefix key
//! (default Ctrl-D):
//!
//! ```text
//! prefix, 'd'      detach (stop, nothing sent)
//! prefix, prefix   send one literal prefix byte
//! prefix, <b>      send prefix followed by <b> in a single frame
//! <b>              send <b>
//! ```
//!
//! In read-only mode nothing is ever emitted, but the detach sequence
//! still works. Prefix matching resolves before the literal check, which
//! is why a detach key equal to `'d'` is rejected at config load time.

/// Result of feeding a chunk through the processor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `Data` frame payloads to send, in order. One frame per entry.
    pub payloads: Vec<Vec<u8>>,
    /// True when the detach sequence was recognized; the caller must
    /// close the outgoing stream and stop pumping input.
    pub stop: bool,
}

/// Prefix-key state machine. One per attached connection.
#[derive(Debug)]
pub struct InputProcessor {
    detach_key: u8,
    read_only: bool,
    pending_prefix: bool,
    detached: bool,
}

impl InputProcessor {
    pub fn new(detach_key: u8, read_only: bool) -> Self {
        Self {
            detach_key,
            read_only,
            pending_prefix: false,
            detached: false,
        }
    }

    /// Whether the detach sequence has been seen.
    pub fn detached(&self) -> bool {
        self.detached
    }

    /// Whether a prefix byte is pending a decision.
    pub fn pending_prefix(&self) -> bool {
        self.pending_prefix
    }

    /// Feed a chunk of raw input bytes; returns the frames to emit and
    /// whether the caller should stop.
    pub fn process(&mut self, data: &[u8]) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        for &b in data {
            if self.pending_prefix {
                self.pending_prefix = false;
                if b == b'd' {
                    self.detached = true;
                    outcome.stop = true;
                    return outcome;
                }
                if self.read_only {
                    continue;
                }
                if b == self.detach_key {
                    outcome.payloads.push(vec![self.detach_key]);
                } else {
                    outcome.payloads.push(vec![self.detach_key, b]);
                }
            } else if b == self.detach_key {
                self.pending_prefix = true;
            } else if !self.read_only {
                outcome.payloads.push(vec![b]);
            }
        }
        outcome
    }
}

/// Parse a detach key spec of the form `ctrl-<x>`, where `<x>` is a
/// letter (mapped to 1..=26) or one of `[ \ ] ^ _` (27..=31).
/// Case-insensitive; unknown specs fall back to Ctrl-D (0x04).
pub fn parse_detach_key(spec: &str) -> u8 {
    let spec = spec.to_ascii_lowercase();
    if let Some(key) = spec.strip_prefix("ctrl-") {
        let mut chars = key.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            match c {
                'a'..='z' => return (c as u8) - b'a' + 1,
                '[' => return 27,
                '\\' => return 28,
                ']' => return 29,
                '^' => return 30,
                '_' => return 31,
                _ => {}
            }
        }
    }
    0x04
}
