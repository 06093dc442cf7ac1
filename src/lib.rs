//! persishtent — persistent shell sessions.
//!
//! A long-lived daemon owns the controlling PTY of a login shell;
//! terminal front-ends attach and detach over a local Unix socket
//! without terminating the shell. Output is captured into a rotating
//! log set and replayed on reattachment, including the state of
//! full-screen applications.
//!
//! # Crate layout
//!
//! - [`protocol`] — framed messages on the control/data channel
//! - [`registry`] — on-disk session artifacts, liveness, cleanup
//! - [`daemon`] — PTY supervisor, fan-out broadcaster, supervisor loop
//! - [`client`] — attach front-end: raw mode, replay, sync handshake,
//!   prefix-key state machine
//! - [`commands`] — user-facing command fronts
//! - [`config`] — user configuration

pub mod client;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod registry;

pub use config::Config;
pub use error::{ExitReason, Result, SessionError};
pub use registry::{Registry, SessionRecord};
