//! Attach front-end: mirrors a session's PTY through the local socket.
//!
//! A linear phased protocol:
//!
//! ```text
//! A  connect        socket missing → NotFound, refused → Unreachable
//! B  handshake      Mode(role), then Env(SSH_AUTH_SOCK) if known
//! C  raw mode       RawModeGuard; restoration on every exit path
//! D  replay         log segments oldest → newest, optionally last N lines
//! E  sync           CPR sentinel + response drain (see `drain`)
//! F  steady state   stdin → Data frames, Data frames → stdout, SIGWINCH → Resize
//! G  termination    detach / Kick / daemon EOF, guard emits the restore bytes
//! ```

pub mod drain;
pub mod guard;
pub mod input;
pub mod tail;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::signal::{SIGHUP, SIGTERM, SIGWINCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::daemon::pty::SESSION_ENV;
use crate::error::{ExitReason, Result, SessionError};
use crate::protocol::{write_frame, Frame, FrameDecoder, Role};
use crate::registry::Registry;
use drain::{drain_responses, DrainResult, CPR_REQUEST};
use guard::RawModeGuard;
use input::InputProcessor;

/// How an attach should behave.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Explicit socket path instead of the registry-derived one.
    pub socket_path: Option<PathBuf>,
    /// Replay the recorded output before going live.
    pub replay: bool,
    /// With `replay`, only the last N lines (0 = everything).
    pub tail: usize,
    /// Attach as a passive observer.
    pub read_only: bool,
}

/// Refuse to start or attach from inside a running session.
pub fn ensure_not_nested() -> Result<()> {
    match std::env::var(SESSION_ENV) {
        Ok(existing) if !existing.is_empty() => Err(SessionError::Nested(existing)),
        _ => Ok(()),
    }
}

/// Attach the calling terminal to a session until it detaches, is
/// kicked, or the session ends.
pub fn attach(
    registry: &Registry,
    config: &Config,
    name: &str,
    opts: &AttachOptions,
) -> Result<ExitReason> {
    let socket_path = opts
        .socket_path
        .clone()
        .unwrap_or_else(|| registry.socket_path(name));
    if !socket_path.exists() {
        return Err(SessionError::NotFound(name.to_string()));
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| SessionError::io("starting attach runtime", e))?;
    runtime.block_on(attach_inner(registry, config, name, opts, &socket_path))
}

async fn attach_inner(
    registry: &Registry,
    config: &Config,
    name: &str,
    opts: &AttachOptions,
    socket_path: &PathBuf,
) -> Result<ExitReason> {
    // Phase A: connect. A socket file nobody listens on is a stale
    // session, not a missing one.
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|_| SessionError::Unreachable(name.to_string()))?;
    let (read_half, mut write_half) = stream.into_split();

    // Phase B: declare our role, then hand over the agent socket so the
    // session's stable symlink follows the newest attacher.
    let role = if opts.read_only {
        Role::Observer
    } else {
        Role::Master
    };
    write_frame(&mut write_half, &Frame::Mode(role))
        .await
        .map_err(|e| SessionError::io("sending mode", e))?;
    if let Ok(agent) = std::env::var("SSH_AUTH_SOCK") {
        if !agent.is_empty() {
            write_frame(&mut write_half, &Frame::env("SSH_AUTH_SOCK", &agent))
                .await
                .map_err(|e| SessionError::io("sending agent socket", e))?;
        }
    }

    // Phase C: raw mode. From here on the guard restores the terminal on
    // every exit path, panics included.
    let _guard = RawModeGuard::acquire().map_err(|e| SessionError::io("entering raw mode", e))?;

    // Phase D: replay recorded output.
    if opts.replay {
        replay_history(registry, name, opts.tail)?;
    }

    // Phase E: the replay may have provoked terminal responses on stdin;
    // request a CPR as a drainable sentinel and swallow them.
    let mut stdin_rx = spawn_stdin_reader();
    {
        let mut stdout = io::stdout();
        stdout
            .write_all(CPR_REQUEST)
            .and_then(|_| stdout.flush())
            .map_err(|e| SessionError::io("writing CPR request", e))?;
    }

    let mut processor = InputProcessor::new(config.detach_byte(), opts.read_only);
    match drain_responses(&mut stdin_rx, &mut processor, &mut write_half)
        .await
        .map_err(|e| SessionError::io("draining terminal responses", e))?
    {
        DrainResult::Continue => {}
        DrainResult::Detach => {
            let _ = write_half.shutdown().await;
            return Ok(ExitReason::Detached);
        }
        DrainResult::StdinClosed => return Ok(ExitReason::Terminated),
    }

    // Phases F and G: bidirectional mirroring until something ends it.
    stream_session(
        read_half,
        write_half,
        stdin_rx,
        processor,
        opts.read_only,
    )
    .await
}

/// Stream the recorded log segments to the terminal in replay order.
fn replay_history(registry: &Registry, name: &str, tail_lines: usize) -> Result<()> {
    let files = registry.log_files(name)?;
    let mut stdout = io::stdout().lock();

    let result = if tail_lines > 0 {
        tail::replay_logs_tail(&files, tail_lines, &mut stdout)
    } else {
        files.iter().try_for_each(|path| {
            // A segment can disappear to rotation between listing and
            // opening; skip it rather than aborting the attach.
            match File::open(path) {
                Ok(mut file) => io::copy(&mut file, &mut stdout).map(|_| ()),
                Err(_) => Ok(()),
            }
        })
    };
    result
        .and_then(|_| stdout.flush())
        .map_err(|e| SessionError::io("replaying session log", e))
}

/// Dedicated blocking reader feeding raw stdin chunks into a channel.
///
/// The thread may outlive the session by one chunk: it exits on the next
/// read once the receiving side is gone.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
    let _ = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
    rx
}

/// Send the current terminal dimensions as a `Resize` frame.
async fn send_resize(writer: &mut OwnedWriteHalf) -> io::Result<()> {
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        write_frame(writer, &Frame::Resize { rows, cols }).await?;
    }
    Ok(())
}

/// The steady-state pumps: stdin through the prefix machine into `Data`
/// frames, daemon `Data` frames onto stdout, window changes into
/// `Resize` frames.
async fn stream_session(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut processor: InputProcessor,
    read_only: bool,
) -> Result<ExitReason> {
    let winch_flag = Arc::new(AtomicBool::new(false));
    let hangup_flag = Arc::new(AtomicBool::new(false));
    if !read_only {
        send_resize(&mut write_half)
            .await
            .map_err(|e| SessionError::io("sending initial resize", e))?;
        signal_hook::flag::register(SIGWINCH, Arc::clone(&winch_flag))
            .map_err(|e| SessionError::io("registering SIGWINCH", e))?;
    }
    // Restore must run even when the terminal goes away under us; the
    // flag turns the signal into a normal exit through the guard.
    signal_hook::flag::register(SIGHUP, Arc::clone(&hangup_flag))
        .map_err(|e| SessionError::io("registering SIGHUP", e))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&hangup_flag))
        .map_err(|e| SessionError::io("registering SIGTERM", e))?;

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut stdout = io::stdout();
    let mut stdin_open = true;
    let mut input_dead = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            chunk = stdin_rx.recv(), if stdin_open => {
                let Some(data) = chunk else {
                    // Keep mirroring output after stdin closes.
                    stdin_open = false;
                    continue;
                };
                let outcome = processor.process(&data);
                if !input_dead {
                    for payload in outcome.payloads {
                        if write_frame(&mut write_half, &Frame::Data(payload)).await.is_err() {
                            // The read side will report what happened
                            // (Kick or daemon teardown).
                            input_dead = true;
                            break;
                        }
                    }
                }
                if outcome.stop {
                    let _ = write_half.shutdown().await;
                    return Ok(ExitReason::Detached);
                }
            }
            read = read_half.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return Ok(ExitReason::Terminated),
                    Ok(n) => n,
                };
                for frame in decoder.feed(&buf[..n])? {
                    match frame {
                        Frame::Data(payload) => {
                            stdout
                                .write_all(&payload)
                                .and_then(|_| stdout.flush())
                                .map_err(|e| SessionError::io("writing to terminal", e))?;
                        }
                        Frame::Kick => return Ok(ExitReason::Kicked),
                        _ => {}
                    }
                }
            }
            _ = ticker.tick() => {
                if hangup_flag.load(Ordering::Relaxed) {
                    return Ok(ExitReason::Terminated);
                }
                if !read_only && winch_flag.swap(false, Ordering::Relaxed) && !input_dead {
                    let _ = send_resize(&mut write_half).await;
                }
            }
        }
    }
}

/// Terminate a session by delivering SIGKILL to its shell through the
/// daemon.
pub fn kill(registry: &Registry, name: &str, socket_override: Option<PathBuf>) -> Result<()> {
    let socket_path = socket_override.unwrap_or_else(|| registry.socket_path(name));
    if !socket_path.exists() {
        return Err(SessionError::NotFound(name.to_string()));
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| SessionError::io("starting kill runtime", e))?;
    runtime.block_on(async {
        let mut stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|_| SessionError::Unreachable(name.to_string()))?;
        // Master mode so the signal is honored.
        write_frame(&mut stream, &Frame::Mode(Role::Master))
            .await
            .map_err(|e| SessionError::io("sending mode", e))?;
        write_frame(&mut stream, &Frame::Signal(libc::SIGKILL as u8))
            .await
            .map_err(|e| SessionError::io("sending kill signal", e))?;
        Ok(())
    })
}
