//! The session daemon: supervisor loop around the PTY, the listener, and
//! the output log.
//!
//! # Architecture
//!
//! ```text
//! run()
//! ├── pty-reader thread: master → rotating log + broadcaster.publish()
//! ├── accept loop (tokio): UnixListener → handle_peer tasks
//! ├── per-peer tasks: frames → PTY input / resize / signal / env
//! └── signal watcher: SIGTERM/SIGINT → kill shell → EOF → teardown
//! ```
//!
//! All long-lived tasks terminate once the PTY master reads EOF (the
//! shell exited) or the listener closes. Teardown removes the transient
//! artifacts (`.sock`, `.info`, `.ssh_auth_sock`); the log set survives
//! until `clean()` purges it.

pub mod broadcast;
pub mod pty;
pub mod rotate;

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use portable_pty::Child;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tokio::net::UnixListener;

use crate::config::Config;
use crate::registry::{Registry, SessionRecord};
use broadcast::{Broadcaster, PeerContext};
use rotate::Rotator;

/// Longest socket path the daemon will bind (sun_path is 104 bytes on
/// macOS, 108 on Linux; use the conservative limit).
const MAX_SOCKET_PATH: usize = 104;

/// Overrides accepted by the internal `daemon` subcommand.
#[derive(Debug, Default)]
pub struct DaemonOptions {
    pub socket_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub command: Option<String>,
}

/// Run a session daemon until its shell exits. Blocks for the lifetime
/// of the session.
pub fn run(registry: &Registry, config: &Config, name: &str, opts: DaemonOptions) -> Result<()> {
    let socket_path = opts
        .socket_path
        .unwrap_or_else(|| registry.socket_path(name));
    let log_path = opts.log_path.unwrap_or_else(|| registry.log_path(name));
    let ssh_symlink = registry.ssh_sock_path(name);

    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            socket_path.display()
        );
    }

    let rotator = Rotator::create(
        log_path.clone(),
        config.segment_size_bytes,
        config.max_segments,
    )
    .with_context(|| format!("Failed to open session log {}", log_path.display()))?;

    // Seed the stable agent symlink from our own environment; attachers
    // rebind it with Env frames later.
    let agent_sock = std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty());
    if let Some(agent) = &agent_sock {
        let _ = std::fs::remove_file(&ssh_symlink);
        if let Err(e) = std::os::unix::fs::symlink(agent, &ssh_symlink) {
            log::warn!("failed to create agent symlink: {e}");
        }
    }

    let shell = pty::spawn_shell(
        name,
        opts.command.as_deref(),
        &config.prompt_prefix,
        agent_sock.as_ref().map(|_| ssh_symlink.as_path()),
        24,
        80,
    )?;

    registry.write_info(&SessionRecord {
        name: name.to_string(),
        pid: std::process::id() as i32,
        command: shell.command.clone(),
        log_path: log_path.clone(),
        start_time: Utc::now(),
    })?;

    // Bind before daemonized callers start polling for the socket.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
    }
    let listener = std::os::unix::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind socket {}", socket_path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    }
    listener.set_nonblocking(true)?;

    log::info!(
        "session '{name}' listening on {} (pid={})",
        socket_path.display(),
        std::process::id()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let listener = UnixListener::from_std(listener)?;
        run_loop(listener, shell, rotator, ssh_symlink.clone()).await
    });

    // Transient artifacts go; the log set stays for later replay/clean.
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(registry.info_path(name));
    let _ = std::fs::remove_file(&ssh_symlink);
    log::info!("session '{name}' torn down");

    result
}

async fn run_loop(
    listener: UnixListener,
    shell: pty::PtyShell,
    rotator: Rotator,
    ssh_symlink: PathBuf,
) -> Result<()> {
    let pty::PtyShell {
        master,
        writer,
        reader,
        child,
        child_pid,
        ..
    } = shell;

    let broadcaster = Broadcaster::new();
    let pty_input = Arc::new(Mutex::new(writer));
    let pty_master = Arc::new(Mutex::new(master));

    // PTY reader: sole owner of the log sink, produces broadcast calls.
    // EOF (or a read failure) is the daemon's shutdown signal.
    let (eof_tx, mut eof_rx) = tokio::sync::oneshot::channel::<()>();
    let reader_handle = spawn_pty_reader(reader, rotator, broadcaster.clone(), eof_tx);

    let term_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term_flag))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&term_flag))?;

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let ctx = PeerContext {
                        broadcaster: broadcaster.clone(),
                        pty_input: Arc::clone(&pty_input),
                        pty_master: Arc::clone(&pty_master),
                        child_pid,
                        ssh_symlink: ssh_symlink.clone(),
                    };
                    tokio::spawn(broadcast::handle_peer(stream, ctx));
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    anyhow::bail!("listener failed: {e}");
                }
            },
            _ = &mut eof_rx => {
                log::info!("PTY closed, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if term_flag.swap(false, Ordering::SeqCst) {
                    log::info!("termination signal received, killing shell (pid={child_pid})");
                    unsafe { libc::kill(child_pid as libc::pid_t, libc::SIGKILL); }
                }
            }
        }
    }
    drop(listener);

    let mut child = child;
    let status = tokio::task::spawn_blocking(move || child.wait()).await??;
    log::info!("shell exited: {status:?}");
    let _ = reader_handle.join();
    Ok(())
}

/// Read the PTY master in ~4 KiB chunks, appending each to the rotating
/// log and fanning it out to attached peers.
fn spawn_pty_reader(
    mut reader: Box<dyn Read + Send>,
    mut rotator: Rotator,
    broadcaster: Broadcaster,
    eof_tx: tokio::sync::oneshot::Sender<()>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            let mut log_unwritable = false;
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !log_unwritable {
                            if let Err(e) = rotator.write(&buf[..n]) {
                                // One diagnostic, then keep serving peers
                                // without a log.
                                eprintln!("persishtent: session log unwritable: {e}");
                                log::error!("session log unwritable: {e}");
                                log_unwritable = true;
                            }
                        }
                        broadcaster.publish(&buf[..n]);
                    }
                    Err(e) => {
                        // EIO is how Linux reports the slave side closing;
                        // that is the normal end of a session.
                        if e.raw_os_error() != Some(libc::EIO) {
                            log::error!("PTY read failed: {e}");
                        }
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        })
        .expect("failed to spawn pty-reader thread")
}
