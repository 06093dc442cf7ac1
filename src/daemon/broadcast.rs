//! Fan-out broadcaster and per-peer connection handling.
//!
//! The broadcaster owns the set of attached front-ends behind one mutex,
//! plus a distinguished master slot. Each accepted connection gets a read
//! task (the peer handler itself) and a write task fed by an unbounded
//! queue of encoded frames; a peer whose write task has died is evicted
//! on the next publish instead of stalling the producer. Reattachment
//! replays the log, so dropping a struggling peer is safe.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::SessionError;
use crate::protocol::{Frame, FrameDecoder, Role};

struct Peer {
    frame_tx: UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<u64, Peer>,
    master: Option<u64>,
    next_id: u64,
}

/// Internally-synchronized handle to the peer set. Cloned into the PTY
/// reader (the single producer) and every peer handler.
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a peer. A new master atomically displaces the previous
    /// one: the displaced peer is sent a single `Kick` frame and removed,
    /// which closes its stream once the frame has flushed.
    pub fn register(&self, role: Role, frame_tx: UnboundedSender<Vec<u8>>) -> u64 {
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;

        if role == Role::Master {
            if let Some(old) = inner.master.take() {
                if let Some(peer) = inner.peers.remove(&old) {
                    let _ = peer.frame_tx.send(Frame::Kick.encode());
                    log::info!("peer {old} displaced by new master {id}");
                }
            }
            inner.master = Some(id);
        }
        inner.peers.insert(id, Peer { frame_tx });
        id
    }

    /// Drop a peer. Clears the master slot if it held it.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        inner.peers.remove(&id);
        if inner.master == Some(id) {
            inner.master = None;
        }
    }

    /// Whether a peer is still installed (false once displaced or removed).
    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .lock()
            .expect("broadcaster lock poisoned")
            .peers
            .contains_key(&id)
    }

    /// Deliver a chunk of PTY output to every attached peer as a `Data`
    /// frame. Peers whose write task has died are evicted here.
    pub fn publish(&self, data: &[u8]) {
        let encoded = Frame::Data(data.to_vec()).encode();
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");

        let dead: Vec<u64> = inner
            .peers
            .iter()
            .filter(|(_, peer)| peer.frame_tx.send(encoded.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            inner.peers.remove(&id);
            if inner.master == Some(id) {
                inner.master = None;
            }
            log::info!("peer {id} evicted (write side closed)");
        }
    }

    /// Number of currently attached peers.
    pub fn peer_count(&self) -> usize {
        self.inner
            .lock()
            .expect("broadcaster lock poisoned")
            .peers
            .len()
    }

    /// Whether a master is currently installed.
    pub fn has_master(&self) -> bool {
        self.inner
            .lock()
            .expect("broadcaster lock poisoned")
            .master
            .is_some()
    }
}

/// Everything a peer handler needs to act on master frames.
pub struct PeerContext {
    pub broadcaster: Broadcaster,
    /// Input side of the PTY master (one master peer writes at a time).
    pub pty_input: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Master half for window resizes.
    pub pty_master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    /// Shell pid for signal delivery.
    pub child_pid: i32,
    /// The session's stable agent-socket symlink.
    pub ssh_symlink: PathBuf,
}

/// Handle one accepted connection until it disconnects or misbehaves.
///
/// The first frame must be `Mode`; anything else closes the connection.
/// Observer frames are read (to detect disconnect) but ignored. Master
/// frames drive the PTY, the window size, the shell's signals, and the
/// agent-socket symlink.
pub async fn handle_peer(stream: UnixStream, ctx: PeerContext) {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half);

    let role = match frames.next().await {
        Some(Ok(Frame::Mode(role))) => role,
        Some(Ok(_)) => {
            log::warn!("peer rejected: first frame was not Mode");
            return;
        }
        Some(Err(e)) => {
            log::warn!("peer rejected during handshake: {e}");
            return;
        }
        None => return,
    };

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, frame_rx));
    let id = ctx.broadcaster.register(role, frame_tx);
    log::info!("peer {id} attached as {role:?}");

    while let Some(result) = frames.next().await {
        // A displaced master must not keep driving the PTY; dropping the
        // read half here finishes closing its connection.
        if !ctx.broadcaster.contains(id) {
            break;
        }
        match result {
            Ok(frame) => {
                if role == Role::Observer {
                    continue;
                }
                if !apply_master_frame(&ctx, id, frame) {
                    break;
                }
            }
            Err(e) => {
                log::warn!("peer {id} protocol error: {e}");
                break;
            }
        }
    }

    ctx.broadcaster.remove(id);
    log::info!("peer {id} detached");
}

/// Apply one frame from the master peer. Returns false when the handler
/// should stop (PTY gone).
fn apply_master_frame(ctx: &PeerContext, id: u64, frame: Frame) -> bool {
    match frame {
        Frame::Data(data) => {
            let mut writer = ctx.pty_input.lock().expect("pty writer lock poisoned");
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                log::warn!("peer {id}: PTY write failed: {e}");
                return false;
            }
        }
        Frame::Resize { rows, cols } => {
            let master = ctx.pty_master.lock().expect("pty master lock poisoned");
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                log::warn!("peer {id}: resize to {rows}x{cols} failed: {e}");
            }
        }
        Frame::Signal(signum) => {
            log::info!("peer {id}: delivering signal {signum} to shell");
            unsafe {
                libc::kill(ctx.child_pid as libc::pid_t, signum as libc::c_int);
            }
        }
        Frame::Env(kv) => {
            if let Some(target) = kv.strip_prefix(b"SSH_AUTH_SOCK=") {
                rebind_agent_symlink(&ctx.ssh_symlink, target);
            }
        }
        // A repeated Mode or an echoed Kick carries no meaning here.
        Frame::Mode(_) | Frame::Kick => {}
    }
    true
}

/// Atomically repoint the session's stable agent-socket symlink.
fn rebind_agent_symlink(symlink: &std::path::Path, target: &[u8]) {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let target = OsStr::from_bytes(target);
    let _ = std::fs::remove_file(symlink);
    if let Err(e) = std::os::unix::fs::symlink(target, symlink) {
        log::warn!("failed to rebind agent symlink {}: {e}", symlink.display());
    } else {
        log::info!("agent symlink now points at {target:?}");
    }
}

/// Buffered framed reads from one connection's read half.
struct FrameReader {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    queue: VecDeque<Frame>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
        }
    }

    /// Next frame, `None` at EOF or on a read error, `Some(Err)` on a
    /// protocol violation.
    async fn next(&mut self) -> Option<Result<Frame, SessionError>> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Some(Ok(frame));
            }
            match self.reader.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => match self.decoder.feed(&buf[..n]) {
                    Ok(frames) => self.queue.extend(frames),
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}

/// Drain the frame queue onto the socket; exits (closing the stream) when
/// the queue closes or a write fails.
async fn write_loop(mut writer: OwnedWriteHalf, mut frame_rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            log::debug!("peer write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
