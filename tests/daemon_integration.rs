//! End-to-end tests against a live session daemon.
//!
//! Each test runs a real daemon (with `cat` or a short script as the
//! session command) in a background thread, against a temporary state
//! directory, and speaks the wire protocol to it over the Unix socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use persishtent::daemon::{self, DaemonOptions};
use persishtent::protocol::{Frame, FrameDecoder, Role};
use persishtent::{Config, Registry};
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Run a daemon in a background thread. Does not wait for the socket;
/// short-lived session commands may finish before it can be observed.
fn spawn_daemon_thread(
    name: &'static str,
    command: &str,
    config: Config,
) -> (TempDir, Registry, thread::JoinHandle<()>) {
    let tmp = TempDir::new().unwrap();
    let registry = Registry::at(tmp.path().to_path_buf()).unwrap();

    let daemon_registry = registry.clone();
    let command = command.to_string();
    let handle = thread::spawn(move || {
        let opts = DaemonOptions {
            socket_path: None,
            log_path: None,
            command: Some(command),
        };
        if let Err(e) = daemon::run(&daemon_registry, &config, name, opts) {
            eprintln!("daemon exited with error: {e:#}");
        }
    });

    (tmp, registry, handle)
}

/// Run a daemon in a background thread and wait for its socket.
fn start_daemon(
    name: &'static str,
    command: &str,
    config: Config,
) -> (TempDir, Registry, thread::JoinHandle<()>) {
    let (tmp, registry, handle) = spawn_daemon_thread(name, command, config);

    let socket_path = registry.socket_path(name);
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while !socket_path.exists() {
        assert!(
            Instant::now() < deadline,
            "daemon socket never appeared at {}",
            socket_path.display()
        );
        thread::sleep(Duration::from_millis(20));
    }

    (tmp, registry, handle)
}

/// A blocking protocol client for tests.
struct TestClient {
    stream: UnixStream,
    decoder: FrameDecoder,
    queue: std::collections::VecDeque<Frame>,
}

impl TestClient {
    fn connect(socket_path: &Path, role: Role) -> Self {
        let stream = UnixStream::connect(socket_path).expect("connect to daemon");
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut client = Self {
            stream,
            decoder: FrameDecoder::new(),
            queue: std::collections::VecDeque::new(),
        };
        client.send(&Frame::Mode(role));
        client
    }

    fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.encode()).expect("send frame");
    }

    /// Next decoded frame within the timeout; `None` on EOF or timeout.
    fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Some(frame);
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => {
                    let frames = self.decoder.feed(&buf[..n]).expect("decode frames");
                    self.queue.extend(frames);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return None,
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Accumulate `Data` payload bytes until the needle shows up.
    fn read_output_until(&mut self, needle: &[u8], timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            if let Some(Frame::Data(payload)) = self.next_frame(Duration::from_millis(200)) {
                collected.extend_from_slice(&payload);
                if collected.windows(needle.len()).any(|w| w == needle) {
                    break;
                }
            }
        }
        collected
    }

    /// True when the daemon has closed this connection.
    fn at_eof(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return true,
            }
        }
        false
    }
}

fn wait_for_exit(handle: thread::JoinHandle<()>, registry: &Registry, name: &str) {
    handle.join().expect("daemon thread panicked");
    assert!(
        !registry.socket_path(name).exists(),
        "socket should be removed after the shell exits"
    );
    assert!(
        !registry.info_path(name).exists(),
        "info file should be removed after the shell exits"
    );
}

#[test]
fn test_master_echo_and_log_capture() {
    let (_tmp, registry, handle) = start_daemon("echo1", "cat", Config::default());
    let mut master = TestClient::connect(&registry.socket_path("echo1"), Role::Master);

    master.send(&Frame::Data(b"hello persistence\n".to_vec()));
    let output = master.read_output_until(b"hello persistence", READ_TIMEOUT);
    let text = String::from_utf8_lossy(&output);
    assert!(
        text.contains("hello persistence"),
        "expected echoed output, got {text:?}"
    );

    // Terminate the shell through the protocol; the daemon tears down.
    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "echo1");

    // The log survives teardown and holds the session transcript.
    let log = std::fs::read(registry.log_path("echo1")).unwrap();
    assert!(
        String::from_utf8_lossy(&log).contains("hello persistence"),
        "log should capture the session output"
    );
}

#[test]
fn test_second_master_kicks_first() {
    let (_tmp, registry, handle) = start_daemon("kick1", "cat", Config::default());
    let socket_path = registry.socket_path("kick1");

    let mut first = TestClient::connect(&socket_path, Role::Master);
    // Make sure the first master is fully installed before the second
    // arrives: a round-trip through the PTY proves it.
    first.send(&Frame::Data(b"marker-a\n".to_vec()));
    assert!(!first.read_output_until(b"marker-a", READ_TIMEOUT).is_empty());

    let mut second = TestClient::connect(&socket_path, Role::Master);

    // The displaced master gets exactly one Kick, then EOF.
    match first.next_frame(READ_TIMEOUT) {
        Some(Frame::Kick) => {}
        other => panic!("expected Kick for displaced master, got {other:?}"),
    }
    assert!(first.at_eof(READ_TIMEOUT), "displaced connection must close");

    // The new master drives the session normally.
    second.send(&Frame::Data(b"marker-b\n".to_vec()));
    let output = second.read_output_until(b"marker-b", READ_TIMEOUT);
    assert!(String::from_utf8_lossy(&output).contains("marker-b"));

    second.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "kick1");
}

#[test]
fn test_observer_receives_output_but_cannot_write() {
    let (_tmp, registry, handle) = start_daemon("ro1", "cat", Config::default());
    let socket_path = registry.socket_path("ro1");

    let mut master = TestClient::connect(&socket_path, Role::Master);
    let mut observer = TestClient::connect(&socket_path, Role::Observer);

    // Observer input must never reach the shell.
    observer.send(&Frame::Data(b"intruder\n".to_vec()));
    // Resize and signal from an observer are ignored too.
    observer.send(&Frame::Resize { rows: 5, cols: 5 });
    observer.send(&Frame::Signal(9));

    master.send(&Frame::Data(b"legit\n".to_vec()));
    let master_out = master.read_output_until(b"legit", READ_TIMEOUT);
    let observer_out = observer.read_output_until(b"legit", READ_TIMEOUT);

    for (who, out) in [("master", &master_out), ("observer", &observer_out)] {
        let text = String::from_utf8_lossy(out);
        assert!(text.contains("legit"), "{who} should see shell output");
        assert!(
            !text.contains("intruder"),
            "{who} must not see observer-injected input"
        );
    }

    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "ro1");
}

#[test]
fn test_first_frame_must_be_mode() {
    let (_tmp, registry, handle) = start_daemon("proto1", "cat", Config::default());

    // A connection that leads with Data instead of Mode gets dropped.
    let mut stream = UnixStream::connect(registry.socket_path("proto1")).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    stream
        .write_all(&Frame::Data(b"sneaky\n".to_vec()).encode())
        .unwrap();

    let deadline = Instant::now() + READ_TIMEOUT;
    let mut buf = [0u8; 256];
    let closed = loop {
        match stream.read(&mut buf) {
            Ok(0) => break true,
            Ok(_) => panic!("daemon must not talk to an unhandshaked peer"),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if Instant::now() >= deadline {
                    break false;
                }
            }
            Err(_) => break true,
        }
    };
    assert!(closed, "connection without Mode should be closed");

    // The session itself is unaffected.
    let mut master = TestClient::connect(&registry.socket_path("proto1"), Role::Master);
    master.send(&Frame::Data(b"still-alive\n".to_vec()));
    assert!(!master.read_output_until(b"still-alive", READ_TIMEOUT).is_empty());

    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "proto1");
}

#[test]
fn test_shell_exit_cleans_transient_artifacts() {
    let (_tmp, registry, handle) =
        spawn_daemon_thread("short1", "echo over-and-out", Config::default());

    // The command exits on its own; no client ever attaches.
    handle.join().expect("daemon thread panicked");
    assert!(!registry.socket_path("short1").exists());
    assert!(!registry.info_path("short1").exists());

    let log = std::fs::read(registry.log_path("short1")).unwrap();
    assert!(String::from_utf8_lossy(&log).contains("over-and-out"));
}

#[test]
fn test_output_rotation_on_disk_set() {
    let config = Config {
        segment_size_bytes: 1024,
        max_segments: 3,
        ..Config::default()
    };
    // ~8 KiB of output through the PTY.
    let command = "i=0; while [ $i -lt 200 ]; do echo 0123456789012345678901234567890123456789; i=$((i+1)); done";
    let (_tmp, registry, handle) = spawn_daemon_thread("rot1", command, config);

    handle.join().expect("daemon thread panicked");

    let files = registry.log_files("rot1").unwrap();
    assert!(
        files.len() <= 3,
        "at most max_segments files may remain, got {files:?}"
    );
    assert!(files.len() >= 2, "rotation should have happened: {files:?}");

    // Rotated indices ascend, the active segment comes last.
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.last().unwrap(), "rot1.log");
    let indices: Vec<u64> = names[..names.len() - 1]
        .iter()
        .map(|n| n.strip_prefix("rot1.log.").unwrap().parse().unwrap())
        .collect();
    let mut sorted = indices.clone();
    sorted.sort_unstable();
    assert_eq!(indices, sorted, "rotated indices must ascend: {names:?}");
}

#[test]
fn test_env_frame_rebinds_agent_symlink() {
    let (_tmp, registry, handle) = start_daemon("env1", "cat", Config::default());
    let mut master = TestClient::connect(&registry.socket_path("env1"), Role::Master);

    master.send(&Frame::env("SSH_AUTH_SOCK", "/tmp/agent-rebound.test"));

    let symlink = registry.ssh_sock_path("env1");
    let deadline = Instant::now() + READ_TIMEOUT;
    let target = loop {
        if let Ok(target) = std::fs::read_link(&symlink) {
            break target;
        }
        assert!(Instant::now() < deadline, "agent symlink never appeared");
        thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(target, std::path::PathBuf::from("/tmp/agent-rebound.test"));

    // Unrecognized variables are ignored rather than breaking the link.
    master.send(&Frame::env("SOMETHING_ELSE", "/tmp/other"));
    master.send(&Frame::Data(b"sync\n".to_vec()));
    assert!(!master.read_output_until(b"sync", READ_TIMEOUT).is_empty());
    assert_eq!(
        std::fs::read_link(&symlink).unwrap(),
        std::path::PathBuf::from("/tmp/agent-rebound.test")
    );

    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "env1");
}

#[test]
fn test_resize_frame_reaches_the_pty() {
    // The shell reports its window size on every input line, so the
    // test can observe the Resize frame taking effect.
    let command = "while read line; do stty size; done";
    let (_tmp, registry, handle) = start_daemon("resize1", command, Config::default());
    let mut master = TestClient::connect(&registry.socket_path("resize1"), Role::Master);

    master.send(&Frame::Resize {
        rows: 48,
        cols: 172,
    });
    // Give the winsize ioctl a moment before asking.
    thread::sleep(Duration::from_millis(200));
    master.send(&Frame::Data(b"\n".to_vec()));

    let output = master.read_output_until(b"48 172", READ_TIMEOUT);
    assert!(
        String::from_utf8_lossy(&output).contains("48 172"),
        "window size not applied, got {:?}",
        String::from_utf8_lossy(&output)
    );

    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "resize1");
}

#[test]
fn test_registry_lists_live_daemon() {
    let (_tmp, registry, handle) = start_daemon("list1", "cat", Config::default());

    let sessions = registry.list().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "list1");
    assert!(sessions[0].pid > 0);

    let mut master = TestClient::connect(&registry.socket_path("list1"), Role::Master);
    master.send(&Frame::Signal(9));
    wait_for_exit(handle, &registry, "list1");

    assert!(registry.list().unwrap().is_empty());
}
