//! Filesystem-backed registry of session artifacts.
//!
//! Every session named `N` owns a flat set of files in the per-user state
//! directory (default `$HOME/.persishtent`, mode 0700):
//!
//! ```text
//! N.sock            Unix stream socket (control/data channel)
//! N.info            serialized SessionRecord (JSON, human-readable)
//! N.log             active output segment
//! N.log.K           rotated segments, higher K = more recently rotated
//! N.ssh_auth_sock   stable symlink to the last-declared agent socket
//! ```
//!
//! A session is *live* iff its socket accepts a connection within 50 ms
//! AND its recorded pid is signalable. Anything else is stale and gets
//! purged on the next scan.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// How long a liveness probe waits for the daemon to accept.
const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// On-disk identity of a live session.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionRecord {
    /// Session name, `[A-Za-z0-9_-]+`.
    pub name: String,
    /// Pid of the supervisor (daemon) process.
    pub pid: i32,
    /// Display string of the command the session runs.
    pub command: String,
    /// Path of the active log segment.
    pub log_path: PathBuf,
    /// When the daemon started (RFC 3339).
    pub start_time: DateTime<Utc>,
}

/// Reject empty names and anything outside `[A-Za-z0-9_-]+`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SessionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Smallest non-negative integer (decimal, no leading zeros) not already
/// used as a session name.
pub fn next_free_name(used: &HashSet<String>) -> String {
    let mut i: u64 = 0;
    loop {
        let candidate = i.to_string();
        if !used.contains(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

/// Handle to the per-user state directory.
#[derive(Clone, Debug)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Open the default registry (`$HOME/.persishtent`, or the
    /// `PERSISHTENT_DIR` override), creating the directory if needed.
    pub fn open() -> Result<Self> {
        let dir = if let Ok(dir) = std::env::var("PERSISHTENT_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::home_dir()
                .ok_or_else(|| {
                    SessionError::io(
                        "resolving home directory",
                        std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
                    )
                })?
                .join(".persishtent")
        };
        Self::at(dir)
    }

    /// Open a registry rooted at an explicit directory, creating it with
    /// mode 0700 if absent. Idempotent.
    pub fn at(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .map_err(|e| SessionError::io(format!("creating {}", dir.display()), e))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| SessionError::io(format!("securing {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    /// The state directory this registry manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session's stream socket.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.sock"))
    }

    /// Path of the session's active log segment.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.log"))
    }

    /// Path of the session's info file.
    pub fn info_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.info"))
    }

    /// Path of the session's stable ssh-agent symlink.
    pub fn ssh_sock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.ssh_auth_sock"))
    }

    /// Persist a session record. Written to a temp path then renamed so
    /// readers never observe a torn file.
    pub fn write_info(&self, record: &SessionRecord) -> Result<()> {
        let path = self.info_path(&record.name);
        let tmp = self.dir.join(format!("{}.info.tmp", record.name));
        let data = serde_json::to_vec(record)
            .map_err(|e| SessionError::Protocol(format!("serializing session record: {e}")))?;
        fs::write(&tmp, data).map_err(|e| SessionError::io("writing session record", e))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| SessionError::io("securing session record", e))?;
        fs::rename(&tmp, &path).map_err(|e| SessionError::io("publishing session record", e))?;
        Ok(())
    }

    /// Read a session record by name.
    pub fn read_info(&self, name: &str) -> Result<SessionRecord> {
        let path = self.info_path(name);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::NotFound(name.to_string())
            } else {
                SessionError::io("reading session record", e)
            }
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| SessionError::Protocol(format!("parsing session record: {e}")))
    }

    /// Liveness probe: the pid must be signalable (signal 0) and the
    /// socket must accept a connection within 50 ms. Errors count as
    /// stale.
    pub fn is_alive(&self, record: &SessionRecord) -> bool {
        if record.pid <= 0 {
            return false;
        }
        if unsafe { libc::kill(record.pid as libc::pid_t, 0) } != 0 {
            return false;
        }
        probe_socket(&self.socket_path(&record.name), PROBE_TIMEOUT)
    }

    /// Remove every artifact belonging to a session. Best-effort; used on
    /// stale detection and daemon teardown.
    pub fn purge(&self, name: &str) {
        let _ = fs::remove_file(self.socket_path(name));
        let _ = fs::remove_file(self.info_path(name));
        let _ = fs::remove_file(self.ssh_sock_path(name));
        let _ = fs::remove_file(self.log_path(name));
        if let Ok(entries) = fs::read_dir(&self.dir) {
            let prefix = format!("{name}.log.");
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if let Some(idx) = file_name.strip_prefix(prefix.as_str()) {
                    if !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()) {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
    }

    /// Scan for live sessions. Sessions whose liveness check fails are
    /// purged before returning.
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| SessionError::io(format!("scanning {}", self.dir.display()), e))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SessionError::io("scanning state directory", e))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(name) = file_name.strip_suffix(".sock") else {
                continue;
            };
            if validate_name(name).is_err() {
                continue;
            }
            match self.read_info(name) {
                Ok(record) if self.is_alive(&record) => sessions.push(record),
                // Unreadable info or failed probe: stale either way.
                Ok(_) | Err(_) => self.purge(name),
            }
        }
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Remove every artifact file that does not belong to a live session.
    /// Returns the number of files removed.
    pub fn clean(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| SessionError::io(format!("scanning {}", self.dir.display()), e))?;
        let entries: Vec<_> = entries
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| SessionError::io("scanning state directory", e))?;

        // Pass 1: which sessions are actually alive?
        let mut alive: HashSet<String> = HashSet::new();
        for entry in &entries {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(name) = file_name.strip_suffix(".info") {
                if let Ok(record) = self.read_info(name) {
                    if self.is_alive(&record) {
                        alive.insert(name.to_string());
                    }
                }
            }
        }

        // Pass 2: drop artifacts of everything else.
        let mut removed = 0;
        for entry in &entries {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(owner) = artifact_owner(&file_name) else {
                continue;
            };
            if !alive.contains(owner) && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Move every artifact of `old` to the `new` name and rewrite the
    /// name inside the info file. The new name must validate and must not
    /// already be in use.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        if self.info_path(new).exists() || self.socket_path(new).exists() {
            return Err(SessionError::AlreadyExists(new.to_string()));
        }
        if !self.info_path(old).exists() && !self.socket_path(old).exists() {
            return Err(SessionError::NotFound(old.to_string()));
        }

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| SessionError::io(format!("scanning {}", self.dir.display()), e))?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if artifact_owner(&file_name) != Some(old) {
                continue;
            }
            let suffix = &file_name[old.len()..];
            let target = self.dir.join(format!("{new}{suffix}"));
            fs::rename(entry.path(), &target)
                .map_err(|e| SessionError::io(format!("renaming {file_name}"), e))?;
        }

        if let Ok(mut record) = self.read_info(new) {
            record.name = new.to_string();
            record.log_path = self.log_path(new);
            self.write_info(&record)?;
        }
        Ok(())
    }

    /// All log segments for a session, oldest first: rotated segments by
    /// numeric index ascending, then the active segment. This is the
    /// replay order.
    pub fn log_files(&self, name: &str) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| SessionError::io(format!("scanning {}", self.dir.display()), e))?;

        let prefix = format!("{name}.log.");
        let mut rotated: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(idx) = file_name.strip_prefix(prefix.as_str()) {
                if let Ok(idx) = idx.parse::<u64>() {
                    rotated.push((idx, entry.path()));
                }
            }
        }
        rotated.sort_by_key(|(idx, _)| *idx);

        let mut result: Vec<PathBuf> = rotated.into_iter().map(|(_, path)| path).collect();
        let active = self.log_path(name);
        if active.exists() {
            result.push(active);
        }
        Ok(result)
    }

    /// Auto-generate the next free numeric session name.
    pub fn next_autoname(&self) -> Result<String> {
        let used: HashSet<String> = self.list()?.into_iter().map(|r| r.name).collect();
        Ok(next_free_name(&used))
    }
}

/// Map an artifact file name to the session that owns it, or `None` for
/// files the registry does not manage. Session names contain no dots, so
/// the first dot separates name from artifact suffix.
fn artifact_owner(file_name: &str) -> Option<&str> {
    let (name, suffix) = file_name.split_once('.')?;
    if validate_name(name).is_err() {
        return None;
    }
    match suffix {
        "sock" | "info" | "log" | "ssh_auth_sock" => Some(name),
        _ => {
            let idx = suffix.strip_prefix("log.")?;
            if !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()) {
                Some(name)
            } else {
                None
            }
        }
    }
}

/// Attempt a non-blocking Unix-socket connect with a bounded wait.
///
/// Returns true only if the connect completes successfully within the
/// timeout. Used by the liveness probe; a socket file with no listener
/// fails fast with ECONNREFUSED.
pub fn probe_socket(path: &Path, timeout: Duration) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return false;
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return false;
    }

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    let addr_len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;

    let connected = unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

        let rc = libc::connect(fd, &addr as *const _ as *const libc::sockaddr, addr_len);
        if rc == 0 {
            true
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::EINPROGRESS) || errno == Some(libc::EAGAIN) {
                // Connection in flight: wait for writability, then check
                // the final disposition via SO_ERROR.
                let mut pollfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                let ready = libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int);
                if ready > 0 {
                    let mut so_error: libc::c_int = 0;
                    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                    let rc = libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut _ as *mut libc::c_void,
                        &mut len,
                    );
                    rc == 0 && so_error == 0
                } else {
                    false
                }
            } else {
                false
            }
        }
    };

    unsafe { libc::close(fd) };
    connected
}
