//! Size-bounded rotating writer for the session output log.
//!
//! The active segment lives at the base path (`N.log`); rotation renames
//! it to `N.log.(K_max+1)` and reopens a fresh active segment. At most
//! `max_segments` segments (active + rotated) exist at a time; the oldest
//! rotated segment is dropped to stay under the cap. Indices strictly
//! increase with rotation order but are not guaranteed contiguous.
//!
//! Single-writer: only the PTY reader calls [`Rotator::write`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Append-only log writer that splits output into a bounded number of
/// ordered segments.
#[derive(Debug)]
pub struct Rotator {
    base_path: PathBuf,
    file: File,
    written: u64,
    segment_size: u64,
    max_segments: usize,
    /// Set after a rotation failure: the sink appends forever after,
    /// trading boundedness for not losing output mid-session.
    rotation_disabled: bool,
}

impl Rotator {
    /// Create the sink, truncating any previous active segment.
    pub fn create(base_path: PathBuf, segment_size: u64, max_segments: usize) -> io::Result<Self> {
        let file = open_active(&base_path, false)?;
        Ok(Self {
            base_path,
            file,
            written: 0,
            segment_size,
            max_segments: max_segments.max(1),
            rotation_disabled: false,
        })
    }

    /// Append a chunk, rotating first when it would overflow the active
    /// segment. On rotation failure the sink logs once and degrades to
    /// plain appending.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.rotation_disabled && self.written + buf.len() as u64 > self.segment_size {
            if let Err(e) = self.rotate() {
                log::warn!(
                    "log rotation failed for {}: {e}; appending without rotation",
                    self.base_path.display()
                );
                self.rotation_disabled = true;
                self.file = open_active(&self.base_path, true)?;
            }
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Rename the active segment to the next rotation index, prune the
    /// oldest rotated segments past the cap, and reopen a fresh active
    /// segment.
    fn rotate(&mut self) -> io::Result<()> {
        let mut rotated = self.rotated_segments()?;
        let k_max = rotated.last().map(|(k, _)| *k).unwrap_or(0);

        let target = rotated_path(&self.base_path, k_max + 1);
        fs::rename(&self.base_path, &target)?;
        rotated.push((k_max + 1, target));

        // `max_segments` counts total segments: rotated plus the active
        // one we are about to reopen.
        while rotated.len() + 1 > self.max_segments {
            let (_, oldest) = rotated.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                log::warn!("failed to prune old segment {}: {e}", oldest.display());
            }
        }

        self.file = open_active(&self.base_path, false)?;
        self.written = 0;
        Ok(())
    }

    /// Existing rotated segments for this base path, sorted by index
    /// ascending (oldest first).
    fn rotated_segments(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let dir = self.base_path.parent().unwrap_or_else(|| Path::new("."));
        let base_name = self
            .base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = format!("{base_name}.");

        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(idx) = file_name.strip_prefix(prefix.as_str()) {
                if let Ok(idx) = idx.parse::<u64>() {
                    segments.push((idx, entry.path()));
                }
            }
        }
        segments.sort_by_key(|(idx, _)| *idx);
        Ok(segments)
    }
}

fn rotated_path(base: &Path, index: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn open_active(path: &Path, append: bool) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment_files(dir: &Path, name: &str) -> Vec<String> {
        let mut files: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n == name || n.starts_with(&format!("{name}.")))
            .collect();
        files.sort();
        files
    }

    fn total_bytes(dir: &Path, name: &str) -> u64 {
        segment_files(dir, name)
            .iter()
            .map(|n| fs::metadata(dir.join(n)).unwrap().len())
            .sum()
    }

    #[test]
    fn test_no_rotation_while_segment_fits() {
        let tmp = TempDir::new().unwrap();
        let mut rotator = Rotator::create(tmp.path().join("s.log"), 100, 3).unwrap();
        rotator.write(&[b'a'; 60]).unwrap();
        rotator.write(&[b'b'; 40]).unwrap();
        assert_eq!(segment_files(tmp.path(), "s.log"), vec!["s.log"]);
        assert_eq!(total_bytes(tmp.path(), "s.log"), 100);
    }

    #[test]
    fn test_overflow_triggers_rotation() {
        let tmp = TempDir::new().unwrap();
        let mut rotator = Rotator::create(tmp.path().join("s.log"), 100, 3).unwrap();
        rotator.write(&[b'a'; 100]).unwrap();
        rotator.write(&[b'b'; 10]).unwrap();
        assert_eq!(segment_files(tmp.path(), "s.log"), vec!["s.log", "s.log.1"]);
        assert_eq!(fs::read(tmp.path().join("s.log.1")).unwrap().len(), 100);
        assert_eq!(fs::read(tmp.path().join("s.log")).unwrap(), vec![b'b'; 10]);
    }

    #[test]
    fn test_segment_count_bounded_and_bytes_preserved() {
        let tmp = TempDir::new().unwrap();
        let (b, r) = (100u64, 3usize);
        let mut rotator = Rotator::create(tmp.path().join("s.log"), b, r).unwrap();

        // 3.5 segments worth of output in uneven chunks.
        let m = 350usize;
        let mut sent = 0;
        while sent < m {
            let n = 30.min(m - sent);
            rotator.write(&vec![b'x'; n]).unwrap();
            sent += n;
        }

        let files = segment_files(tmp.path(), "s.log");
        assert!(files.len() <= r, "expected at most {r} segments, got {files:?}");
        let preserved = total_bytes(tmp.path(), "s.log");
        let min_preserved = (m as u64).min((r as u64 - 1) * b);
        assert!(
            preserved >= min_preserved,
            "expected at least {min_preserved} bytes preserved, got {preserved}"
        );
    }

    #[test]
    fn test_rotation_indices_increase_with_age() {
        let tmp = TempDir::new().unwrap();
        let mut rotator = Rotator::create(tmp.path().join("s.log"), 10, 5).unwrap();
        for round in 0..3u8 {
            rotator.write(&vec![b'0' + round; 10]).unwrap();
        }
        rotator.write(b"tail").unwrap();

        // Three full segments rotated in order: .1 oldest, .3 newest.
        assert_eq!(fs::read(tmp.path().join("s.log.1")).unwrap(), vec![b'0'; 10]);
        assert_eq!(fs::read(tmp.path().join("s.log.2")).unwrap(), vec![b'1'; 10]);
        assert_eq!(fs::read(tmp.path().join("s.log.3")).unwrap(), vec![b'2'; 10]);
        assert_eq!(fs::read(tmp.path().join("s.log")).unwrap(), b"tail");
    }

    #[test]
    fn test_indices_continue_after_existing_rotations() {
        let tmp = TempDir::new().unwrap();
        // A leftover high-numbered rotation from a previous run.
        fs::write(tmp.path().join("s.log.7"), b"old").unwrap();

        let mut rotator = Rotator::create(tmp.path().join("s.log"), 10, 5).unwrap();
        rotator.write(&[b'a'; 10]).unwrap();
        rotator.write(b"b").unwrap();

        // New rotation picks 8, not 1: indices are not reused.
        assert!(tmp.path().join("s.log.8").exists());
        assert!(tmp.path().join("s.log.7").exists());
    }

    #[test]
    fn test_oldest_segment_pruned_at_cap() {
        let tmp = TempDir::new().unwrap();
        let mut rotator = Rotator::create(tmp.path().join("s.log"), 10, 3).unwrap();
        for round in 0..4u8 {
            rotator.write(&vec![b'0' + round; 10]).unwrap();
        }
        rotator.write(b"!").unwrap();

        // Four rotations happened but only two rotated segments may
        // remain alongside the active one.
        let files = segment_files(tmp.path(), "s.log");
        assert_eq!(files, vec!["s.log", "s.log.3", "s.log.4"]);
    }

    #[test]
    fn test_active_truncated_on_create() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("s.log"), b"previous run").unwrap();
        let _rotator = Rotator::create(tmp.path().join("s.log"), 10, 3).unwrap();
        assert_eq!(fs::metadata(tmp.path().join("s.log")).unwrap().len(), 0);
    }
}
