//! Last-N-lines replay over the session's log segments.
//!
//! Files are read backwards in 4 KiB windows counting newline bytes. The
//! very last byte of the stream, when it is a newline, terminates the
//! final line rather than starting an empty one, so it does not count
//! toward the requested N.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Window size for backwards scanning.
const WINDOW: u64 = 4096;

/// Write the last `n` newline-terminated lines of `file` to `out`; the
/// whole file when it has fewer. With `skip_trailing`, a newline as the
/// file's final byte is not counted (set for the newest segment, whose
/// end is the end of the stream).
pub fn replay_tail(
    file: &mut File,
    n: usize,
    out: &mut impl Write,
    skip_trailing: bool,
) -> io::Result<()> {
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok(());
    }

    let mut collected: Vec<u8> = Vec::new();
    let mut lines = 0usize;
    let mut end = size;

    while end > 0 {
        let start = end.saturating_sub(WINDOW);
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;

        for i in (0..buf.len()).rev() {
            if buf[i] != b'\n' {
                continue;
            }
            if skip_trailing && start + i as u64 == size - 1 {
                continue;
            }
            lines += 1;
            if lines >= n {
                out.write_all(&buf[i + 1..])?;
                out.write_all(&collected)?;
                return Ok(());
            }
        }

        let mut merged = buf;
        merged.extend_from_slice(&collected);
        collected = merged;
        end = start;
    }

    // Fewer than n lines in the whole file.
    out.write_all(&collected)
}

/// Replay the last `n` lines of the concatenated log stream (segments
/// oldest → newest). Counts terminators per segment from the newest
/// backwards, then tails the boundary segment and copies everything
/// after it verbatim.
pub fn replay_logs_tail(paths: &[PathBuf], n: usize, out: &mut impl Write) -> io::Result<()> {
    if paths.is_empty() || n == 0 {
        return Ok(());
    }

    let mut stats = Vec::with_capacity(paths.len());
    for path in paths {
        stats.push(count_terminators(path)?);
    }

    // Which segment holds the n-th terminator from the end of the stream?
    let newest = paths.len() - 1;
    let mut remaining = n;
    let mut boundary = None;
    for i in (0..paths.len()).rev() {
        let (terminators, ends_with_newline) = stats[i];
        let effective = if i == newest && ends_with_newline {
            terminators - 1
        } else {
            terminators
        };
        if effective >= remaining as u64 {
            boundary = Some(i);
            break;
        }
        remaining -= effective as usize;
    }

    match boundary {
        None => {
            // The stream has fewer than n lines: replay everything.
            for path in paths {
                let mut file = File::open(path)?;
                io::copy(&mut file, out)?;
            }
        }
        Some(i) => {
            let mut file = File::open(&paths[i])?;
            replay_tail(&mut file, remaining, out, i == newest)?;
            for path in &paths[i + 1..] {
                let mut file = File::open(path)?;
                io::copy(&mut file, out)?;
            }
        }
    }
    Ok(())
}

/// Count newline bytes in a file and whether the final byte is one.
fn count_terminators(path: &PathBuf) -> io::Result<(u64, bool)> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    let mut count = 0u64;
    let mut last_byte = 0u8;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last_byte = buf[n - 1];
    }
    Ok((count, last_byte == b'\n'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tail_of(content: &[u8], n: usize) -> Vec<u8> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, content).unwrap();
        let mut file = File::open(&path).unwrap();
        let mut out = Vec::new();
        replay_tail(&mut file, n, &mut out, true).unwrap();
        out
    }

    #[test]
    fn test_whole_file_when_n_covers_it() {
        assert_eq!(tail_of(b"a\nb\nc\n", 3), b"a\nb\nc\n");
        assert_eq!(tail_of(b"a\nb\nc\n", 100), b"a\nb\nc\n");
    }

    #[test]
    fn test_suffix_after_selected_newline() {
        assert_eq!(tail_of(b"a\nb\nc\n", 1), b"c\n");
        assert_eq!(tail_of(b"a\nb\nc\n", 2), b"b\nc\n");
    }

    #[test]
    fn test_trailing_newline_not_counted() {
        // With and without a trailing newline, "last 1 line" means the
        // same final line.
        assert_eq!(tail_of(b"a\nb\nc", 1), b"c");
        assert_eq!(tail_of(b"a\nb\nc\n", 1), b"c\n");
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(tail_of(b"", 3), b"");
    }

    #[test]
    fn test_single_line_no_newline() {
        assert_eq!(tail_of(b"lonely", 1), b"lonely");
        assert_eq!(tail_of(b"lonely", 5), b"lonely");
    }

    #[test]
    fn test_tail_spans_multiple_windows() {
        // Build a file several windows long with numbered lines.
        let mut content = Vec::new();
        for i in 0..2000 {
            content.extend_from_slice(format!("line-{i:05}\n").as_bytes());
        }
        assert!(content.len() as u64 > 3 * WINDOW);

        let out = tail_of(&content, 5);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "line-01995",
                "line-01996",
                "line-01997",
                "line-01998",
                "line-01999"
            ]
        );
    }

    #[test]
    fn test_multi_segment_tail_within_newest() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("s.log.1");
        let new = tmp.path().join("s.log");
        std::fs::write(&old, b"one\ntwo\n").unwrap();
        std::fs::write(&new, b"three\nfour\n").unwrap();

        let mut out = Vec::new();
        replay_logs_tail(&[old, new], 2, &mut out).unwrap();
        assert_eq!(out, b"three\nfour\n");
    }

    #[test]
    fn test_multi_segment_tail_crosses_boundary() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("s.log.1");
        let new = tmp.path().join("s.log");
        std::fs::write(&old, b"one\ntwo\n").unwrap();
        std::fs::write(&new, b"three\nfour\n").unwrap();

        let mut out = Vec::new();
        replay_logs_tail(&[old, new], 3, &mut out).unwrap();
        assert_eq!(out, b"two\nthree\nfour\n");
    }

    #[test]
    fn test_multi_segment_tail_exceeding_stream_replays_all() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("s.log.1");
        let new = tmp.path().join("s.log");
        std::fs::write(&old, b"one\n").unwrap();
        std::fs::write(&new, b"two\n").unwrap();

        let mut out = Vec::new();
        replay_logs_tail(&[old, new], 10, &mut out).unwrap();
        assert_eq!(out, b"one\ntwo\n");
    }

    #[test]
    fn test_line_split_across_segments() {
        // "par" + "tial\nend\n": the split line belongs to the stream,
        // not to either file alone.
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("s.log.1");
        let new = tmp.path().join("s.log");
        std::fs::write(&old, b"first\npar").unwrap();
        std::fs::write(&new, b"tial\nend\n").unwrap();

        let mut out = Vec::new();
        replay_logs_tail(&[old.clone(), new.clone()], 2, &mut out).unwrap();
        assert_eq!(out, b"partial\nend\n");
    }
}
