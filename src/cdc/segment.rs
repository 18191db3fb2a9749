//! CDC segment files.
//!
//! The receiver materializes raw plugin output as a sequence of
//! append-only JSONL files under `cdc/<slot>/`, each named by the LSN of
//! its first entry (16 hex digits, so lexicographic order is LSN order):
//!
//! ```text
//! 00000000015D3A68.jsonl
//! 0000000001600000.jsonl
//! ```
//!
//! Segments rotate at a size threshold, are fsynced before the slot is
//! advanced past their contents, and are deleted once the apply cursor
//! moves beyond them. The receiver is the only writer; the transformer
//! reads them by name and never mutates them.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;

/// Default rotation threshold, one WAL segment's worth of decoded text.
pub const DEFAULT_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;

const SEGMENT_SUFFIX: &str = ".jsonl";

/// One raw change as received from the slot, before plugin parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentEntry {
    pub lsn: Lsn,
    pub xid: Option<i64>,
    pub data: String,
}

/// Appends entries to the current segment, rotating by size.
pub struct SegmentWriter {
    dir: PathBuf,
    max_bytes: u64,
    current: Option<(PathBuf, File, u64)>,
}

impl SegmentWriter {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: max_bytes.max(4096),
            current: None,
        }
    }

    /// Resume appending to the newest existing segment, if any.
    pub fn open_existing(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let mut writer = Self::new(dir, max_bytes);
        if let Some((_, path)) = list_segments(&writer.dir)?.into_iter().next_back() {
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            let size = file
                .metadata()
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?
                .len();
            writer.current = Some((path, file, size));
        }
        Ok(writer)
    }

    /// Append a batch and make it durable. Rotation happens on batch
    /// boundaries so a transaction never straddles a half-synced tail.
    pub fn append(&mut self, entries: &[SegmentEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        if let Some((_, _, size)) = &self.current {
            if *size >= self.max_bytes {
                self.current = None;
            }
        }
        if self.current.is_none() {
            let path = self.dir.join(format!(
                "{}{SEGMENT_SUFFIX}",
                first.lsn.to_segment_name()
            ));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            debug!(segment = %path.display(), "segment opened");
            self.current = Some((path, file, 0));
        }

        let (path, file, size) = self
            .current
            .as_mut()
            .ok_or_else(|| ShuttleError::StreamState("segment writer has no file".into()))?;

        let mut buf = Vec::with_capacity(entries.len() * 128);
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| ShuttleError::StreamState(format!("segment encode: {e}")))?;
            buf.push(b'\n');
        }
        file.write_all(&buf)
            .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
        file.sync_all()
            .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
        *size += buf.len() as u64;
        Ok(())
    }
}

/// Segments in LSN order: `(first_lsn, path)`.
pub fn list_segments(dir: &Path) -> Result<Vec<(Lsn, PathBuf)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(ShuttleError::io(dir.display().to_string(), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| ShuttleError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) else {
            continue;
        };
        if let Some(lsn) = Lsn::from_segment_name(stem) {
            out.push((lsn, entry.path()));
        }
    }
    out.sort_by_key(|(lsn, _)| *lsn);
    Ok(out)
}

/// Read every entry of one segment. A torn final line (crash while
/// appending, before the fsync barrier) is dropped; corruption anywhere
/// else is a protocol error.
pub fn read_segment(path: &Path) -> Result<Vec<SegmentEntry>> {
    let file = File::open(path).map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    let mut lines = reader.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line.map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SegmentEntry>(&line) {
            Ok(entry) => out.push(entry),
            Err(e) if lines.peek().is_none() => {
                warn!(segment = %path.display(), error = %e, "dropping torn final line");
            }
            Err(e) => {
                return Err(ShuttleError::StreamState(format!(
                    "corrupt segment {}: {e}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Delete segments wholly below `cursor`: a segment can go once the next
/// segment starts at or below the cursor (its own entries are then all
/// strictly older). Returns how many were removed.
pub fn purge_below(dir: &Path, cursor: Lsn) -> Result<usize> {
    let segments = list_segments(dir)?;
    let mut removed = 0;
    for window in segments.windows(2) {
        let (_, path) = &window[0];
        let (next_start, _) = &window[1];
        if *next_start <= cursor {
            std::fs::remove_file(path)
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            removed += 1;
        } else {
            break;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lsn: &str, data: &str) -> SegmentEntry {
        SegmentEntry {
            lsn: lsn.parse().unwrap(),
            xid: Some(1),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), DEFAULT_SEGMENT_BYTES);
        let batch = vec![entry("0/100", "BEGIN 1"), entry("0/110", "COMMIT 1")];
        writer.append(&batch).unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0.to_string(), "0/100");

        let read = read_segment(&segments[0].1).unwrap();
        assert_eq!(read, batch);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        // tiny threshold: every batch after the first opens a new segment
        let mut writer = SegmentWriter::new(dir.path(), 4096);
        let filler = "x".repeat(8192);
        writer.append(&[entry("0/100", &filler)]).unwrap();
        writer.append(&[entry("0/200", "small")]).unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].0.to_string(), "0/100");
        assert_eq!(segments[1].0.to_string(), "0/200");
    }

    #[test]
    fn test_open_existing_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = SegmentWriter::new(dir.path(), DEFAULT_SEGMENT_BYTES);
            writer.append(&[entry("0/100", "one")]).unwrap();
        }
        {
            let mut writer =
                SegmentWriter::open_existing(dir.path(), DEFAULT_SEGMENT_BYTES).unwrap();
            writer.append(&[entry("0/200", "two")]).unwrap();
        }
        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(read_segment(&segments[0].1).unwrap().len(), 2);
    }

    #[test]
    fn test_torn_final_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), DEFAULT_SEGMENT_BYTES);
        writer.append(&[entry("0/100", "fine")]).unwrap();
        let (_, path) = &list_segments(dir.path()).unwrap()[0];
        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"lsn\":\"0/200\",\"xid\":1,\"da").unwrap();
        drop(file);

        let read = read_segment(path).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].data, "fine");
    }

    #[test]
    fn test_corruption_in_the_middle_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000000000100.jsonl");
        std::fs::write(&path, "garbage\n{\"lsn\":\"0/200\",\"xid\":null,\"data\":\"x\"}\n")
            .unwrap();
        assert!(read_segment(&path).is_err());
    }

    #[test]
    fn test_purge_below_keeps_active_tail() {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in [
            ("0000000000000100", "a"),
            ("0000000000000200", "b"),
            ("0000000000000300", "c"),
        ] {
            std::fs::write(
                dir.path().join(format!("{name}.jsonl")),
                format!("{{\"lsn\":\"0/{}\",\"xid\":null,\"data\":\"{data}\"}}\n", &name[13..]),
            )
            .unwrap();
        }

        // cursor inside the second segment: only the first can go
        let removed = purge_below(dir.path(), "0/250".parse().unwrap()).unwrap();
        assert_eq!(removed, 1);
        let left = list_segments(dir.path()).unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].0.to_string(), "0/200");

        // cursor far beyond everything: all but the last segment go
        let removed = purge_below(dir.path(), "0/FFFF".parse().unwrap()).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(list_segments(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_list_segments_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_segments(&missing).unwrap().is_empty());
    }
}
