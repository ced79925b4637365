//! Durable replicated log.
//!
//! Entries are stored one JSON object per line in an append-only file and
//! fsynced before an append returns. A torn final line left by a crash is
//! dropped on open. The commit index lives in a separate small file that is
//! replaced atomically (write temp, fsync, rename).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable node identity.
    pub name: String,
    /// Address the member listens on.
    pub address: String,
}

/// What a log entry does when applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    /// First entry of every log: the founding member, who leads.
    Bootstrap { member: Member },
    /// Admit a new member.
    AddMember { member: Member },
    /// A replicated command of a registered kind.
    Command { kind: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub payload: EntryPayload,
}

/// Append-only, file-backed log. Indexes start at 1 and are contiguous.
#[derive(Debug)]
pub struct DurableLog {
    path: PathBuf,
    file: File,
    /// Length of the fully written prefix of the file.
    len: u64,
    entries: Vec<LogEntry>,
}

impl DurableLog {
    /// Open the log at `path`, creating it if absent.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        let mut valid_len = 0u64;
        let mut torn = false;

        if path.exists() {
            let mut reader = BufReader::new(
                File::open(path).with_context(|| format!("opening {}", path.display()))?,
            );
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = reader.read_until(b'\n', &mut line)?;
                if read == 0 {
                    break;
                }
                // Only newline-terminated records were fully written.
                let Some(record) = line.strip_suffix(b"\n") else {
                    torn = true;
                    break;
                };
                match serde_json::from_slice::<LogEntry>(record) {
                    Ok(entry) if entry.index == entries.len() as u64 + 1 => {
                        valid_len += read as u64;
                        entries.push(entry);
                    }
                    Ok(entry) => anyhow::bail!(
                        "{}: expected index {}, found {}",
                        path.display(),
                        entries.len() + 1,
                        entry.index
                    ),
                    Err(_) => {
                        torn = true;
                        break;
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;

        if torn {
            warn!(
                path = %path.display(),
                kept = entries.len(),
                "Dropping torn entry at the end of the log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: valid_len,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Up to `limit` entries starting at `index`.
    pub fn entries_from(&self, index: u64, limit: usize) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.iter().skip(start).take(limit).cloned().collect()
    }

    /// Append a new entry at the end of the log and return its index.
    pub fn append(&mut self, payload: EntryPayload) -> anyhow::Result<u64> {
        let entry = LogEntry {
            index: self.last_index() + 1,
            payload,
        };
        self.write(std::slice::from_ref(&entry))?;
        self.entries.push(entry);
        Ok(self.last_index())
    }

    /// Append entries received from the leader.
    ///
    /// Entries already present are skipped; the rest must continue the log
    /// without a gap.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        let fresh: Vec<LogEntry> = entries
            .iter()
            .filter(|e| e.index > self.last_index())
            .cloned()
            .collect();
        for (offset, entry) in fresh.iter().enumerate() {
            let expected = self.last_index() + 1 + offset as u64;
            if entry.index != expected {
                anyhow::bail!("gap in log: expected index {expected}, got {}", entry.index);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        self.write(&fresh)?;
        self.entries.extend(fresh);
        Ok(())
    }

    fn write(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        // Bytes past the written prefix belong to a write that failed.
        if self.file.metadata()?.len() != self.len {
            warn!(path = %self.path.display(), "Truncating partial write at the end of the log");
            self.file.set_len(self.len)?;
        }

        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            // Best effort; a leftover tail is cut on the next write or open.
            let _ = self.file.set_len(self.len);
            return Err(e).with_context(|| format!("appending to {}", self.path.display()));
        }
        self.len += buf.len() as u64;
        Ok(())
    }
}

/// Load the persisted commit index, or 0 if none was written yet.
pub fn load_commit_index(path: &Path) -> anyhow::Result<u64> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse()
            .with_context(|| format!("parsing commit index in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the persisted commit index.
pub fn store_commit_index(path: &Path, index: u64) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(index.to_string().as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(query: &str) -> EntryPayload {
        EntryPayload::Command {
            kind: "sql".to_string(),
            data: query.as_bytes().to_vec(),
        }
    }

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            address: format!("{name}.sock"),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut log = DurableLog::open(&path).unwrap();
            assert!(log.is_empty());
            assert_eq!(
                log.append(EntryPayload::Bootstrap {
                    member: member("a")
                })
                .unwrap(),
                1
            );
            assert_eq!(log.append(sql("CREATE TABLE t (x)")).unwrap(), 2);
        }

        let log = DurableLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.get(2).unwrap().payload, sql("CREATE TABLE t (x)"));
        assert!(log.get(0).is_none());
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");
        {
            let mut log = DurableLog::open(&path).unwrap();
            log.append(sql("one")).unwrap();
            log.append(sql("two")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"index":3,"payl"#).unwrap();
        drop(file);

        let mut log = DurableLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.append(sql("three")).unwrap(), 3);

        let log = DurableLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_partial_write_is_cut_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");
        let mut log = DurableLog::open(&path).unwrap();
        log.append(sql("one")).unwrap();

        // What a write interrupted by a full disk leaves behind.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"index":2,"pay"#).unwrap();
        drop(file);

        assert_eq!(log.append(sql("two")).unwrap(), 2);
        assert_eq!(log.append(sql("three")).unwrap(), 3);
        drop(log);

        let log = DurableLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(2).unwrap().payload, sql("two"));
    }

    #[test]
    fn test_append_entries_skips_known_and_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DurableLog::open(&dir.path().join("raft.log")).unwrap();
        log.append(sql("one")).unwrap();

        let incoming = vec![
            LogEntry {
                index: 1,
                payload: sql("one"),
            },
            LogEntry {
                index: 2,
                payload: sql("two"),
            },
        ];
        log.append_entries(&incoming).unwrap();
        assert_eq!(log.last_index(), 2);

        let gap = vec![LogEntry {
            index: 4,
            payload: sql("four"),
        }];
        assert!(log.append_entries(&gap).is_err());
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_entries_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DurableLog::open(&dir.path().join("raft.log")).unwrap();
        for q in ["a", "b", "c"] {
            log.append(sql(q)).unwrap();
        }
        let tail = log.entries_from(2, 10);
        assert_eq!(tail.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(log.entries_from(1, 1).len(), 1);
        assert!(log.entries_from(4, 10).is_empty());
    }

    #[test]
    fn test_commit_index_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit");
        assert_eq!(load_commit_index(&path).unwrap(), 0);
        store_commit_index(&path, 42).unwrap();
        assert_eq!(load_commit_index(&path).unwrap(), 42);
    }
}
