//! The replicated log and its durability seam.
//!
//! [`LogStore`] owns the ordered entries of one node plus the commit
//! watermark. Appends go through a [`PersistBackend`] before they are
//! acknowledged, so "accepted" always means "durable on this node" for
//! whatever medium the backend represents. The default [`MemoryBackend`]
//! keeps the durable copy in process memory.
//!
//! Two invariants are enforced here rather than trusted to callers:
//! entries are contiguous (each append extends the log by exactly one), and
//! nothing at or below the commit watermark is ever rewritten.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::types::{CausalToken, LogIndex, Term};

/// One replicated write. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: LogIndex,
    /// Term of the leader that created the entry.
    pub term: Term,
    pub key: String,
    pub value: String,
    /// Token the writing session supplied, recording what the write causally
    /// followed. `None` for writes outside any session.
    pub causal_token: Option<CausalToken>,
}

/// Durable medium behind the log.
///
/// `persist` runs before an append is reported successful; an error rejects
/// the append. `truncate_after` keeps the durable copy aligned when a
/// follower drops a divergent suffix.
pub trait PersistBackend: Send {
    fn persist(&mut self, entry: &LogEntry) -> io::Result<()>;
    fn truncate_after(&mut self, index: LogIndex) -> io::Result<()>;
}

/// Keeps the "durable" copy as encoded frames in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    frames: Vec<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries the backend holds.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl PersistBackend for MemoryBackend {
    fn persist(&mut self, entry: &LogEntry) -> io::Result<()> {
        let frame = bincode::serialize(entry)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.frames.push(frame);
        Ok(())
    }

    fn truncate_after(&mut self, index: LogIndex) -> io::Result<()> {
        self.frames.truncate(index as usize);
        Ok(())
    }
}

/// The ordered log of one node plus its commit watermark.
pub struct LogStore {
    entries: Vec<LogEntry>,
    commit_index: LogIndex,
    backend: Box<dyn PersistBackend>,
}

impl LogStore {
    pub fn new(backend: Box<dyn PersistBackend>) -> Self {
        Self {
            entries: Vec::new(),
            commit_index: 0,
            backend,
        }
    }

    /// A log store over the in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Appends one entry after persisting it.
    ///
    /// # Errors
    ///
    /// - [`LogError::StaleTerm`] when the entry's term is behind the latest
    ///   term already in the log.
    /// - [`LogError::IndexGap`] when the entry would not directly extend the
    ///   log.
    /// - [`LogError::Persist`] when the backend refuses the entry; the log is
    ///   unchanged in that case.
    pub fn append(&mut self, entry: LogEntry) -> Result<LogIndex, LogError> {
        if entry.term < self.last_term() {
            return Err(LogError::StaleTerm {
                entry_term: entry.term,
                log_term: self.last_term(),
            });
        }
        if entry.index != self.last_index() + 1 {
            return Err(LogError::IndexGap {
                index: entry.index,
                last: self.last_index(),
            });
        }
        self.backend.persist(&entry)?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Returns the entry at `index`, if present. Index 0 is never present.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Index of the newest entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Term of the newest entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    /// Term of the entry at `index`. Index 0 is the empty prefix and reports
    /// term 0; indexes past the end report `None`.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// The highest index known to be durable on a majority of members.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Moves the commit watermark forward to `to` (clamped to the last
    /// index; never moves backward) and returns the newly committed entries
    /// in log order.
    pub fn advance_commit(&mut self, to: LogIndex) -> Vec<LogEntry> {
        let target = to.min(self.last_index());
        if target <= self.commit_index {
            return Vec::new();
        }
        let newly = self.entries[self.commit_index as usize..target as usize].to_vec();
        self.commit_index = target;
        newly
    }

    /// Drops every entry above `index`.
    ///
    /// # Errors
    ///
    /// [`LogError::TruncatesCommitted`] when `index` is below the commit
    /// watermark; committed entries are never rewritten.
    pub fn truncate_after(&mut self, index: LogIndex) -> Result<(), LogError> {
        if index < self.commit_index {
            return Err(LogError::TruncatesCommitted {
                index,
                commit: self.commit_index,
            });
        }
        if index >= self.last_index() {
            return Ok(());
        }
        self.backend.truncate_after(index)?;
        self.entries.truncate(index as usize);
        Ok(())
    }

    /// Newest entry for `key` regardless of commit status. This is the
    /// local-concern read path.
    pub fn latest_for_key(&self, key: &str) -> Option<&LogEntry> {
        self.entries.iter().rev().find(|entry| entry.key == key)
    }

    /// Newest committed entry for `key`.
    pub fn latest_committed_for_key(&self, key: &str) -> Option<&LogEntry> {
        self.entries[..self.commit_index as usize]
            .iter()
            .rev()
            .find(|entry| entry.key == key)
    }

    /// Entries with index at or above `from`, in log order.
    pub fn entries_from(&self, from: LogIndex) -> &[LogEntry] {
        let start = (from.saturating_sub(1) as usize).min(self.entries.len());
        &self.entries[start..]
    }
}
