//! # log
//!
//! why: manage the replicated log of commands, including its compacted prefix
//! relations: owned by node.rs, persisted via persist.rs, shipped in message.rs
//! what: LogEntry struct, Log with an explicit sentinel/base index

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The global index of this entry (the sentinel of a fresh log is 0)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// A placeholder carrying only term/index
    pub fn sentinel(term: u64, index: u64) -> Self {
        Self::new(term, index, Vec::new())
    }
}

/// Ordered, gap-free entries whose first slot is always a sentinel.
///
/// `entries[0]` sits at `base_index`: index 0 for a fresh log, or the
/// last index covered by a snapshot after compaction. Global index `i`
/// lives at `entries[i - base_index]`. The log is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
    base_index: u64,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// A fresh log holding only the index-0 sentinel
    pub fn new() -> Self {
        Self::with_sentinel(LogEntry::sentinel(0, 0))
    }

    /// A log whose first slot is the given sentinel
    pub fn with_sentinel(sentinel: LogEntry) -> Self {
        let base_index = sentinel.index;
        Self {
            entries: vec![LogEntry::sentinel(sentinel.term, sentinel.index)],
            base_index,
        }
    }

    /// Index of the compaction boundary (the sentinel)
    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    /// Term of the compaction boundary (the sentinel)
    pub fn base_term(&self) -> u64 {
        self.entries[0].term
    }

    pub fn sentinel(&self) -> &LogEntry {
        &self.entries[0]
    }

    pub fn last(&self) -> &LogEntry {
        // never empty: the sentinel is always present
        &self.entries[self.entries.len() - 1]
    }

    pub fn last_index(&self) -> u64 {
        self.last().index
    }

    pub fn last_term(&self) -> u64 {
        self.last().term
    }

    /// Number of entries after the sentinel
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    /// True when only the sentinel remains
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index < self.base_index || index > self.last_index() {
            return None;
        }
        Some((index - self.base_index) as usize)
    }

    /// Entry at a global index, if retained (the sentinel counts)
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|i| &self.entries[i])
    }

    /// Term at a global index, if retained
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Entries from `index` through the end (empty if past the end)
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        let start = index.max(self.base_index + 1);
        match self.offset(start) {
            Some(i) => &self.entries[i..],
            None => &[],
        }
    }

    /// All retained entries, sentinel first
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Append one entry; it must sit at `last_index + 1`
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log must stay gap-free");
        self.entries.push(entry);
    }

    /// Discard every entry at or after `index`; the sentinel is kept
    pub fn truncate_suffix(&mut self, index: u64) {
        if index <= self.base_index {
            self.entries.truncate(1);
        } else if let Some(i) = self.offset(index) {
            self.entries.truncate(i);
        }
    }

    /// Drop everything below `index` and turn the entry at `index` into
    /// the new sentinel. No-op if `index` is not retained or not past
    /// the current boundary.
    pub fn compact_to(&mut self, index: u64) {
        if index <= self.base_index {
            return;
        }
        let Some(i) = self.offset(index) else {
            return;
        };
        self.entries.drain(..i);
        self.entries[0].command.clear();
        self.base_index = index;
    }

    /// Install a snapshot boundary received from a leader.
    ///
    /// Entries past the boundary are kept only if the local log has the
    /// boundary entry with the same term; otherwise the log becomes just
    /// the sentinel.
    pub fn install_sentinel(&mut self, sentinel: LogEntry) {
        let keeps_suffix = self.term_at(sentinel.index) == Some(sentinel.term)
            && sentinel.index < self.last_index();
        if keeps_suffix && sentinel.index >= self.base_index {
            let i = (sentinel.index - self.base_index) as usize;
            self.entries.drain(..i);
            self.entries[0] = LogEntry::sentinel(sentinel.term, sentinel.index);
            self.base_index = sentinel.index;
        } else {
            *self = Self::with_sentinel(sentinel);
        }
    }

    /// First retained index (after the sentinel) carrying `term`, at or
    /// before `upto`
    pub fn first_index_of_term(&self, term: u64, upto: u64) -> u64 {
        let mut index = upto;
        while index > self.base_index + 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last retained index carrying `term`
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Check the structural invariants (used after decoding)
    pub fn validate(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("log has no sentinel".into());
        }
        if self.entries[0].index != self.base_index {
            return Err(format!(
                "sentinel index {} != base index {}",
                self.entries[0].index, self.base_index
            ));
        }
        for pair in self.entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(format!("gap between index {} and {}", pair[0].index, pair[1].index));
            }
            if pair[1].term < pair[0].term {
                return Err(format!("term decreases at index {}", pair[1].index));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self.entries.iter().map(|e| format!("{:4}", e.term)).collect();
        write!(f, "[{}..] {}", self.base_index, terms.join("|"))
    }
}
