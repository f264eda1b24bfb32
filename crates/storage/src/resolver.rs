//! Commit-time conflict detection
//!
//! Rules:
//! - A transaction conflicts if any of its read conflict ranges intersects the
//!   write conflict ranges of a commit newer than its read version
//! - Blind writes (no read conflict ranges) never conflict
//! - Read versions older than the retained history cannot be checked and are
//!   rejected as too old

use std::collections::VecDeque;

use rywdb_core::{KeyRange, Version};

/// Write conflict ranges of recent commits, oldest first
#[derive(Debug, Default)]
pub struct ConflictResolver {
    history: VecDeque<(Version, Vec<KeyRange>)>,
}

impl ConflictResolver {
    /// Create a resolver with empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// First committed range that conflicts with `read_conflicts`
    pub fn find_conflict(
        &self,
        read_version: Version,
        read_conflicts: &[KeyRange],
    ) -> Option<KeyRange> {
        if read_conflicts.is_empty() {
            return None;
        }
        self.history
            .iter()
            .rev()
            .take_while(|(version, _)| *version > read_version)
            .flat_map(|(_, writes)| writes.iter())
            .find(|written| read_conflicts.iter().any(|read| read.intersects(written)))
            .cloned()
    }

    /// Record the write conflict ranges of a successful commit
    pub fn record(&mut self, version: Version, write_conflicts: Vec<KeyRange>) {
        if !write_conflicts.is_empty() {
            self.history.push_back((version, write_conflicts));
        }
    }

    /// Forget commits at or below `floor`
    pub fn prune(&mut self, floor: Version) {
        while matches!(self.history.front(), Some((v, _)) if *v <= floor) {
            self.history.pop_front();
        }
    }

    /// Number of commits remembered
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True if no commits are remembered
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
