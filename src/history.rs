//! Bounded undo/redo over persisted snapshot triples.
//!
//! Each table of a session owns an undo and a redo stack of snapshot indices.
//! An index names three files (document, edit log, change log) and is never
//! reused, even after eviction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{EditorError, Result};
use crate::session::{Artifact, SessionFiles, SnapshotPart, TableKind};
use crate::tracking::{ChangeLog, EditLog};

/// Document plus tracking state, captured together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub document: String,
    pub edits: EditLog,
    pub changes: ChangeLog,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStacks {
    /// Oldest first.
    pub undo: Vec<u64>,
    pub redo: Vec<u64>,
    pub next_index: u64,
}

/// Persisted as `undo_state.json`, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryIndex {
    tables: BTreeMap<String, HistoryStacks>,
}

impl HistoryIndex {
    pub fn stacks(&self, kind: TableKind) -> HistoryStacks {
        self.tables.get(kind.as_str()).cloned().unwrap_or_default()
    }

    fn stacks_mut(&mut self, kind: TableKind) -> &mut HistoryStacks {
        self.tables.entry(kind.as_str().to_string()).or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub can_undo: bool,
    pub can_redo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

pub struct History<'a> {
    files: &'a SessionFiles<'a>,
    max_depth: usize,
}

impl<'a> History<'a> {
    pub fn new(files: &'a SessionFiles<'a>, max_depth: usize) -> Self {
        History {
            files,
            max_depth: max_depth.max(1),
        }
    }

    fn load_index(&self) -> Result<HistoryIndex> {
        self.files.load_json(&Artifact::HistoryIndex)
    }

    fn save_index(&self, index: &HistoryIndex) -> Result<()> {
        self.files.save_json(&Artifact::HistoryIndex, index)
    }

    fn write_snapshot(&self, kind: TableKind, index: u64, snapshot: &Snapshot) -> Result<()> {
        let part = |part| Artifact::Snapshot { table: kind, index, part };
        self.files.write(&part(SnapshotPart::Document), &snapshot.document)?;
        self.files.save_json(&part(SnapshotPart::Edits), &snapshot.edits)?;
        self.files.save_json(&part(SnapshotPart::Changes), &snapshot.changes)?;
        Ok(())
    }

    fn read_snapshot(&self, kind: TableKind, index: u64) -> Result<Snapshot> {
        let part = |part| Artifact::Snapshot { table: kind, index, part };
        let document = self
            .files
            .read(&part(SnapshotPart::Document))?
            .ok_or_else(|| EditorError::not_found(format!("{kind} snapshot {index}")))?;
        Ok(Snapshot {
            document,
            edits: self.files.load_json(&part(SnapshotPart::Edits))?,
            changes: self.files.load_json(&part(SnapshotPart::Changes))?,
        })
    }

    fn discard_snapshot(&self, kind: TableKind, index: u64) {
        for part in SnapshotPart::ALL {
            let artifact = Artifact::Snapshot { table: kind, index, part };
            if let Err(e) = self.files.remove(&artifact) {
                warn!(table = %kind, index, error = %e, "failed to remove snapshot file");
            }
        }
    }

    /// Write `snapshot` under a fresh index onto one stack and trim it to the
    /// depth limit.
    ///
    /// Returns the new index and the evicted ones. Evicted files stay on disk
    /// until the index has been saved.
    fn push_onto(
        &self,
        kind: TableKind,
        stacks: &mut HistoryStacks,
        direction: Direction,
        snapshot: &Snapshot,
    ) -> Result<(u64, Vec<u64>)> {
        let index = stacks.next_index;
        stacks.next_index += 1;
        if let Err(e) = self.write_snapshot(kind, index, snapshot) {
            self.discard_snapshot(kind, index);
            return Err(e);
        }

        let stack = match direction {
            Direction::Undo => &mut stacks.undo,
            Direction::Redo => &mut stacks.redo,
        };
        stack.push(index);
        let overflow = stack.len().saturating_sub(self.max_depth);
        let evicted: Vec<u64> = stack.drain(..overflow).collect();
        Ok((index, evicted))
    }

    /// Save the index, then delete the files it no longer names. If saving
    /// fails the freshly written snapshot is removed instead.
    fn commit_index(&self, kind: TableKind, index: &HistoryIndex, written: u64, stale: Vec<u64>) -> Result<()> {
        if let Err(e) = self.save_index(index) {
            self.discard_snapshot(kind, written);
            return Err(e);
        }
        for old in stale {
            debug!(table = %kind, index = old, "discarding snapshot");
            self.discard_snapshot(kind, old);
        }
        Ok(())
    }

    /// Record the state as it was before a mutation. Clears the redo stack.
    ///
    /// # Arguments
    /// * `kind` - Table the mutation applies to
    /// * `before` - Document and tracking state prior to the mutation
    ///
    /// # Returns
    /// * `Result<u64>` - Index assigned to the snapshot
    pub fn push(&self, kind: TableKind, before: &Snapshot) -> Result<u64> {
        let mut index = self.load_index()?;
        let stacks = index.stacks_mut(kind);

        let mut stale = std::mem::take(&mut stacks.redo);
        let (assigned, evicted) = self.push_onto(kind, stacks, Direction::Undo, before)?;
        stale.extend(evicted);
        self.commit_index(kind, &index, assigned, stale)?;
        Ok(assigned)
    }

    /// Restore the newest undo snapshot; `current` moves onto the redo stack.
    ///
    /// Returns `None` when there is nothing to undo.
    pub fn undo(&self, kind: TableKind, current: &Snapshot) -> Result<Option<Snapshot>> {
        self.step(kind, current, Direction::Undo)
    }

    /// Restore the newest redo snapshot; `current` moves onto the undo stack.
    pub fn redo(&self, kind: TableKind, current: &Snapshot) -> Result<Option<Snapshot>> {
        self.step(kind, current, Direction::Redo)
    }

    fn step(&self, kind: TableKind, current: &Snapshot, direction: Direction) -> Result<Option<Snapshot>> {
        let mut index = self.load_index()?;
        let stacks = index.stacks_mut(kind);

        let popped = match direction {
            Direction::Undo => stacks.undo.pop(),
            Direction::Redo => stacks.redo.pop(),
        };
        let Some(popped) = popped else {
            return Ok(None);
        };

        let restored = match self.read_snapshot(kind, popped) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // drop the dangling index so the stack stays usable
                self.discard_snapshot(kind, popped);
                self.save_index(&index)?;
                return Err(e);
            }
        };

        let opposite = match direction {
            Direction::Undo => Direction::Redo,
            Direction::Redo => Direction::Undo,
        };
        let (written, evicted) = self.push_onto(kind, stacks, opposite, current)?;
        let mut stale = vec![popped];
        stale.extend(evicted);
        self.commit_index(kind, &index, written, stale)?;
        debug!(table = %kind, index = popped, ?direction, "restored snapshot");
        Ok(Some(restored))
    }

    pub fn availability(&self, kind: TableKind) -> Result<Availability> {
        let stacks = self.load_index()?.stacks(kind);
        Ok(Availability {
            can_undo: !stacks.undo.is_empty(),
            can_redo: !stacks.redo.is_empty(),
        })
    }

    pub fn stacks(&self, kind: TableKind) -> Result<HistoryStacks> {
        Ok(self.load_index()?.stacks(kind))
    }

    /// Forget every snapshot of `kind`. Indices keep counting up.
    pub fn clear(&self, kind: TableKind) -> Result<()> {
        let mut index = self.load_index()?;
        let stacks = index.stacks_mut(kind);
        let stale: Vec<u64> = stacks.undo.drain(..).chain(stacks.redo.drain(..)).collect();
        self.save_index(&index)?;
        for old in stale {
            self.discard_snapshot(kind, old);
        }
        Ok(())
    }
}
