//! Per-table edit and change tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Original and latest value of an edited item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditState {
    pub item_id: String,
    pub original_value: String,
    pub edited_value: String,
    pub edited: bool,
    pub timestamp: DateTime<Utc>,
}

/// Item id → edit state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditLog {
    entries: BTreeMap<String, EditState>,
}

impl EditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit. The first edit of an item fixes its original value.
    pub fn record(&mut self, item_id: &str, original: &str, edited: &str) {
        let now = Utc::now();
        self.entries
            .entry(item_id.to_string())
            .and_modify(|state| {
                state.edited_value = edited.to_string();
                state.edited = true;
                state.timestamp = now;
            })
            .or_insert_with(|| EditState {
                item_id: item_id.to_string(),
                original_value: original.to_string(),
                edited_value: edited.to_string(),
                edited: true,
                timestamp: now,
            });
    }

    pub fn forget(&mut self, item_id: &str) -> Option<EditState> {
        self.entries.remove(item_id)
    }

    /// Drop every entry of row `row_number`.
    pub fn forget_row(&mut self, row_number: u64) {
        let prefix = format!("{row_number}-");
        self.entries.retain(|id, _| !id.starts_with(&prefix));
    }

    pub fn get(&self, item_id: &str) -> Option<&EditState> {
        self.entries.get(item_id)
    }

    pub fn edited_ids(&self) -> impl Iterator<Item = &str> {
        self.entries
            .values()
            .filter(|s| s.edited)
            .map(|s| s.item_id.as_str())
    }

    pub fn edited(&self) -> impl Iterator<Item = &EditState> {
        self.entries.values().filter(|s| s.edited)
    }

    pub fn edited_count(&self) -> usize {
        self.edited().count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChangeState {
    pub row_id: String,
    pub added: bool,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedItemState {
    pub item_id: String,
    pub row_id: String,
    pub field: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Row additions/deletions and item removals since the last validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub rows: BTreeMap<String, RowChangeState>,
    pub items: BTreeMap<String, DeletedItemState>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_added(&mut self, row_id: &str) {
        self.rows.insert(
            row_id.to_string(),
            RowChangeState {
                row_id: row_id.to_string(),
                added: true,
                deleted: false,
                timestamp: Utc::now(),
            },
        );
    }

    /// Mark a row deleted. Deleting a row added in this session forgets it.
    pub fn row_deleted(&mut self, row_id: &str) {
        if self.rows.get(row_id).is_some_and(|r| r.added) {
            self.rows.remove(row_id);
        } else {
            self.rows.insert(
                row_id.to_string(),
                RowChangeState {
                    row_id: row_id.to_string(),
                    added: false,
                    deleted: true,
                    timestamp: Utc::now(),
                },
            );
        }
        let prefix = row_id.trim_start_matches("row").to_string() + "-";
        self.items.retain(|id, _| !id.starts_with(&prefix));
    }

    pub fn item_deleted(&mut self, item_id: &str, row_id: &str, field: &str, value: &str) {
        self.items.insert(
            item_id.to_string(),
            DeletedItemState {
                item_id: item_id.to_string(),
                row_id: row_id.to_string(),
                field: field.to_string(),
                value: value.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// A re-created item id is live again.
    pub fn item_restored(&mut self, item_id: &str) {
        self.items.remove(item_id);
    }

    pub fn added_rows(&self) -> impl Iterator<Item = &str> {
        self.rows
            .values()
            .filter(|r| r.added)
            .map(|r| r.row_id.as_str())
    }

    pub fn deleted_rows(&self) -> impl Iterator<Item = &str> {
        self.rows
            .values()
            .filter(|r| r.deleted)
            .map(|r| r.row_id.as_str())
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.items.is_empty()
    }
}
