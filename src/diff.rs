//! Deletion tracking against the post-validation baseline.
//!
//! Deleted content is recovered by diffing identifiers, then shown again as
//! read-only "ghost" markers. Ghosts never carry the item-container or
//! item-data classes and ghost rows carry no row id, so neither the codec nor
//! the mutation engine ever sees them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::document::{ItemId, RowId, TableDocument, ITEM_CONTAINER_CLASS, ROW_NUMBER_CLASS};
use crate::fields;
use crate::markup::{Element, NodeId};

pub const GHOST_ROW_CLASS: &str = "ghost-row";
pub const GHOST_ITEM_CLASS: &str = "ghost-item";
pub const GHOST_VALUE_CLASS: &str = "ghost-value";
pub const DELETED_ROW_CLASS: &str = "deleted-row";
pub const DELETED_ITEM_CLASS: &str = "deleted-item";
pub const GHOST_OF_ATTR: &str = "data-ghost-of";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionDiff {
    /// Row ids present in the baseline but gone from the current document.
    pub deleted_rows: Vec<String>,
    /// Item ids gone from rows that still exist.
    pub deleted_items: Vec<String>,
    /// Baseline text of each deleted item.
    pub deleted_item_values: BTreeMap<String, String>,
    /// Baseline item values of each deleted row, in header order.
    pub deleted_row_values: BTreeMap<String, Vec<Vec<String>>>,
}

impl DeletionDiff {
    pub fn is_empty(&self) -> bool {
        self.deleted_rows.is_empty() && self.deleted_items.is_empty()
    }
}

/// Compare a baseline document with the current one.
///
/// Items of a deleted row are reported with the row, not individually.
pub fn diff(baseline: &TableDocument, current: &TableDocument) -> DeletionDiff {
    let mut result = DeletionDiff::default();

    for row in baseline.rows() {
        let Some(number) = baseline.row_number(row) else {
            continue;
        };
        let row_id = RowId(number);

        match current.find_row(row_id) {
            None => {
                let values = baseline
                    .data_cells(row)
                    .into_iter()
                    .map(|cell| baseline.cell_values(cell))
                    .collect();
                result.deleted_rows.push(row_id.to_string());
                result.deleted_row_values.insert(row_id.to_string(), values);
            }
            Some(current_row) => {
                let live: HashSet<String> = current.item_ids_in(current_row).into_iter().collect();
                for item_id in baseline.item_ids_in(row) {
                    if live.contains(&item_id) {
                        continue;
                    }
                    let value = baseline.item_value(&item_id).unwrap_or_default();
                    result.deleted_item_values.insert(item_id.clone(), value);
                    result.deleted_items.push(item_id);
                }
            }
        }
    }

    result
}

/// Re-insert ghost markers for everything in `diff` into `doc`.
pub fn insert_overlays(doc: &mut TableDocument, diff: &DeletionDiff) {
    let mut rows: Vec<RowId> = diff
        .deleted_rows
        .iter()
        .filter_map(|r| r.parse().ok())
        .collect();
    rows.sort();
    for row in rows {
        let key = row.to_string();
        let values = diff.deleted_row_values.get(&key).cloned().unwrap_or_default();
        insert_ghost_row(doc, row, &values);
    }

    let mut items: Vec<ItemId> = diff
        .deleted_items
        .iter()
        .filter_map(|i| i.parse().ok())
        .collect();
    items.sort();
    for item in items {
        let value = diff
            .deleted_item_values
            .get(&item.to_string())
            .cloned()
            .unwrap_or_default();
        insert_ghost_item(doc, &item, &value);
    }
}

/// Row number of a live row or of the row a ghost stands for.
fn ordinal(doc: &TableDocument, node: NodeId) -> Option<u64> {
    doc.row_number(node).or_else(|| {
        doc.markup
            .attr(node, GHOST_OF_ATTR)
            .and_then(|id| id.parse::<RowId>().ok())
            .map(|r| r.0)
    })
}

fn insert_ghost_row(doc: &mut TableDocument, row: RowId, values: &[Vec<String>]) {
    let row_key = row.to_string();
    let tr = doc.markup.create_element(
        Element::new("tr")
            .with_attr("class", &format!("{GHOST_ROW_CLASS} {DELETED_ROW_CLASS}"))
            .with_attr(GHOST_OF_ATTR, &row_key),
    );
    let label = doc
        .markup
        .create_element(Element::new("td").with_attr("class", ROW_NUMBER_CLASS));
    doc.markup.set_text(label, &(row.0 + 1).to_string());
    doc.markup.append_child(tr, label);

    for (index, field) in doc.fields().to_vec().iter().enumerate() {
        let td = doc.markup.create_element(Element::new("td"));
        let items = values.get(index).cloned().unwrap_or_default();
        let text = fields::join_items(field, &items);
        let span = doc
            .markup
            .create_element(Element::new("span").with_attr("class", GHOST_VALUE_CLASS));
        doc.markup.set_text(span, &text);
        doc.markup.append_child(td, span);
        doc.markup.append_child(tr, td);
    }

    let anchor = doc
        .markup
        .child_elements(doc.body)
        .into_iter()
        .filter(|&n| doc.markup.is_tag(n, "tr"))
        .filter(|&n| ordinal(doc, n).is_some_and(|o| o < row.0))
        .last();
    match anchor {
        Some(prev) => doc.markup.insert_after(prev, tr),
        None => doc.markup.insert_child(doc.body, 0, tr),
    }
}

fn insert_ghost_item(doc: &mut TableDocument, item: &ItemId, value: &str) {
    let Ok(cell) = doc.cell(item.row_id(), &item.field) else {
        return;
    };
    let item_key = item.to_string();

    let ghost = doc.markup.create_element(
        Element::new("span")
            .with_attr("class", &format!("{GHOST_ITEM_CLASS} {DELETED_ITEM_CLASS}"))
            .with_attr(GHOST_OF_ATTR, &item_key),
    );
    let inner = doc
        .markup
        .create_element(Element::new("span").with_attr("class", GHOST_VALUE_CLASS));
    doc.markup.set_text(inner, value);
    doc.markup.append_child(ghost, inner);

    let siblings: Vec<(NodeId, Option<u64>)> = doc
        .markup
        .find_elements(cell, |el| {
            el.has_class(ITEM_CONTAINER_CLASS) || el.has_class(GHOST_ITEM_CLASS)
        })
        .into_iter()
        .map(|n| {
            let id = doc
                .markup
                .attr(n, "id")
                .or_else(|| doc.markup.attr(n, GHOST_OF_ATTR))
                .and_then(|id| id.parse::<ItemId>().ok())
                .map(|id| id.index);
            (n, id)
        })
        .collect();

    let anchor = siblings
        .iter()
        .filter(|(_, index)| index.is_some_and(|i| i < item.index))
        .max_by_key(|(_, index)| *index)
        .map(|(n, _)| *n);

    match (anchor, siblings.first()) {
        (Some(prev), _) => doc.markup.insert_after(prev, ghost),
        (None, Some(&(first, _))) => doc.markup.insert_before(first, ghost),
        (None, None) => doc.markup.insert_child(cell, 0, ghost),
    }
}
