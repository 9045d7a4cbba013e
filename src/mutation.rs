//! Atomic edits on a table document.
//!
//! Every operation validates its target before touching the tree, so a failed
//! call leaves the document exactly as it was. Identifiers are never reissued:
//! the table and each cell carry a high-water mark that only grows.

use serde::Serialize;
use tracing::debug;

use crate::document::{ItemId, RowId, TableDocument, NEXT_INDEX_ATTR, NEXT_ROW_ATTR};
use crate::error::{EditorError, Result};
use crate::fields;
use crate::markup::{Element, NodeId};

/// Result of setting an item's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueChange {
    pub item_id: String,
    pub previous: String,
    /// The item was blanked on a multi-value field and removed.
    pub pruned: bool,
    /// Fresh item created when pruning emptied the cell.
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedItem {
    pub item_id: String,
    pub value: String,
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearedCell {
    pub removed: Vec<(String, String)>,
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedRow {
    pub row_id: String,
    pub item_ids: Vec<String>,
}

impl TableDocument {
    fn container_for(&self, item_id: &str) -> Result<(ItemId, NodeId)> {
        let id: ItemId = item_id.parse()?;
        let container = self
            .find_item(item_id)
            .ok_or_else(|| EditorError::not_found(format!("item '{item_id}'")))?;
        Ok((id, container))
    }

    fn cell_for_container(&self, container: NodeId) -> Result<NodeId> {
        self.cell_of(container)
            .ok_or_else(|| EditorError::parse("item container outside of a table cell"))
    }

    fn stored_mark(&self, node: NodeId, attr: &str) -> u64 {
        self.markup
            .attr(node, attr)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn set_mark(&mut self, node: NodeId, attr: &str, value: u64) {
        if let Some(el) = self.markup.element_mut(node) {
            el.set_attr(attr, &value.to_string());
        }
    }

    /// Smallest index never handed out in `cell`.
    fn next_item_index(&self, cell: NodeId) -> u64 {
        let live = self
            .item_containers(cell)
            .into_iter()
            .filter_map(|c| self.container_id(c))
            .map(|id| id.index + 1)
            .max()
            .unwrap_or(0);
        live.max(self.stored_mark(cell, NEXT_INDEX_ATTR))
    }

    /// Smallest row number never handed out in this table.
    fn next_row_number(&self) -> u64 {
        let live = self
            .row_ids()
            .into_iter()
            .map(|r| r.0 + 1)
            .max()
            .unwrap_or(0);
        live.max(self.stored_mark(self.table, NEXT_ROW_ATTR))
    }

    /// Remove the trailing separator of the cell's last container.
    fn tidy_separators(&mut self, cell: NodeId) {
        if let Some(&last) = self.item_containers(cell).last() {
            self.detach_separator(last);
        }
    }

    /// Replace every container of `cell` with one empty `-0` container.
    ///
    /// Returns the removed `(id, value)` pairs and the new id.
    fn reset_cell(&mut self, cell: NodeId, row: u64, field: &str) -> (Vec<(String, String)>, String) {
        let containers = self.item_containers(cell);
        let mark = self.next_item_index(cell).max(1);

        let fresh_id = ItemId::new(row, field, 0);
        let fresh = self.new_item_container(&fresh_id, "");
        match containers.first() {
            Some(&first) => self.markup.insert_before(first, fresh),
            None => self.markup.append_child(cell, fresh),
        }

        let removed = containers
            .into_iter()
            .map(|c| {
                let id = self.markup.attr(c, "id").unwrap_or_default().to_string();
                let value = self.container_value(c);
                self.markup.detach(c);
                (id, value)
            })
            .collect();
        self.set_mark(cell, NEXT_INDEX_ATTR, mark);
        (removed, fresh_id.to_string())
    }

    /// Detach one container, keeping separators and the one-container minimum.
    fn detach_container(&mut self, id: &ItemId, container: NodeId) -> Result<Option<String>> {
        let cell = self.cell_for_container(container)?;
        let mark = self.next_item_index(cell);
        self.markup.detach(container);
        self.set_mark(cell, NEXT_INDEX_ATTR, mark);

        if self.item_containers(cell).is_empty() {
            let (_, created) = self.reset_cell(cell, id.row, &id.field);
            return Ok(Some(created));
        }
        self.tidy_separators(cell);
        Ok(None)
    }

    /// Replace an item's displayed text.
    ///
    /// Blanking an item of a multi-value field removes it instead; if it was
    /// the cell's only item the cell is reset to one empty item.
    ///
    /// # Arguments
    /// * `item_id` - `{row}-{field}-{index}` identifier of the item
    /// * `value` - New text
    ///
    /// # Returns
    /// * `Result<ValueChange>` - Previous value and any pruning that happened
    pub fn set_item_value(&mut self, item_id: &str, value: &str) -> Result<ValueChange> {
        let (id, container) = self.container_for(item_id)?;
        let previous = self.container_value(container);

        if value.trim().is_empty() && fields::is_multi_value(&id.field) {
            let created = self.detach_container(&id, container)?;
            debug!(item = item_id, "pruned blank multi-value item");
            return Ok(ValueChange {
                item_id: item_id.to_string(),
                previous,
                pruned: true,
                created,
            });
        }

        let value_node = match self.value_node(container) {
            Some(node) => node,
            None => {
                let node = self.markup.create_element(
                    Element::new("span").with_attr("class", crate::document::ITEM_VALUE_CLASS),
                );
                self.markup.insert_child(container, 0, node);
                node
            }
        };
        self.markup.set_text(value_node, value);

        Ok(ValueChange {
            item_id: item_id.to_string(),
            previous,
            pruned: false,
            created: None,
        })
    }

    /// Append a new item at the end of the reference item's cell.
    ///
    /// # Arguments
    /// * `reference` - Any item of the target cell
    /// * `separator` - Separator text; defaults to the field's own separator
    /// * `value` - Initial text, empty when `None`
    ///
    /// # Returns
    /// * `Result<String>` - Identifier of the new item
    pub fn append_item(
        &mut self,
        reference: &str,
        separator: Option<&str>,
        value: Option<&str>,
    ) -> Result<String> {
        let (id, container) = self.container_for(reference)?;
        let field_separator = fields::separator(&id.field).ok_or_else(|| {
            EditorError::invalid(format!("field '{}' holds a single value", id.field))
        })?;
        let separator = separator.unwrap_or(field_separator);

        let cell = self.cell_for_container(container)?;
        let index = self.next_item_index(cell);
        let new_id = ItemId::new(id.row, &id.field, index);

        let last = self.item_containers(cell).last().copied().unwrap_or(container);
        let fresh = self.new_item_container(&new_id, value.unwrap_or(""));
        self.attach_separator(last, separator);
        self.markup.insert_after(last, fresh);
        self.set_mark(cell, NEXT_INDEX_ATTR, index + 1);

        Ok(new_id.to_string())
    }

    /// Delete an item container. A missing item is not an error.
    pub fn remove_item(&mut self, item_id: &str) -> Result<Option<RemovedItem>> {
        let id: ItemId = item_id.parse()?;
        let Some(container) = self.find_item(item_id) else {
            return Ok(None);
        };
        let value = self.container_value(container);
        let created = self.detach_container(&id, container)?;
        Ok(Some(RemovedItem {
            item_id: item_id.to_string(),
            value,
            created,
        }))
    }

    /// Reset a cell to a single empty item with index 0.
    pub fn clear_cell(&mut self, row: RowId, field: &str) -> Result<ClearedCell> {
        let cell = self.cell(row, field)?;
        let (removed, created) = self.reset_cell(cell, row.0, field);
        Ok(ClearedCell { removed, created })
    }

    /// Remove a row. Returns `false` when the row did not exist.
    pub fn delete_row(&mut self, row: RowId) -> bool {
        let Some(node) = self.find_row(row) else {
            return false;
        };
        let mark = self.next_row_number().max(row.0 + 1);
        self.markup.detach(node);
        self.set_mark(self.table, NEXT_ROW_ATTR, mark);
        true
    }

    /// Append an empty row under the next unused row number.
    pub fn add_row(&mut self) -> AddedRow {
        let number = self.next_row_number();
        let row = self.build_row(number, &[]);
        self.markup.append_child(self.body, row);
        self.set_mark(self.table, NEXT_ROW_ATTR, number + 1);

        let item_ids = self
            .fields()
            .iter()
            .map(|f| ItemId::new(number, f, 0).to_string())
            .collect();
        AddedRow {
            row_id: RowId(number).to_string(),
            item_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::document::tests::SAMPLE;
    use crate::document::SEPARATOR_CLASS;

    fn sample() -> TableDocument {
        TableDocument::parse(SAMPLE).unwrap()
    }

    fn separators_in(doc: &TableDocument, row: u64, field: &str) -> usize {
        let cell = doc.cell(RowId(row), field).unwrap();
        doc.markup()
            .find_elements(cell, |el| el.has_class(SEPARATOR_CLASS))
            .len()
    }

    fn reparse(doc: &TableDocument) -> TableDocument {
        TableDocument::parse(&doc.to_html()).unwrap()
    }

    #[test]
    fn blanking_a_multi_value_item_prunes_it() {
        let mut doc = sample();
        let change = doc.set_item_value("0-author-1", "  ").unwrap();
        assert!(change.pruned);
        assert_eq!(change.previous, "Jones");
        assert!(doc.find_item("0-author-1").is_none());
        assert_eq!(separators_in(&doc, 0, "author"), 0);

        let rows = codec::parse_document(&reparse(&doc));
        assert_eq!(rows.joined(0, "author").as_deref(), Some("Smith"));
    }

    #[test]
    fn blanking_the_only_item_leaves_an_empty_slot() {
        let mut doc = sample();
        let change = doc.set_item_value("1-author-0", "").unwrap();
        assert!(change.pruned);
        assert_eq!(change.created.as_deref(), Some("1-author-0"));
        assert_eq!(doc.item_value("1-author-0").as_deref(), Some(""));
    }

    #[test]
    fn single_value_fields_keep_blank_values() {
        let mut doc = sample();
        let change = doc.set_item_value("0-title-0", "").unwrap();
        assert!(!change.pruned);
        assert_eq!(doc.item_value("0-title-0").as_deref(), Some(""));
    }

    #[test]
    fn set_value_reports_missing_and_malformed_ids() {
        let mut doc = sample();
        assert!(doc.set_item_value("7-title-0", "x").unwrap_err().is_not_found());
        assert!(matches!(
            doc.set_item_value("title", "x"),
            Err(EditorError::InvalidState(_))
        ));
    }

    #[test]
    fn appends_go_to_the_end_with_fresh_indices() {
        let mut doc = sample();
        let first = doc.append_item("0-author-0", None, Some("Lee")).unwrap();
        let second = doc.append_item("0-author-0", None, None).unwrap();
        assert_eq!(first, "0-author-2");
        assert_eq!(second, "0-author-3");

        let cell = doc.cell(RowId(0), "author").unwrap();
        assert_eq!(doc.cell_values(cell), vec!["Smith", "Jones", "Lee", ""]);
        assert_eq!(separators_in(&doc, 0, "author"), 3);

        doc.remove_item("0-author-3").unwrap();
        let third = doc.append_item("0-author-1", None, None).unwrap();
        assert_eq!(third, "0-author-4");
        assert_eq!(separators_in(&reparse(&doc), 0, "author"), 3);
    }

    #[test]
    fn append_rejects_single_value_fields() {
        let mut doc = sample();
        let before = doc.to_html();
        assert!(matches!(
            doc.append_item("0-title-0", None, None),
            Err(EditorError::InvalidState(_))
        ));
        assert!(doc.append_item("0-author-9", None, None).unwrap_err().is_not_found());
        assert_eq!(doc.to_html(), before);
    }

    #[test]
    fn removing_the_last_item_strips_the_trailing_separator() {
        let mut doc = sample();
        let removed = doc.remove_item("0-author-1").unwrap().unwrap();
        assert_eq!(removed.value, "Jones");
        assert_eq!(separators_in(&doc, 0, "author"), 0);
        assert_eq!(doc.remove_item("0-author-1").unwrap(), None);
    }

    #[test]
    fn clear_cell_is_idempotent() {
        let mut doc = sample();
        let cleared = doc.clear_cell(RowId(0), "author").unwrap();
        assert_eq!(cleared.removed.len(), 2);
        assert_eq!(cleared.created, "0-author-0");
        let once = doc.to_html();

        doc.clear_cell(RowId(0), "author").unwrap();
        assert_eq!(doc.to_html(), once);

        let cell = doc.cell(RowId(0), "author").unwrap();
        assert_eq!(doc.item_containers(cell).len(), 1);
        assert_eq!(doc.append_item("0-author-0", None, None).unwrap(), "0-author-2");
    }

    #[test]
    fn clear_cell_requires_row_and_field() {
        let mut doc = sample();
        assert!(doc.clear_cell(RowId(4), "author").unwrap_err().is_not_found());
        assert!(doc.clear_cell(RowId(0), "volume").unwrap_err().is_not_found());
    }

    #[test]
    fn rows_are_never_renumbered() {
        let mut doc = sample();
        assert!(doc.delete_row(RowId(1)));
        assert!(!doc.delete_row(RowId(1)));

        let added = doc.add_row();
        assert_eq!(added.row_id, "row2");
        assert_eq!(added.item_ids, vec!["2-id-0", "2-title-0", "2-author-0"]);

        let doc = reparse(&doc);
        assert_eq!(doc.row_ids(), vec![RowId(0), RowId(2)]);
        for field in ["id", "title", "author"] {
            let cell = doc.cell(RowId(2), field).unwrap();
            assert_eq!(doc.item_containers(cell).len(), 1);
        }
    }

    #[test]
    fn add_row_on_an_empty_table_starts_at_zero() {
        let fields = vec!["id".to_string()];
        let mut doc = TableDocument::from_rows(&fields, &[]);
        assert_eq!(doc.add_row().row_id, "row0");
    }
}
