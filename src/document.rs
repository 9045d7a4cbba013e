//! Addressing rows, cells and items inside a rendered table document.
//!
//! A document holds exactly one `<table id="table-data">`. Its header names the
//! fields (after a leading row-number column); each body row is a
//! `<tr id="row{N}">` whose first cell is the row number and whose remaining
//! cells follow header order. A cell holds one or more item containers:
//!
//! ```html
//! <span class="item-container" id="3-author-0">
//!   <span class="item-data">Smith</span><span class="sep">; </span>
//! </span>
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{EditorError, Result};
use crate::fields;
use crate::markup::{Element, Markup, NodeId};

pub const TABLE_MARKER: &str = "table-data";
pub const ITEM_CONTAINER_CLASS: &str = "item-container";
pub const ITEM_VALUE_CLASS: &str = "item-data";
pub const SEPARATOR_CLASS: &str = "sep";
pub const ISSUE_MARKER_CLASS: &str = "issue-icon";
pub const ROW_NUMBER_CLASS: &str = "row-number";
pub const EDITED_CLASS: &str = "edited";
pub const ADDED_ROW_CLASS: &str = "added-row";

/// High-water mark for row numbers, stored on the table element.
pub const NEXT_ROW_ATTR: &str = "data-next-row";
/// High-water mark for item indices, stored on each cell.
pub const NEXT_INDEX_ATTR: &str = "data-next-index";

lazy_static! {
    static ref ROW_ID_REGEX: Regex = Regex::new(r"^row(\d+)$").unwrap();
    static ref ITEM_ID_REGEX: Regex = Regex::new(r"^(\d+)-(.+)-(\d+)$").unwrap();
}

/// `row{N}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);

impl RowId {
    pub fn number(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row{}", self.0)
    }
}

impl FromStr for RowId {
    type Err = EditorError;

    fn from_str(s: &str) -> Result<Self> {
        ROW_ID_REGEX
            .captures(s)
            .and_then(|caps| caps[1].parse().ok())
            .map(RowId)
            .ok_or_else(|| EditorError::invalid(format!("malformed row id '{s}'")))
    }
}

/// `{row-number}-{field-name}-{index}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId {
    pub row: u64,
    pub field: String,
    pub index: u64,
}

impl ItemId {
    pub fn new(row: u64, field: &str, index: u64) -> Self {
        ItemId {
            row,
            field: field.to_string(),
            index,
        }
    }

    pub fn row_id(&self) -> RowId {
        RowId(self.row)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.row, self.field, self.index)
    }
}

impl FromStr for ItemId {
    type Err = EditorError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = ITEM_ID_REGEX
            .captures(s)
            .ok_or_else(|| EditorError::invalid(format!("malformed item id '{s}'")))?;
        let row = caps[1]
            .parse()
            .map_err(|_| EditorError::invalid(format!("row number out of range in '{s}'")))?;
        let index = caps[3]
            .parse()
            .map_err(|_| EditorError::invalid(format!("item index out of range in '{s}'")))?;
        Ok(ItemId {
            row,
            field: caps[2].to_string(),
            index,
        })
    }
}

/// A parsed table document with its table, body and header fields located.
#[derive(Debug, Clone)]
pub struct TableDocument {
    pub(crate) markup: Markup,
    pub(crate) table: NodeId,
    pub(crate) body: NodeId,
    fields: Vec<String>,
}

impl TableDocument {
    pub fn parse(html: &str) -> Result<Self> {
        Self::from_markup(Markup::parse(html)?)
    }

    pub fn from_markup(markup: Markup) -> Result<Self> {
        let table = markup
            .find_element(markup.root(), |el| el.name == "table" && el.id() == Some(TABLE_MARKER))
            .ok_or_else(|| EditorError::parse(format!("table with id '{TABLE_MARKER}' not found")))?;

        let header_row = markup
            .child_elements(table)
            .into_iter()
            .find(|&n| markup.is_tag(n, "thead"))
            .and_then(|thead| markup.find_element(thead, |el| el.name == "tr"))
            .or_else(|| {
                markup.find_elements(table, |el| el.name == "tr").into_iter().find(|&tr| {
                    markup.child_elements(tr).iter().any(|&c| markup.is_tag(c, "th"))
                })
            })
            .ok_or_else(|| EditorError::parse("table-data has no header row"))?;

        let fields: Vec<String> = markup
            .child_elements(header_row)
            .into_iter()
            .filter(|&c| markup.is_tag(c, "th") || markup.is_tag(c, "td"))
            .skip(1)
            .map(|th| markup.text_content(th).trim().to_string())
            .collect();

        let body = markup
            .child_elements(table)
            .into_iter()
            .find(|&n| markup.is_tag(n, "tbody"))
            .ok_or_else(|| EditorError::parse("table-data has no tbody"))?;

        Ok(TableDocument {
            markup,
            table,
            body,
            fields,
        })
    }

    /// Build a bare `table-data` table from per-row, per-field item lists.
    pub fn from_rows(fields: &[String], rows: &[Vec<Vec<String>>]) -> Self {
        let mut markup = Markup::new();
        let table = markup.create_element(
            Element::new("table")
                .with_attr("id", TABLE_MARKER)
                .with_attr("class", "table table-bordered"),
        );
        let root = markup.root();
        markup.append_child(root, table);

        let thead = markup.create_element(Element::new("thead"));
        markup.append_child(table, thead);
        let header = markup.create_element(Element::new("tr"));
        markup.append_child(thead, header);
        for label in std::iter::once("#").chain(fields.iter().map(String::as_str)) {
            let th = markup.create_element(Element::new("th"));
            markup.set_text(th, label);
            markup.append_child(header, th);
        }

        let body = markup.create_element(Element::new("tbody"));
        markup.append_child(table, body);

        let mut doc = TableDocument {
            markup,
            table,
            body,
            fields: fields.to_vec(),
        };
        for (number, values) in rows.iter().enumerate() {
            let row = doc.build_row(number as u64, values);
            doc.markup.append_child(body, row);
        }
        doc
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn markup(&self) -> &Markup {
        &self.markup
    }

    pub fn to_html(&self) -> String {
        self.markup.to_html()
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    /// Live data rows in document order.
    pub fn rows(&self) -> Vec<NodeId> {
        self.markup
            .child_elements(self.body)
            .into_iter()
            .filter(|&n| self.markup.is_tag(n, "tr") && self.row_number(n).is_some())
            .collect()
    }

    pub fn row_ids(&self) -> Vec<RowId> {
        self.rows()
            .into_iter()
            .filter_map(|n| self.row_number(n))
            .map(RowId)
            .collect()
    }

    pub fn row_number(&self, row: NodeId) -> Option<u64> {
        self.markup
            .attr(row, "id")
            .and_then(|id| id.parse::<RowId>().ok())
            .map(|r| r.0)
    }

    pub fn find_row(&self, row: RowId) -> Option<NodeId> {
        let id = row.to_string();
        self.rows()
            .into_iter()
            .find(|&n| self.markup.attr(n, "id") == Some(id.as_str()))
    }

    /// Cells after the row-number cell, in header order.
    pub fn data_cells(&self, row: NodeId) -> Vec<NodeId> {
        self.markup
            .child_elements(row)
            .into_iter()
            .filter(|&c| self.markup.is_tag(c, "td") || self.markup.is_tag(c, "th"))
            .skip(1)
            .collect()
    }

    pub fn cell(&self, row: RowId, field: &str) -> Result<NodeId> {
        let row_node = self
            .find_row(row)
            .ok_or_else(|| EditorError::not_found(format!("row '{row}'")))?;
        let index = self
            .field_index(field)
            .ok_or_else(|| EditorError::not_found(format!("field '{field}'")))?;
        self.data_cells(row_node)
            .get(index)
            .copied()
            .ok_or_else(|| EditorError::not_found(format!("cell '{field}' in row '{row}'")))
    }

    pub fn find_item(&self, item_id: &str) -> Option<NodeId> {
        self.markup.find_element(self.table, |el| {
            el.id() == Some(item_id) && el.has_class(ITEM_CONTAINER_CLASS)
        })
    }

    pub fn value_node(&self, container: NodeId) -> Option<NodeId> {
        self.markup
            .find_element(container, |el| el.has_class(ITEM_VALUE_CLASS))
    }

    pub fn container_value(&self, container: NodeId) -> String {
        self.value_node(container)
            .map(|v| self.markup.text_content(v))
            .unwrap_or_default()
    }

    pub fn item_value(&self, item_id: &str) -> Option<String> {
        let container = self.find_item(item_id)?;
        let value = self.value_node(container)?;
        Some(self.markup.text_content(value))
    }

    pub fn item_containers(&self, cell: NodeId) -> Vec<NodeId> {
        self.markup
            .find_elements(cell, |el| el.has_class(ITEM_CONTAINER_CLASS))
    }

    pub fn container_id(&self, container: NodeId) -> Option<ItemId> {
        self.markup
            .attr(container, "id")
            .and_then(|id| id.parse().ok())
    }

    pub fn cell_of(&self, node: NodeId) -> Option<NodeId> {
        self.markup
            .ancestor(node, |el| el.name == "td" || el.name == "th")
    }

    /// Raw item values of a cell, in order, blanks included.
    pub fn cell_values(&self, cell: NodeId) -> Vec<String> {
        self.item_containers(cell)
            .into_iter()
            .map(|c| self.container_value(c))
            .collect()
    }

    /// Every item id inside `scope`, in document order.
    pub fn item_ids_in(&self, scope: NodeId) -> Vec<String> {
        self.markup
            .find_elements(scope, |el| el.has_class(ITEM_CONTAINER_CLASS))
            .into_iter()
            .filter_map(|c| self.markup.attr(c, "id").map(str::to_string))
            .collect()
    }

    /// Row numbers owning any element tagged with `issue_id`, ascending.
    pub fn rows_by_issue(&self, issue_id: &str) -> Vec<u64> {
        let rows: BTreeSet<u64> = self
            .markup
            .elements_by_id(issue_id)
            .into_iter()
            .filter_map(|marker| self.markup.ancestor(marker, |el| el.name == "tr"))
            .filter_map(|tr| self.row_number(tr))
            .collect();
        rows.into_iter().collect()
    }

    /// A standalone table holding the header and only the requested rows.
    pub fn filtered_table(&self, row_numbers: &[u64]) -> String {
        let wanted: BTreeSet<u64> = row_numbers.iter().copied().collect();
        let mut copy = self.clone();
        for row in copy.markup.child_elements(copy.body) {
            let keep = copy.row_number(row).is_some_and(|n| wanted.contains(&n));
            if !keep {
                copy.markup.detach(row);
            }
        }
        copy.markup.outer_html(copy.table)
    }

    /// Mark the value node of each edited item with the `edited` class.
    pub fn apply_edit_tracking<'a>(&mut self, item_ids: impl IntoIterator<Item = &'a str>) {
        for item_id in item_ids {
            let Some(value) = self.find_item(item_id).and_then(|c| self.value_node(c)) else {
                continue;
            };
            if let Some(el) = self.markup.element_mut(value) {
                el.add_class(EDITED_CLASS);
            }
        }
    }

    pub fn remove_edit_tracking(&mut self) {
        let marked = self
            .markup
            .find_elements(self.markup.root(), |el| el.has_class(EDITED_CLASS));
        for node in marked {
            if let Some(el) = self.markup.element_mut(node) {
                el.remove_class(EDITED_CLASS);
            }
        }
    }

    pub fn mark_added_rows<'a>(&mut self, row_ids: impl IntoIterator<Item = &'a str>) {
        for row_id in row_ids {
            let Ok(row) = row_id.parse::<RowId>() else {
                continue;
            };
            if let Some(el) = self.find_row(row).and_then(|n| self.markup.element_mut(n)) {
                el.add_class(ADDED_ROW_CLASS);
            }
        }
    }

    pub(crate) fn new_item_container(&mut self, id: &ItemId, value: &str) -> NodeId {
        let id_text = id.to_string();
        let container = self.markup.create_element(
            Element::new("span")
                .with_attr("class", ITEM_CONTAINER_CLASS)
                .with_attr("id", &id_text),
        );
        let data = self
            .markup
            .create_element(Element::new("span").with_attr("class", ITEM_VALUE_CLASS));
        self.markup.set_text(data, value);
        self.markup.append_child(container, data);
        container
    }

    pub(crate) fn separator_node(&self, container: NodeId) -> Option<NodeId> {
        self.markup
            .child_elements(container)
            .into_iter()
            .find(|&c| self.markup.has_class(c, SEPARATOR_CLASS))
    }

    /// Append a separator marker to `container` unless it already has one.
    pub(crate) fn attach_separator(&mut self, container: NodeId, separator: &str) {
        if self.separator_node(container).is_some() {
            return;
        }
        let sep = self
            .markup
            .create_element(Element::new("span").with_attr("class", SEPARATOR_CLASS));
        self.markup.set_text(sep, separator);
        self.markup.append_child(container, sep);
    }

    pub(crate) fn detach_separator(&mut self, container: NodeId) {
        if let Some(sep) = self.separator_node(container) {
            self.markup.detach(sep);
        }
    }

    /// Build a detached `<tr id="row{N}">` with one cell per field.
    ///
    /// Missing or empty item lists produce a single empty item container.
    pub(crate) fn build_row(&mut self, number: u64, values: &[Vec<String>]) -> NodeId {
        let row_id = RowId(number).to_string();
        let tr = self
            .markup
            .create_element(Element::new("tr").with_attr("id", &row_id));
        let label = self
            .markup
            .create_element(Element::new("td").with_attr("class", ROW_NUMBER_CLASS));
        self.markup.set_text(label, &(number + 1).to_string());
        self.markup.append_child(tr, label);

        for (index, field) in self.fields.clone().iter().enumerate() {
            let td = self.markup.create_element(Element::new("td"));
            self.markup.append_child(tr, td);

            let items: Vec<String> = match values.get(index) {
                Some(items) if !items.is_empty() => items.clone(),
                _ => vec![String::new()],
            };
            let separator = fields::separator(field);
            let count = items.len();
            for (i, value) in items.iter().enumerate() {
                let container = self.new_item_container(&ItemId::new(number, field, i as u64), value);
                self.markup.append_child(td, container);
                if let Some(sep) = separator {
                    if i + 1 < count {
                        self.attach_separator(container, sep);
                    }
                }
            }
        }
        tr
    }
}
