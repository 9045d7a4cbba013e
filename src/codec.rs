//! Conversion between table documents and delimited text.

use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

use crate::document::TableDocument;
use crate::error::{EditorError, Result};
use crate::fields;

const DELIMITER_CANDIDATES: [u8; 3] = [b',', b';', b'\t'];

/// Item values of one row, in header order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValues {
    pub row_id: Option<String>,
    pub values: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRows {
    pub fields: Vec<String>,
    pub rows: Vec<RowValues>,
}

impl TableRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Row values without their identifiers, as accepted by `TableDocument::from_rows`.
    pub fn value_grid(&self) -> Vec<Vec<Vec<String>>> {
        self.rows.iter().map(|r| r.values.clone()).collect()
    }

    /// Joined CSV value for `field` in row `index`.
    pub fn joined(&self, index: usize, field: &str) -> Option<String> {
        let column = self.fields.iter().position(|f| f == field)?;
        let items = self.rows.get(index)?.values.get(column)?;
        Some(fields::join_items(field, items))
    }
}

/// Extract rows from a table document.
///
/// Item text is kept verbatim. Whitespace-only items are dropped; a cell left
/// with no items records a single empty string. A cell without any item
/// container contributes its own text.
pub fn parse_document(doc: &TableDocument) -> TableRows {
    let markup = doc.markup();
    let rows = doc
        .rows()
        .into_iter()
        .map(|row| {
            let values = doc
                .data_cells(row)
                .into_iter()
                .take(doc.fields().len())
                .map(|cell| {
                    let containers = doc.item_containers(cell);
                    let mut items: Vec<String> = if containers.is_empty() {
                        vec![markup.text_content(cell)]
                    } else {
                        containers
                            .into_iter()
                            .map(|c| doc.container_value(c))
                            .collect()
                    };
                    items.retain(|item| !item.trim().is_empty());
                    if items.is_empty() {
                        items.push(String::new());
                    }
                    items
                })
                .collect::<Vec<_>>();
            RowValues {
                row_id: markup.attr(row, "id").map(str::to_string),
                values: pad(values, doc.fields().len()),
            }
        })
        .collect();

    TableRows {
        fields: doc.fields().to_vec(),
        rows,
    }
}

fn pad(mut values: Vec<Vec<String>>, width: usize) -> Vec<Vec<String>> {
    while values.len() < width {
        values.push(vec![String::new()]);
    }
    values
}

/// Write rows as delimited text with a header line.
///
/// # Arguments
/// * `rows` - Parsed table rows
/// * `delimiter` - Field delimiter byte, usually sniffed from the upload
///
/// # Returns
/// * `Result<String>` - The CSV text
pub fn serialize_rows(rows: &TableRows, delimiter: u8) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    writer.write_record(&rows.fields)?;
    for row in &rows.rows {
        let record: Vec<String> = rows
            .fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                row.values
                    .get(i)
                    .map(|items| fields::join_items(field, items))
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| EditorError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| EditorError::parse(format!("serialized CSV is not UTF-8: {e}")))
}

/// Pick the delimiter of a header line.
///
/// The first candidate (comma, semicolon, tab) whose count fits the expected
/// field count wins. Without a field count any candidate that occurs wins.
/// Falls back to comma.
pub fn sniff_delimiter(first_line: &str, expected_fields: Option<usize>) -> u8 {
    let needed = match expected_fields {
        Some(n) => n.saturating_sub(1).max(1),
        None => 1,
    };
    DELIMITER_CANDIDATES
        .iter()
        .copied()
        .find(|&d| first_line.bytes().filter(|&b| b == d).count() >= needed)
        .unwrap_or(b',')
}

/// Sniff the delimiter from the first line of a file on disk.
pub fn sniff_file_delimiter(path: &Path, expected_fields: Option<usize>) -> Result<u8> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    let first_line = first_line.trim_start_matches('\u{feff}');
    let delimiter = sniff_delimiter(first_line, expected_fields);
    debug!(path = %path.display(), delimiter = ?(delimiter as char), "sniffed delimiter");
    Ok(delimiter)
}

/// Read a CSV file into rows, splitting multi-value fields into items.
pub fn parse_csv(path: &Path) -> Result<TableRows> {
    let delimiter = sniff_file_delimiter(path, None)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let fields: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let values = fields
            .iter()
            .enumerate()
            .map(|(i, field)| fields::split_value(field, record.get(i).unwrap_or("")))
            .collect();
        rows.push(RowValues {
            row_id: None,
            values,
        });
    }

    Ok(TableRows { fields, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::SAMPLE;
    use std::io::Write;

    #[test]
    fn parse_reads_items_in_header_order() {
        let doc = TableDocument::parse(SAMPLE).unwrap();
        let rows = parse_document(&doc);
        assert_eq!(rows.fields, vec!["id", "title", "author"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows[0].row_id.as_deref(), Some("row0"));
        assert_eq!(rows.rows[0].values[2], vec!["Smith", "Jones"]);
        assert_eq!(rows.joined(0, "author").as_deref(), Some("Smith; Jones"));
    }

    #[test]
    fn blank_items_collapse_to_one_empty_value() {
        let fields = vec!["id".to_string(), "author".to_string()];
        let grid = vec![vec![
            vec!["doi:1".to_string(), "  ".to_string()],
            vec!["   ".to_string()],
        ]];
        let doc = TableDocument::from_rows(&fields, &grid);
        let rows = parse_document(&doc);
        assert_eq!(rows.rows[0].values, vec![vec!["doi:1".to_string()], vec![String::new()]]);
    }

    #[test]
    fn item_text_is_not_trimmed() {
        let html = concat!(
            "<table id=\"table-data\"><thead><tr><th>#</th><th>title</th><th>author</th></tr></thead><tbody>",
            "<tr id=\"row0\"><td class=\"row-number\">1</td>",
            "<td><span class=\"item-container\" id=\"0-title-0\"><span class=\"item-data\">  Padded  title </span></span></td>",
            "<td><span class=\"item-container\" id=\"0-author-0\"><span class=\"item-data\"> Smith</span>",
            "<span class=\"sep\">; </span></span>",
            "<span class=\"item-container\" id=\"0-author-1\"><span class=\"item-data\"> </span></span></td>",
            "</tr></tbody></table>"
        );
        let rows = parse_document(&TableDocument::parse(html).unwrap());
        assert_eq!(rows.rows[0].values[0], vec!["  Padded  title "]);
        assert_eq!(rows.rows[0].values[1], vec![" Smith"]);

        let csv = serialize_rows(&rows, b',').unwrap();
        assert_eq!(csv.lines().nth(1), Some("  Padded  title , Smith"));
    }

    #[test]
    fn serialize_joins_multi_value_fields() {
        let doc = TableDocument::parse(SAMPLE).unwrap();
        let csv = serialize_rows(&parse_document(&doc), b';').unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id;title;author"));
        assert_eq!(lines.next(), Some("doi:10.1/a;First;\"Smith; Jones\""));
        assert_eq!(lines.next(), Some("doi:10.1/b;Second;Lee"));
    }

    #[test]
    fn sniffing_prefers_consistent_candidates() {
        assert_eq!(sniff_delimiter("id,title,author", Some(3)), b',');
        assert_eq!(sniff_delimiter("id;title;author", Some(3)), b';');
        assert_eq!(sniff_delimiter("id\ttitle, subtitle\tauthor", Some(3)), b'\t');
        assert_eq!(sniff_delimiter("id", Some(1)), b',');
        assert_eq!(sniff_delimiter("id|title", None), b',');
    }

    #[test]
    fn csv_files_split_into_items() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id;title;author").unwrap();
        writeln!(file, "doi:1 pmid:2;A title;Smith; Jones").unwrap();
        file.flush().unwrap();

        let rows = parse_csv(file.path()).unwrap();
        assert_eq!(rows.fields, vec!["id", "title", "author"]);
        assert_eq!(rows.rows[0].values[0], vec!["doi:1", "pmid:2"]);
        // the unquoted "; " inside author splits the record under ';'
        assert_eq!(rows.rows[0].values[2], vec!["Smith"]);
    }
}
