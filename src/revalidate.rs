//! Validation pipeline shared by upload and revalidation.
//!
//! Nothing is committed until every collaborator call has succeeded and every
//! produced document parses, so a failure leaves the session as it was.

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::codec::{self, TableRows};
use crate::collaborators::{Collaborators, ValidationOptions, ValidationOutcome};
use crate::config::EditTrackingPolicy;
use crate::document::TableDocument;
use crate::error::{EditorError, Result};
use crate::history::History;
use crate::session::{DocumentSlot, Session, SessionFiles, TableKind};
use crate::tracking::ChangeLog;

/// Text shown when validation finds nothing.
pub const SUCCESS_INDICATOR: &str = "No issues found";

/// Per-pipeline settings taken from the editor configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub edit_tracking: EditTrackingPolicy,
    pub max_undo_depth: usize,
}

/// A CSV to validate. `rows` is parsed from `csv` when not supplied.
pub struct ValidationInput<'a> {
    pub table: TableKind,
    pub csv: &'a Path,
    pub rows: Option<TableRows>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableValidation {
    pub table: TableKind,
    pub issue_count: usize,
    pub report: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub tables: Vec<TableValidation>,
    /// Document served to the client: the merged display for a pair.
    pub document: String,
}

impl ValidationSummary {
    pub fn total_issues(&self) -> usize {
        self.tables.iter().map(|t| t.issue_count).sum()
    }
}

struct Produced {
    table: TableKind,
    document: String,
    report: PathBuf,
    issue_count: usize,
}

/// Standalone document for a table without issues: the success message and
/// the validated rows as an editable `table-data` table.
pub fn no_issues_document(table: TableKind, rows: &TableRows) -> String {
    let doc = TableDocument::from_rows(&rows.fields, &rows.value_grid());
    format!(
        concat!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title} validation</title></head>",
            "<body><div class=\"validation-success\"><p class=\"success-message\">{indicator}</p>",
            "<p>The {title} table passed validation with no errors or warnings.</p></div>",
            "<div class=\"table-container\">{table}</div></body></html>\n"
        ),
        title = table.long_name(),
        indicator = SUCCESS_INDICATOR,
        table = doc.to_html(),
    )
}

/// Serialize the current document of `table` to a scratch CSV in `dir`.
///
/// The file is deleted when the returned handle drops.
fn scratch_csv(files: &SessionFiles, session: &Session, table: TableKind, dir: &Path) -> Result<(NamedTempFile, TableRows)> {
    let html = files.load_document(DocumentSlot::Table(table))?;
    let rows = codec::parse_document(&TableDocument::parse(&html)?);
    if rows.is_empty() {
        return Err(EditorError::invalid(format!("{table} table has no rows to validate")));
    }

    let delimiter = match session.csv_path(table) {
        Some(original) if original.is_file() => codec::sniff_file_delimiter(original, Some(rows.fields.len()))?,
        _ => b',',
    };
    let csv = codec::serialize_rows(&rows, delimiter)?;

    let mut file = tempfile::Builder::new()
        .prefix(&format!("{table}_revalidate_"))
        .suffix(".csv")
        .tempfile_in(dir)?;
    file.write_all(csv.as_bytes())?;
    file.flush()?;
    Ok((file, rows))
}

/// Re-run validation on the current documents of every table in the session.
///
/// # Arguments
/// * `files` - The session's artifacts
/// * `session` - Descriptor, updated and saved on success
/// * `collaborators` - Validator, renderer and merger
/// * `settings` - Edit tracking policy and history depth
///
/// # Returns
/// * `Result<ValidationSummary>` - Issue counts and the document to serve
pub fn revalidate(
    files: &SessionFiles,
    session: &mut Session,
    collaborators: &Collaborators,
    settings: PipelineSettings,
) -> Result<ValidationSummary> {
    let dir = files.store().session_dir(files.session_id())?;

    let mut scratch = Vec::new();
    for table in session.tables() {
        let (file, rows) = scratch_csv(files, session, table, &dir)?;
        scratch.push((table, file, rows));
    }

    let inputs = scratch
        .iter()
        .map(|(table, file, rows)| ValidationInput {
            table: *table,
            csv: file.path(),
            rows: Some(rows.clone()),
        })
        .collect::<Vec<_>>();

    let summary = validate_and_commit(files, session, collaborators, settings, inputs);
    drop(scratch);
    summary
}

/// Render or synthesize each table's document, then merge a pair.
fn produce(
    session_id: &str,
    collaborators: &Collaborators,
    inputs: Vec<ValidationInput>,
    outcomes: Vec<ValidationOutcome>,
) -> Result<(Vec<Produced>, Option<String>)> {
    let mut produced = Vec::new();
    for (input, outcome) in inputs.into_iter().zip(outcomes) {
        let document = if outcome.issues.is_empty() {
            let rows = match input.rows {
                Some(rows) => rows,
                None => codec::parse_csv(input.csv)?,
            };
            no_issues_document(input.table, &rows)
        } else {
            collaborators
                .renderer
                .render(input.csv, &outcome.report)
                .map_err(|e| EditorError::external("renderer", e))?
        };
        TableDocument::parse(&document)?;

        info!(
            session = session_id,
            table = %input.table,
            issues = outcome.issues.len(),
            "validated table"
        );
        produced.push(Produced {
            table: input.table,
            document,
            report: outcome.report,
            issue_count: outcome.issues.len(),
        });
    }

    let display = match produced.as_slice() {
        [first, second] => Some(
            collaborators
                .merger
                .merge(&first.document, &second.document)
                .map_err(|e| EditorError::external("merger", e))?,
        ),
        _ => None,
    };
    Ok((produced, display))
}

/// Remove reports written by a run that failed, keeping any the session still uses.
fn discard_reports(session: &Session, reports: &[PathBuf]) {
    for report in reports {
        let current = TableKind::ALL
            .into_iter()
            .any(|kind| session.report_path(kind) == Some(report.as_path()));
        if current || !report.is_file() {
            continue;
        }
        if let Err(e) = fs::remove_file(report) {
            debug!(path = %report.display(), error = %e, "failed to remove report");
        }
    }
}

/// Validate the given CSVs, produce their documents and commit them as the
/// new current documents and baselines.
pub fn validate_and_commit(
    files: &SessionFiles,
    session: &mut Session,
    collaborators: &Collaborators,
    settings: PipelineSettings,
    inputs: Vec<ValidationInput>,
) -> Result<ValidationSummary> {
    let dir = files.store().session_dir(files.session_id())?;
    let options = ValidationOptions {
        verify_id_existence: session.verify_id_existence,
    };

    let outcomes: Vec<ValidationOutcome> = match inputs.as_slice() {
        [single] => vec![collaborators
            .validator
            .validate(single.csv, &dir, &options)
            .map_err(|e| EditorError::external("validator", e))?],
        [meta, cits] => {
            let pair = collaborators
                .validator
                .validate_pair(meta.csv, cits.csv, &dir, &options)
                .map_err(|e| EditorError::external("validator", e))?;
            vec![pair.meta, pair.cits]
        }
        _ => return Err(EditorError::invalid("expected one or two tables to validate")),
    };

    let reports: Vec<PathBuf> = outcomes.iter().map(|o| o.report.clone()).collect();
    let (produced, display) = match produce(files.session_id(), collaborators, inputs, outcomes) {
        Ok(done) => done,
        Err(e) => {
            discard_reports(session, &reports);
            return Err(e);
        }
    };

    commit(files, session, settings, &produced, display.as_deref())?;

    let document = match (display, produced.first()) {
        (Some(merged), _) => merged,
        (None, Some(single)) => single.document.clone(),
        (None, None) => String::new(),
    };
    Ok(ValidationSummary {
        tables: produced
            .into_iter()
            .map(|p| TableValidation {
                table: p.table,
                issue_count: p.issue_count,
                report: p.report,
            })
            .collect(),
        document,
    })
}

fn commit(
    files: &SessionFiles,
    session: &mut Session,
    settings: PipelineSettings,
    produced: &[Produced],
    display: Option<&str>,
) -> Result<()> {
    let history = History::new(files, settings.max_undo_depth);

    for p in produced {
        files.save_document(DocumentSlot::Table(p.table), &p.document)?;
        files.save_baseline(p.table, &p.document)?;
        files.save_changes(p.table, &ChangeLog::new())?;
        if settings.edit_tracking == EditTrackingPolicy::Drop {
            let mut edits = files.load_edits(p.table)?;
            edits.clear();
            files.save_edits(p.table, &edits)?;
        }
        history.clear(p.table)?;

        if let Some(stale) = session.report_path(p.table) {
            if stale != p.report && stale.is_file() {
                if let Err(e) = fs::remove_file(stale) {
                    debug!(path = %stale.display(), error = %e, "could not remove stale report");
                }
            }
        }
        session.set_report_path(p.table, p.report.clone());
    }

    if let Some(display) = display {
        files.save_document(DocumentSlot::Display, display)?;
    }

    session.mark_validated();
    files.save_session(session)
}
