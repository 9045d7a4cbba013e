//! In-process collaborators for driving the editor end to end.
//!
//! The validator flags every row holding a value containing `INVALID`; the
//! renderer turns the CSV plus that report into a `table-data` document with
//! one issue marker per flagged row.

#![allow(dead_code)]

use oc_table_editor::codec;
use oc_table_editor::collaborators::{
    Collaborators, Issue, Merger, PairOutcome, Renderer, ValidationOptions, ValidationOutcome, Validator,
};
use oc_table_editor::editor::{Editor, Upload};
use oc_table_editor::error::{EditorError, ExternalError, Result as EditorResult};
use oc_table_editor::fields;
use oc_table_editor::session::{Artifact, SessionStore};
use oc_table_editor::{EditorConfig, FileSessionStore, TableKind};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

pub const MARKER: &str = "INVALID";

#[derive(Debug, Serialize, Deserialize)]
struct ReportEntry {
    issue_id: String,
    row: usize,
}

#[derive(Default)]
pub struct FakeValidator {
    reports: AtomicUsize,
    pub calls: AtomicUsize,
    pub last_verify: AtomicBool,
}

impl FakeValidator {
    fn check(&self, csv: &Path, prefix: &str, out: &Path, options: &ValidationOptions) -> Result<ValidationOutcome, ExternalError> {
        self.last_verify.store(options.verify_id_existence, Ordering::SeqCst);
        let rows = codec::parse_csv(csv)?;

        let mut entries = Vec::new();
        for (row, values) in rows.rows.iter().enumerate() {
            if values.values.iter().flatten().any(|v| v.contains(MARKER)) {
                entries.push(ReportEntry {
                    issue_id: format!("{prefix}-{}", entries.len()),
                    row,
                });
            }
        }

        let n = self.reports.fetch_add(1, Ordering::SeqCst);
        let report = out.join(format!("{prefix}_report_{n}.json"));
        fs::write(&report, serde_json::to_string(&entries)?)?;

        let issues = entries
            .iter()
            .map(|e| Issue {
                error_type: "error".to_string(),
                message: format!("row {} holds a flagged value", e.row),
                details: Map::new(),
            })
            .collect();
        Ok(ValidationOutcome { issues, report })
    }
}

impl Validator for FakeValidator {
    fn validate(&self, csv: &Path, out: &Path, options: &ValidationOptions) -> Result<ValidationOutcome, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check(csv, "meta", out, options)
    }

    fn validate_pair(
        &self,
        meta: &Path,
        cits: &Path,
        out: &Path,
        options: &ValidationOptions,
    ) -> Result<PairOutcome, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PairOutcome {
            meta: self.check(meta, "meta", out, options)?,
            cits: self.check(cits, "cits", out, options)?,
        })
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

impl Renderer for FakeRenderer {
    fn render(&self, csv: &Path, report: &Path) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err("renderer crashed".into());
        }
        let rows = codec::parse_csv(csv)?;
        let entries: Vec<ReportEntry> = serde_json::from_str(&fs::read_to_string(report)?)?;

        let mut html = String::from("<!DOCTYPE html><html><body><h2>Report</h2><table id=\"table-data\"><thead><tr><th>#</th>");
        for field in &rows.fields {
            html.push_str(&format!("<th>{}</th>", escape(field)));
        }
        html.push_str("</tr></thead><tbody>");

        for (n, row) in rows.rows.iter().enumerate() {
            html.push_str(&format!("<tr id=\"row{n}\"><td class=\"row-number\">{}", n + 1));
            for entry in entries.iter().filter(|e| e.row == n) {
                html.push_str(&format!("<span class=\"issue-icon\" id=\"{}\">!</span>", entry.issue_id));
            }
            html.push_str("</td>");
            for (field, items) in rows.fields.iter().zip(&row.values) {
                html.push_str("<td>");
                for (i, item) in items.iter().enumerate() {
                    html.push_str(&format!(
                        "<span class=\"item-container\" id=\"{n}-{field}-{i}\"><span class=\"item-data\">{}</span>",
                        escape(item)
                    ));
                    if i + 1 < items.len() {
                        let sep = fields::separator(field).unwrap_or(" ");
                        html.push_str(&format!("<span class=\"sep\">{sep}</span>"));
                    }
                    html.push_str("</span>");
                }
                html.push_str("</td>");
            }
            html.push_str("</tr>");
        }
        html.push_str("</tbody></table></body></html>");
        Ok(html)
    }
}

pub struct FakeMerger;

impl Merger for FakeMerger {
    fn merge(&self, first: &str, second: &str) -> Result<String, ExternalError> {
        Ok(format!(
            "<div class=\"merged\"><section class=\"meta\">{first}</section><section class=\"cits\">{second}</section></div>"
        ))
    }
}

/// File store whose edit-state and history-index writes can be made to fail.
pub struct FlakyStore {
    inner: FileSessionStore,
    pub fail_edit_state: AtomicBool,
    pub fail_history_index: AtomicBool,
}

impl FlakyStore {
    fn refuses(&self, artifact: &Artifact) -> bool {
        match artifact {
            Artifact::EditState(_) => self.fail_edit_state.load(Ordering::SeqCst),
            Artifact::HistoryIndex => self.fail_history_index.load(Ordering::SeqCst),
            _ => false,
        }
    }
}

impl SessionStore for FlakyStore {
    fn create(&self, session_id: &str) -> EditorResult<PathBuf> {
        self.inner.create(session_id)
    }

    fn session_dir(&self, session_id: &str) -> EditorResult<PathBuf> {
        self.inner.session_dir(session_id)
    }

    fn exists(&self, session_id: &str) -> bool {
        self.inner.exists(session_id)
    }

    fn read(&self, session_id: &str, artifact: &Artifact) -> EditorResult<Option<String>> {
        self.inner.read(session_id, artifact)
    }

    fn write(&self, session_id: &str, artifact: &Artifact, contents: &str) -> EditorResult<()> {
        if self.refuses(artifact) {
            return Err(EditorError::Io(io::Error::other("disk full")));
        }
        self.inner.write(session_id, artifact, contents)
    }

    fn remove(&self, session_id: &str, artifact: &Artifact) -> EditorResult<()> {
        self.inner.remove(session_id, artifact)
    }

    fn delete(&self, session_id: &str) -> EditorResult<bool> {
        self.inner.delete(session_id)
    }

    fn list(&self) -> EditorResult<Vec<String>> {
        self.inner.list()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub editor: Editor,
    pub store: Arc<FlakyStore>,
    pub validator: Arc<FakeValidator>,
    pub renderer: Arc<FakeRenderer>,
}

pub fn harness() -> Harness {
    harness_with(EditorConfig::default())
}

pub fn harness_with(mut config: EditorConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    config.session_dir = dir.path().to_path_buf();

    let validator = Arc::new(FakeValidator::default());
    let renderer = Arc::new(FakeRenderer::default());
    let collaborators = Collaborators::new(validator.clone(), renderer.clone(), Arc::new(FakeMerger));
    let store = Arc::new(FlakyStore {
        inner: FileSessionStore::new(dir.path()).unwrap(),
        fail_edit_state: AtomicBool::new(false),
        fail_history_index: AtomicBool::new(false),
    });
    let editor = Editor::new(store.clone(), collaborators, config);

    Harness {
        dir,
        editor,
        store,
        validator,
        renderer,
    }
}

pub fn upload(table: TableKind, name: &str, contents: &str) -> Upload {
    Upload {
        table,
        file_name: Some(name.to_string()),
        contents: contents.as_bytes().to_vec(),
    }
}

/// Files left in a session directory, relative to it.
pub fn session_files(dir: &Path, session_id: &str) -> Vec<String> {
    let root = dir.join(session_id);
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                let rel = entry.path().strip_prefix(&root).unwrap().to_string_lossy().into_owned();
                out.push(rel);
            }
        }
    }
    out.sort();
    out
}
