//! Session-scoped editing operations.
//!
//! `Editor` is the single entry point used by the web layer and the tests.
//! Every mutation follows the same steps: load the table's document and
//! tracking state, apply the change in memory, persist it, then push the
//! pre-change state onto the undo stack. A failing change persists nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::collaborators::Collaborators;
use crate::config::EditorConfig;
use crate::diff::{self, DeletionDiff};
use crate::document::{ItemId, RowId, TableDocument};
use crate::error::{EditorError, Result};
use crate::history::{Availability, History, Snapshot};
use crate::mutation::{AddedRow, ClearedCell, RemovedItem, ValueChange};
use crate::revalidate::{self, PipelineSettings, ValidationInput, ValidationSummary};
use crate::saving;
use crate::session::{
    sanitize_file_name, DocumentSlot, FileSessionStore, Session, SessionFiles, SessionStore, TableKind,
};
use crate::tracking::{ChangeLog, EditLog, EditState};

/// An uploaded CSV.
#[derive(Debug, Clone)]
pub struct Upload {
    pub table: TableKind,
    pub file_name: Option<String>,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub validation: ValidationSummary,
}

/// Outcome of a mutation together with the refreshed document.
#[derive(Debug, Clone, Serialize)]
pub struct Edited<T> {
    pub table: TableKind,
    pub outcome: T,
    pub document: String,
    pub availability: Availability,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStep {
    pub table: TableKind,
    /// `false` when the stack was empty.
    pub applied: bool,
    pub document: String,
    pub availability: Availability,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub tables: Vec<TableKind>,
    pub paired: bool,
    pub verify_id_existence: bool,
    pub has_edits_since_validation: bool,
    pub edited_items: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub draft_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftSummary {
    pub session_id: String,
    pub draft_name: Option<String>,
    pub tables: Vec<TableKind>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedCsv {
    pub file_name: String,
    pub content: String,
}

/// Working copy of one table while a mutation runs.
pub struct TableState<'d> {
    pub document: &'d mut TableDocument,
    pub edits: &'d mut EditLog,
    pub changes: &'d mut ChangeLog,
}

#[derive(Clone)]
pub struct Editor {
    store: Arc<dyn SessionStore>,
    collaborators: Collaborators,
    config: EditorConfig,
}

impl Editor {
    pub fn new(store: Arc<dyn SessionStore>, collaborators: Collaborators, config: EditorConfig) -> Self {
        Editor {
            store,
            collaborators,
            config,
        }
    }

    /// File-backed store under `config.session_dir`, collaborators from the
    /// configured external command.
    pub fn from_config(config: EditorConfig) -> Result<Self> {
        let command = config
            .collaborator
            .clone()
            .ok_or_else(|| EditorError::invalid("no collaborator command configured (OC_EDITOR_COLLABORATOR)"))?;
        let store = FileSessionStore::new(&config.session_dir)?;
        Ok(Editor::new(
            Arc::new(store),
            Collaborators::from_command(command),
            config,
        ))
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    fn files<'a>(&'a self, session_id: &'a str) -> SessionFiles<'a> {
        SessionFiles::new(self.store.as_ref(), session_id)
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            edit_tracking: self.config.edit_tracking,
            max_undo_depth: self.config.max_undo_depth,
        }
    }

    fn load_state(&self, files: &SessionFiles, kind: TableKind) -> Result<Snapshot> {
        Ok(Snapshot {
            document: files.load_document(DocumentSlot::Table(kind))?,
            edits: files.load_edits(kind)?,
            changes: files.load_changes(kind)?,
        })
    }

    fn save_state(&self, files: &SessionFiles, kind: TableKind, state: &Snapshot) -> Result<()> {
        files.save_document(DocumentSlot::Table(kind), &state.document)?;
        files.save_edits(kind, &state.edits)?;
        files.save_changes(kind, &state.changes)
    }

    /// Write `state` back after a failed update. Each part is attempted.
    fn rollback_state(&self, files: &SessionFiles, kind: TableKind, state: &Snapshot) {
        let results = [
            files.save_document(DocumentSlot::Table(kind), &state.document),
            files.save_edits(kind, &state.edits),
            files.save_changes(kind, &state.changes),
        ];
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!(session = files.session_id(), table = %kind, error = %err, "failed to roll back table state");
        }
    }

    /// Persist `after`, then record `before` in the history. Any failure
    /// restores `before` and leaves the history as it was.
    fn commit_state(
        &self,
        files: &SessionFiles,
        history: &History,
        kind: TableKind,
        before: &Snapshot,
        after: &Snapshot,
    ) -> Result<()> {
        if let Err(e) = self.save_state(files, kind, after) {
            self.rollback_state(files, kind, before);
            return Err(e);
        }
        if let Err(e) = history.push(kind, before) {
            self.rollback_state(files, kind, before);
            return Err(e);
        }
        Ok(())
    }

    // ---- session lifecycle ----

    /// Store the uploads in a fresh session and run the initial validation.
    ///
    /// # Arguments
    /// * `uploads` - One metadata and/or one citations CSV
    /// * `verify_id_existence` - Overrides the configured default
    ///
    /// # Returns
    /// * `Result<SessionCreated>` - The new session id and validation summary
    pub fn create_session(&self, uploads: Vec<Upload>, verify_id_existence: Option<bool>) -> Result<SessionCreated> {
        if uploads.is_empty() {
            return Err(EditorError::invalid("at least one of metadata or citations CSV is required"));
        }
        let mut seen = HashSet::new();
        for upload in &uploads {
            if !seen.insert(upload.table) {
                return Err(EditorError::invalid(format!("more than one {} upload", upload.table.long_name())));
            }
            if upload.contents.is_empty() {
                return Err(EditorError::invalid(format!("{} file is empty", upload.table.long_name())));
            }
            if upload.contents.len() as u64 > self.config.max_upload_bytes {
                return Err(EditorError::invalid(format!(
                    "{} file exceeds {} bytes",
                    upload.table.long_name(),
                    self.config.max_upload_bytes
                )));
            }
        }

        let session_id = Uuid::new_v4().to_string();
        self.store.create(&session_id)?;

        match self.populate_session(&session_id, uploads, verify_id_existence) {
            Ok(validation) => {
                info!(session = %session_id, issues = validation.total_issues(), "session created");
                Ok(SessionCreated {
                    session_id,
                    validation,
                })
            }
            Err(e) => {
                if let Err(cleanup) = self.store.delete(&session_id) {
                    warn!(session = %session_id, error = %cleanup, "failed to remove half-created session");
                }
                Err(e)
            }
        }
    }

    fn populate_session(
        &self,
        session_id: &str,
        mut uploads: Vec<Upload>,
        verify_id_existence: Option<bool>,
    ) -> Result<ValidationSummary> {
        let files = self.files(session_id);
        let dir = self.store.session_dir(session_id)?;
        uploads.sort_by_key(|u| u.table);

        let has = |kind| uploads.iter().any(|u: &Upload| u.table == kind);
        let mut session = Session::new(
            session_id,
            has(TableKind::Meta),
            has(TableKind::Cits),
            verify_id_existence.unwrap_or(self.config.verify_id_existence),
        );

        let mut used = HashSet::new();
        for upload in &uploads {
            let fallback = upload.table.default_upload_name();
            let mut name = sanitize_file_name(upload.file_name.as_deref().unwrap_or(""), &fallback);
            if !used.insert(name.clone()) {
                name = fallback;
            }
            let path = dir.join(&name);
            std::fs::write(&path, &upload.contents)?;
            session.set_csv_path(upload.table, path);
        }
        files.save_session(&session)?;

        let paths: Vec<(TableKind, std::path::PathBuf)> = session
            .tables()
            .into_iter()
            .filter_map(|kind| session.csv_path(kind).map(|p| (kind, p.to_path_buf())))
            .collect();
        let inputs = paths
            .iter()
            .map(|(kind, path)| ValidationInput {
                table: *kind,
                csv: path.as_path(),
                rows: None,
            })
            .collect();

        revalidate::validate_and_commit(&files, &mut session, &self.collaborators, self.settings(), inputs)
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let files = self.files(session_id);
        let session = files.load_session()?;
        let mut edited_items = 0;
        for kind in session.tables() {
            edited_items += files.load_edits(kind)?.edited_count();
        }
        Ok(SessionInfo {
            session_id: session.session_id.clone(),
            tables: session.tables(),
            paired: session.is_paired(),
            verify_id_existence: session.verify_id_existence,
            has_edits_since_validation: session.has_edits_since_validation,
            edited_items,
            created_at: session.created_at,
            last_updated: session.last_updated,
            last_validated_at: session.last_validated_at,
            draft_name: session.draft_name.clone(),
        })
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let deleted = self.store.delete(session_id)?;
        if deleted {
            info!(session = session_id, "session deleted");
        }
        Ok(deleted)
    }

    /// Name the session as a draft. `None` clears the name.
    pub fn save_draft(&self, session_id: &str, name: Option<String>) -> Result<SessionInfo> {
        let files = self.files(session_id);
        let mut session = files.load_session()?;
        session.draft_name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        session.touch();
        files.save_session(&session)?;
        self.session_info(session_id)
    }

    /// Summaries of every stored session, most recently updated first.
    pub fn list_drafts(&self) -> Result<Vec<DraftSummary>> {
        let mut drafts = Vec::new();
        for id in self.store.list()? {
            match self.files(&id).load_session() {
                Ok(session) => drafts.push(DraftSummary {
                    tables: session.tables(),
                    session_id: session.session_id,
                    draft_name: session.draft_name,
                    created_at: session.created_at,
                    last_updated: session.last_updated,
                }),
                Err(e) => debug!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        drafts.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(drafts)
    }

    /// Delete sessions not updated for longer than the configured expiry.
    pub fn purge_expired(&self) -> Result<Vec<String>> {
        match self.config.session_expiry() {
            Some(max_age) => self.purge_older_than(max_age),
            None => Ok(Vec::new()),
        }
    }

    pub fn purge_older_than(&self, max_age: Duration) -> Result<Vec<String>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| EditorError::invalid(format!("expiry out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let mut purged = Vec::new();
        for id in self.store.list()? {
            let expired = match self.files(&id).load_session() {
                Ok(session) => session.last_updated < cutoff,
                Err(_) => false,
            };
            if expired && self.store.delete(&id)? {
                purged.push(id);
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired sessions");
        }
        Ok(purged)
    }

    pub fn export_archive(&self, session_id: &str) -> Result<Vec<u8>> {
        saving::export_archive(&self.files(session_id))
    }

    /// Recreate an exported session under a new id.
    pub fn import_archive(&self, bytes: &[u8]) -> Result<SessionInfo> {
        let session = saving::import_archive(self.store.as_ref(), bytes)?;
        self.session_info(&session.session_id)
    }

    // ---- documents ----

    fn decorate(&self, files: &SessionFiles, kind: TableKind, html: &str, highlights: bool) -> Result<String> {
        let mut doc = TableDocument::parse(html)?;
        if let Some(baseline) = files.load_baseline(kind)? {
            let diff = diff::diff(&TableDocument::parse(&baseline)?, &doc);
            diff::insert_overlays(&mut doc, &diff);
        }
        if highlights {
            let edits = files.load_edits(kind)?;
            let changes = files.load_changes(kind)?;
            doc.apply_edit_tracking(edits.edited_ids());
            doc.mark_added_rows(changes.added_rows());
        }
        Ok(doc.to_html())
    }

    fn presented(&self, files: &SessionFiles, kind: TableKind) -> Result<String> {
        let html = files.load_document(DocumentSlot::Table(kind))?;
        self.decorate(files, kind, &html, true)
    }

    /// The document to show: a table's document with ghosts and edit
    /// highlights, or for a pair without a table selector the merged display.
    pub fn current_document(&self, session_id: &str, table: Option<TableKind>) -> Result<String> {
        let files = self.files(session_id);
        let session = files.load_session()?;

        if table.is_none() && session.is_paired() {
            let meta = self.presented(&files, TableKind::Meta)?;
            let cits = self.presented(&files, TableKind::Cits)?;
            let merged = self
                .collaborators
                .merger
                .merge(&meta, &cits)
                .map_err(|e| EditorError::external("merger", e))?;
            files.save_document(DocumentSlot::Display, &merged)?;
            return Ok(merged);
        }

        let kind = session.resolve_table(table)?;
        self.presented(&files, kind)
    }

    /// The stored document without any decoration.
    pub fn raw_document(&self, session_id: &str, table: Option<TableKind>) -> Result<String> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        files.load_document(DocumentSlot::Table(kind))
    }

    /// The stored document with ghost markers for deleted rows and items.
    pub fn document_with_overlays(&self, session_id: &str, table: Option<TableKind>) -> Result<String> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        let html = files.load_document(DocumentSlot::Table(kind))?;
        self.decorate(&files, kind, &html, false)
    }

    pub fn deletion_diff(&self, session_id: &str, table: Option<TableKind>) -> Result<DeletionDiff> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        let baseline = files
            .load_baseline(kind)?
            .ok_or_else(|| EditorError::not_found(format!("{kind} baseline of session '{session_id}'")))?;
        let current = files.load_document(DocumentSlot::Table(kind))?;
        Ok(diff::diff(
            &TableDocument::parse(&baseline)?,
            &TableDocument::parse(&current)?,
        ))
    }

    // ---- mutations ----

    fn mutate<T>(
        &self,
        session_id: &str,
        table: Option<TableKind>,
        op: impl FnOnce(&mut TableState<'_>) -> Result<T>,
    ) -> Result<Edited<T>> {
        let files = self.files(session_id);
        let mut session = files.load_session()?;
        let kind = session.resolve_table(table)?;

        let before = self.load_state(&files, kind)?;
        let mut document = TableDocument::parse(&before.document)?;
        let mut edits = before.edits.clone();
        let mut changes = before.changes.clone();
        let pristine = document.to_html();

        let outcome = op(&mut TableState {
            document: &mut document,
            edits: &mut edits,
            changes: &mut changes,
        })?;

        let after = Snapshot {
            document: document.to_html(),
            edits,
            changes,
        };
        let history = History::new(&files, self.config.max_undo_depth);
        if after.document != pristine || after.edits != before.edits || after.changes != before.changes {
            // flag first so a persisted change is never left unflagged
            session.mark_edited();
            files.save_session(&session)?;
            self.commit_state(&files, &history, kind, &before, &after)?;
        }

        Ok(Edited {
            table: kind,
            outcome,
            document: self.presented(&files, kind)?,
            availability: history.availability(kind)?,
        })
    }

    /// Replace an item's text. Blanking a multi-value item removes it.
    pub fn set_item_value(
        &self,
        session_id: &str,
        table: Option<TableKind>,
        item_id: &str,
        value: &str,
    ) -> Result<Edited<ValueChange>> {
        debug!(session = session_id, ?table, item = item_id, "set item value");
        self.mutate(session_id, table, |state| {
            let change = state.document.set_item_value(item_id, value)?;
            if change.pruned {
                let id: ItemId = item_id.parse()?;
                state.edits.forget(item_id);
                state
                    .changes
                    .item_deleted(item_id, &id.row_id().to_string(), &id.field, &change.previous);
                if let Some(created) = &change.created {
                    state.changes.item_restored(created);
                }
            } else if change.previous != value {
                state.edits.record(item_id, &change.previous, value);
            }
            Ok(change)
        })
    }

    /// Add an item at the end of the reference item's cell.
    pub fn append_item(
        &self,
        session_id: &str,
        table: Option<TableKind>,
        reference: &str,
        separator: Option<&str>,
        value: Option<&str>,
    ) -> Result<Edited<String>> {
        debug!(session = session_id, ?table, item = reference, "append item");
        self.mutate(session_id, table, |state| {
            let new_id = state.document.append_item(reference, separator, value)?;
            state.changes.item_restored(&new_id);
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                state.edits.record(&new_id, "", value);
            }
            Ok(new_id)
        })
    }

    pub fn remove_item(
        &self,
        session_id: &str,
        table: Option<TableKind>,
        item_id: &str,
    ) -> Result<Edited<Option<RemovedItem>>> {
        debug!(session = session_id, ?table, item = item_id, "remove item");
        self.mutate(session_id, table, |state| {
            let removed = state.document.remove_item(item_id)?;
            if let Some(removed) = &removed {
                let id: ItemId = item_id.parse()?;
                state.edits.forget(item_id);
                state
                    .changes
                    .item_deleted(item_id, &id.row_id().to_string(), &id.field, &removed.value);
                if let Some(created) = &removed.created {
                    state.changes.item_restored(created);
                }
            }
            Ok(removed)
        })
    }

    pub fn clear_cell(
        &self,
        session_id: &str,
        table: Option<TableKind>,
        row_id: &str,
        field: &str,
    ) -> Result<Edited<ClearedCell>> {
        debug!(session = session_id, ?table, row = row_id, field, "clear cell");
        let row: RowId = row_id.parse()?;
        self.mutate(session_id, table, |state| {
            let cleared = state.document.clear_cell(row, field)?;
            for (item_id, value) in &cleared.removed {
                state.edits.forget(item_id);
                if !value.trim().is_empty() {
                    state.changes.item_deleted(item_id, row_id, field, value);
                }
            }
            state.changes.item_restored(&cleared.created);
            Ok(cleared)
        })
    }

    /// Delete a row; a missing row leaves everything untouched.
    pub fn delete_row(&self, session_id: &str, table: Option<TableKind>, row_id: &str) -> Result<Edited<bool>> {
        debug!(session = session_id, ?table, row = row_id, "delete row");
        let row: RowId = row_id.parse()?;
        self.mutate(session_id, table, |state| {
            let deleted = state.document.delete_row(row);
            if deleted {
                state.changes.row_deleted(&row.to_string());
                state.edits.forget_row(row.number());
            }
            Ok(deleted)
        })
    }

    pub fn add_row(&self, session_id: &str, table: Option<TableKind>) -> Result<Edited<AddedRow>> {
        debug!(session = session_id, ?table, "add row");
        self.mutate(session_id, table, |state| {
            let added = state.document.add_row();
            state.changes.row_added(&added.row_id);
            Ok(added)
        })
    }

    // ---- history ----

    fn step(&self, session_id: &str, table: Option<TableKind>, undo: bool) -> Result<HistoryStep> {
        let files = self.files(session_id);
        let mut session = files.load_session()?;
        let kind = session.resolve_table(table)?;
        let history = History::new(&files, self.config.max_undo_depth);

        let current = self.load_state(&files, kind)?;
        let restored = if undo {
            history.undo(kind, &current)?
        } else {
            history.redo(kind, &current)?
        };

        let applied = restored.is_some();
        if let Some(restored) = restored {
            session.mark_edited();
            files.save_session(&session)?;
            if let Err(e) = self.save_state(&files, kind, &restored) {
                self.rollback_state(&files, kind, &current);
                let reverted = if undo {
                    history.redo(kind, &restored)
                } else {
                    history.undo(kind, &restored)
                };
                if let Err(revert) = reverted {
                    warn!(session = session_id, table = %kind, error = %revert, "failed to revert history step");
                }
                return Err(e);
            }
        }
        debug!(session = session_id, table = %kind, undo, applied, "history step");

        Ok(HistoryStep {
            table: kind,
            applied,
            document: self.presented(&files, kind)?,
            availability: history.availability(kind)?,
        })
    }

    pub fn undo(&self, session_id: &str, table: Option<TableKind>) -> Result<HistoryStep> {
        self.step(session_id, table, true)
    }

    pub fn redo(&self, session_id: &str, table: Option<TableKind>) -> Result<HistoryStep> {
        self.step(session_id, table, false)
    }

    pub fn history_availability(&self, session_id: &str, table: Option<TableKind>) -> Result<Availability> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        History::new(&files, self.config.max_undo_depth).availability(kind)
    }

    // ---- validation ----

    /// Validate the edited tables again and make the result the new baseline.
    ///
    /// `verify_id_existence` replaces the session's setting when given.
    pub fn revalidate(&self, session_id: &str, verify_id_existence: Option<bool>) -> Result<ValidationSummary> {
        let files = self.files(session_id);
        let mut session = files.load_session()?;
        if let Some(verify) = verify_id_existence {
            session.verify_id_existence = verify;
        }
        let summary = revalidate::revalidate(&files, &mut session, &self.collaborators, self.settings())?;
        info!(session = session_id, issues = summary.total_issues(), "revalidated");
        Ok(summary)
    }

    // ---- issues, tracking, export ----

    pub fn rows_by_issue(&self, session_id: &str, table: Option<TableKind>, issue_id: &str) -> Result<Vec<u64>> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        let doc = TableDocument::parse(&files.load_document(DocumentSlot::Table(kind))?)?;
        Ok(doc.rows_by_issue(issue_id))
    }

    /// A table of only the rows implicated by `issue_id`.
    pub fn filtered_rows(&self, session_id: &str, table: Option<TableKind>, issue_id: &str) -> Result<String> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        let doc = TableDocument::parse(&files.load_document(DocumentSlot::Table(kind))?)?;
        Ok(doc.filtered_table(&doc.rows_by_issue(issue_id)))
    }

    pub fn edited_items(&self, session_id: &str, table: Option<TableKind>) -> Result<Vec<EditState>> {
        let files = self.files(session_id);
        let kind = files.load_session()?.resolve_table(table)?;
        Ok(files.load_edits(kind)?.edited().cloned().collect())
    }

    /// The table as CSV, using the delimiter of the original upload.
    pub fn export_csv(&self, session_id: &str, table: Option<TableKind>) -> Result<ExportedCsv> {
        let files = self.files(session_id);
        let session = files.load_session()?;
        let kind = session.resolve_table(table)?;

        let doc = TableDocument::parse(&files.load_document(DocumentSlot::Table(kind))?)?;
        let rows = codec::parse_document(&doc);
        let delimiter = match session.csv_path(kind) {
            Some(original) if original.is_file() => codec::sniff_file_delimiter(original, Some(rows.fields.len()))?,
            _ => b',',
        };
        Ok(ExportedCsv {
            file_name: kind.export_file_name(),
            content: codec::serialize_rows(&rows, delimiter)?,
        })
    }
}
