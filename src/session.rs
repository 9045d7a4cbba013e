//! Session descriptor and per-session artifact storage.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{EditorError, Result};
use crate::tracking::{ChangeLog, EditLog};

/// Which uploaded table a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[serde(alias = "metadata")]
    Meta,
    #[serde(alias = "citations")]
    Cits,
}

impl TableKind {
    pub const ALL: [TableKind; 2] = [TableKind::Meta, TableKind::Cits];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Meta => "meta",
            TableKind::Cits => "cits",
        }
    }

    /// Long name used for uploads and exports.
    pub fn long_name(&self) -> &'static str {
        match self {
            TableKind::Meta => "metadata",
            TableKind::Cits => "citations",
        }
    }

    pub fn export_file_name(&self) -> String {
        format!("{}_edited.csv", self.long_name())
    }

    pub fn default_upload_name(&self) -> String {
        format!("{}.csv", self.long_name())
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableKind {
    type Err = EditorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meta" | "metadata" => Ok(TableKind::Meta),
            "cits" | "citations" => Ok(TableKind::Cits),
            other => Err(EditorError::invalid(format!("unknown table '{other}'"))),
        }
    }
}

/// A stored document: one per table, plus the merged display of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentSlot {
    Table(TableKind),
    Display,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotPart {
    Document,
    Edits,
    Changes,
}

impl SnapshotPart {
    pub const ALL: [SnapshotPart; 3] = [SnapshotPart::Document, SnapshotPart::Edits, SnapshotPart::Changes];
}

/// Every file a session may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Descriptor,
    Document(DocumentSlot),
    Baseline(TableKind),
    EditState(TableKind),
    ChangeState(TableKind),
    HistoryIndex,
    Snapshot {
        table: TableKind,
        index: u64,
        part: SnapshotPart,
    },
}

impl Artifact {
    /// Path of the artifact relative to the session directory.
    pub fn file_name(&self) -> String {
        match self {
            Artifact::Descriptor => "session.json".to_string(),
            Artifact::Document(DocumentSlot::Table(kind)) => format!("{kind}_table.html"),
            Artifact::Document(DocumentSlot::Display) => "display.html".to_string(),
            Artifact::Baseline(kind) => format!("{kind}_baseline.html"),
            Artifact::EditState(kind) => format!("{kind}_edit_state.json"),
            Artifact::ChangeState(kind) => format!("{kind}_changes.json"),
            Artifact::HistoryIndex => "undo_state.json".to_string(),
            Artifact::Snapshot { table, index, part } => {
                let suffix = match part {
                    SnapshotPart::Document => "html",
                    SnapshotPart::Edits => "edits.json",
                    SnapshotPart::Changes => "changes.json",
                };
                format!("undo/{table}_{index}.{suffix}")
            }
        }
    }
}

/// Session descriptor, persisted as `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub has_metadata: bool,
    pub has_citations: bool,
    pub verify_id_existence: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub meta_csv_path: Option<PathBuf>,
    pub cits_csv_path: Option<PathBuf>,
    pub meta_report_path: Option<PathBuf>,
    pub cits_report_path: Option<PathBuf>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub has_edits_since_validation: bool,
    pub draft_name: Option<String>,
}

impl Session {
    pub fn new(session_id: &str, has_metadata: bool, has_citations: bool, verify_id_existence: bool) -> Self {
        let now = Utc::now();
        Session {
            session_id: session_id.to_string(),
            has_metadata,
            has_citations,
            verify_id_existence,
            created_at: now,
            last_updated: now,
            meta_csv_path: None,
            cits_csv_path: None,
            meta_report_path: None,
            cits_report_path: None,
            last_validated_at: None,
            has_edits_since_validation: false,
            draft_name: None,
        }
    }

    pub fn has(&self, kind: TableKind) -> bool {
        match kind {
            TableKind::Meta => self.has_metadata,
            TableKind::Cits => self.has_citations,
        }
    }

    /// Tables present in this session, metadata first.
    pub fn tables(&self) -> Vec<TableKind> {
        TableKind::ALL.into_iter().filter(|k| self.has(*k)).collect()
    }

    pub fn is_paired(&self) -> bool {
        self.has_metadata && self.has_citations
    }

    pub fn primary_table(&self) -> Option<TableKind> {
        self.tables().into_iter().next()
    }

    /// Resolve an optional table selector against the tables present.
    pub fn resolve_table(&self, table: Option<TableKind>) -> Result<TableKind> {
        match table {
            Some(kind) if self.has(kind) => Ok(kind),
            Some(kind) => Err(EditorError::not_found(format!(
                "table '{kind}' in session '{}'",
                self.session_id
            ))),
            None => self
                .primary_table()
                .ok_or_else(|| EditorError::invalid("session holds no tables")),
        }
    }

    pub fn csv_path(&self, kind: TableKind) -> Option<&Path> {
        match kind {
            TableKind::Meta => self.meta_csv_path.as_deref(),
            TableKind::Cits => self.cits_csv_path.as_deref(),
        }
    }

    pub fn set_csv_path(&mut self, kind: TableKind, path: PathBuf) {
        match kind {
            TableKind::Meta => self.meta_csv_path = Some(path),
            TableKind::Cits => self.cits_csv_path = Some(path),
        }
    }

    pub fn report_path(&self, kind: TableKind) -> Option<&Path> {
        match kind {
            TableKind::Meta => self.meta_report_path.as_deref(),
            TableKind::Cits => self.cits_report_path.as_deref(),
        }
    }

    pub fn set_report_path(&mut self, kind: TableKind, path: PathBuf) {
        match kind {
            TableKind::Meta => self.meta_report_path = Some(path),
            TableKind::Cits => self.cits_report_path = Some(path),
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn mark_edited(&mut self) {
        self.has_edits_since_validation = true;
        self.touch();
    }

    pub fn mark_validated(&mut self) {
        let now = Utc::now();
        self.has_edits_since_validation = false;
        self.last_validated_at = Some(now);
        self.last_updated = now;
    }
}

/// Storage of session artifacts, keyed by session id.
pub trait SessionStore: Send + Sync {
    /// Create the session's storage and return its directory.
    fn create(&self, session_id: &str) -> Result<PathBuf>;

    /// Directory for files that belong to the session (uploads, reports).
    fn session_dir(&self, session_id: &str) -> Result<PathBuf>;

    fn exists(&self, session_id: &str) -> bool;

    /// Read an artifact; missing or empty artifacts read as `None`.
    fn read(&self, session_id: &str, artifact: &Artifact) -> Result<Option<String>>;

    /// Replace an artifact as a whole.
    fn write(&self, session_id: &str, artifact: &Artifact, contents: &str) -> Result<()>;

    fn remove(&self, session_id: &str, artifact: &Artifact) -> Result<()>;

    /// Delete a session. Returns `false` if it did not exist.
    fn delete(&self, session_id: &str) -> Result<bool>;

    fn list(&self) -> Result<Vec<String>>;
}

/// One directory per session under a common root.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileSessionStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, session_id: &str, artifact: &Artifact) -> Result<PathBuf> {
        Ok(self.session_dir(session_id)?.join(artifact.file_name()))
    }
}

/// Reduce an uploaded file name to a safe single path component.
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn check_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EditorError::invalid(format!("malformed session id '{session_id}'")))
    }
}

impl SessionStore for FileSessionStore {
    fn create(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        check_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn exists(&self, session_id: &str) -> bool {
        self.artifact_path(session_id, &Artifact::Descriptor)
            .is_ok_and(|p| p.is_file())
    }

    fn read(&self, session_id: &str, artifact: &Artifact) -> Result<Option<String>> {
        let path = self.artifact_path(session_id, artifact)?;
        match fs::read_to_string(&path) {
            Ok(contents) if contents.is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, session_id: &str, artifact: &Artifact, contents: &str) -> Result<()> {
        let path = self.artifact_path(session_id, artifact)?;
        let parent = path
            .parent()
            .ok_or_else(|| EditorError::invalid(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| EditorError::Io(e.error))?;
        Ok(())
    }

    fn remove(&self, session_id: &str, artifact: &Artifact) -> Result<()> {
        let path = self.artifact_path(session_id, artifact)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        let dir = self.session_dir(session_id)?;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        debug!(session = session_id, "deleted session directory");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Typed access to one session's artifacts.
pub struct SessionFiles<'a> {
    store: &'a dyn SessionStore,
    session_id: &'a str,
}

impl<'a> SessionFiles<'a> {
    pub fn new(store: &'a dyn SessionStore, session_id: &'a str) -> Self {
        SessionFiles { store, session_id }
    }

    pub fn session_id(&self) -> &str {
        self.session_id
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store
    }

    pub fn read(&self, artifact: &Artifact) -> Result<Option<String>> {
        self.store.read(self.session_id, artifact)
    }

    pub fn write(&self, artifact: &Artifact, contents: &str) -> Result<()> {
        self.store.write(self.session_id, artifact, contents)
    }

    pub fn remove(&self, artifact: &Artifact) -> Result<()> {
        self.store.remove(self.session_id, artifact)
    }

    fn read_json<T: DeserializeOwned + Default>(&self, artifact: &Artifact) -> Result<T> {
        match self.read(artifact)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(T::default()),
        }
    }

    fn write_json<T: Serialize>(&self, artifact: &Artifact, value: &T) -> Result<()> {
        self.write(artifact, &serde_json::to_string_pretty(value)?)
    }

    pub fn load_session(&self) -> Result<Session> {
        let json = self
            .read(&Artifact::Descriptor)?
            .ok_or_else(|| EditorError::not_found(format!("session '{}'", self.session_id)))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        self.write_json(&Artifact::Descriptor, session)
    }

    pub fn load_document(&self, slot: DocumentSlot) -> Result<String> {
        self.read(&Artifact::Document(slot))?.ok_or_else(|| {
            let name = match slot {
                DocumentSlot::Table(kind) => kind.as_str(),
                DocumentSlot::Display => "display",
            };
            EditorError::not_found(format!("{name} document of session '{}'", self.session_id))
        })
    }

    pub fn save_document(&self, slot: DocumentSlot, html: &str) -> Result<()> {
        self.write(&Artifact::Document(slot), html)
    }

    pub fn load_baseline(&self, kind: TableKind) -> Result<Option<String>> {
        self.read(&Artifact::Baseline(kind))
    }

    pub fn save_baseline(&self, kind: TableKind, html: &str) -> Result<()> {
        self.write(&Artifact::Baseline(kind), html)
    }

    pub fn load_edits(&self, kind: TableKind) -> Result<EditLog> {
        self.read_json(&Artifact::EditState(kind))
    }

    pub fn save_edits(&self, kind: TableKind, edits: &EditLog) -> Result<()> {
        self.write_json(&Artifact::EditState(kind), edits)
    }

    pub fn load_changes(&self, kind: TableKind) -> Result<ChangeLog> {
        self.read_json(&Artifact::ChangeState(kind))
    }

    pub fn save_changes(&self, kind: TableKind, changes: &ChangeLog) -> Result<()> {
        self.write_json(&Artifact::ChangeState(kind), changes)
    }

    pub(crate) fn load_json<T: DeserializeOwned + Default>(&self, artifact: &Artifact) -> Result<T> {
        self.read_json(artifact)
    }

    pub(crate) fn save_json<T: Serialize>(&self, artifact: &Artifact, value: &T) -> Result<()> {
        self.write_json(artifact, value)
    }
}
