use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EditorError, Result};
use crate::session::{sanitize_file_name, DocumentSlot, Session, SessionFiles, SessionStore, TableKind};
use crate::tracking::{ChangeLog, EditLog};

const ARCHIVE_VERSION: u32 = 1;

/// A file that lived in the session directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedTable {
    pub table: TableKind,
    pub csv: Option<ArchivedFile>,
    pub report: Option<ArchivedFile>,
    pub document: String,
    pub baseline: Option<String>,
    pub edits: EditLog,
    pub changes: ChangeLog,
}

/// Portable copy of a session without its undo history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub version: u32,
    pub session: Session,
    pub tables: Vec<ArchivedTable>,
    pub display: Option<String>,
}

pub fn write_archive<W: Write>(archive: &SessionArchive, writer: W) -> Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut writer = BufWriter::new(encoder);

    serialize_into(&mut writer, archive)?;

    let encoder = writer.into_inner().map_err(|e| EditorError::Io(e.into_error()))?;
    encoder.finish()?;
    Ok(())
}

pub fn read_archive<R: Read>(reader: R) -> Result<SessionArchive> {
    let decoder = GzDecoder::new(reader);
    let mut reader = BufReader::new(decoder);

    let archive: SessionArchive = deserialize_from(&mut reader)?;
    if archive.version != ARCHIVE_VERSION {
        return Err(EditorError::invalid(format!(
            "unsupported archive version {}",
            archive.version
        )));
    }
    Ok(archive)
}

fn archived_file(path: Option<&Path>) -> Result<Option<ArchivedFile>> {
    let Some(path) = path.filter(|p| p.is_file()) else {
        return Ok(None);
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    Ok(Some(ArchivedFile {
        name,
        contents: fs::read(path)?,
    }))
}

/// Collect a session's current state into an archive.
pub fn collect_archive(files: &SessionFiles) -> Result<SessionArchive> {
    let session = files.load_session()?;
    let mut tables = Vec::new();
    for kind in session.tables() {
        tables.push(ArchivedTable {
            table: kind,
            csv: archived_file(session.csv_path(kind))?,
            report: archived_file(session.report_path(kind))?,
            document: files.load_document(DocumentSlot::Table(kind))?,
            baseline: files.load_baseline(kind)?,
            edits: files.load_edits(kind)?,
            changes: files.load_changes(kind)?,
        });
    }
    let display = if session.is_paired() {
        files.read(&crate::session::Artifact::Document(DocumentSlot::Display))?
    } else {
        None
    };

    Ok(SessionArchive {
        version: ARCHIVE_VERSION,
        session,
        tables,
        display,
    })
}

/// Gzip-compressed archive bytes of a session.
pub fn export_archive(files: &SessionFiles) -> Result<Vec<u8>> {
    let archive = collect_archive(files)?;
    let mut bytes = Vec::new();
    write_archive(&archive, &mut bytes)?;
    Ok(bytes)
}

/// Recreate an archived session under a fresh id.
///
/// Uploaded files and reports are written into the new session directory and
/// the descriptor's paths point there. The undo history starts empty.
pub fn import_archive(store: &dyn SessionStore, bytes: &[u8]) -> Result<Session> {
    let archive = read_archive(bytes)?;
    let session_id = Uuid::new_v4().to_string();
    store.create(&session_id)?;

    match restore(store, &session_id, archive) {
        Ok(session) => {
            info!(session = %session_id, "imported session archive");
            Ok(session)
        }
        Err(e) => {
            if let Err(cleanup) = store.delete(&session_id) {
                warn!(session = %session_id, error = %cleanup, "failed to remove partial import");
            }
            Err(e)
        }
    }
}

fn restore(store: &dyn SessionStore, session_id: &str, archive: SessionArchive) -> Result<Session> {
    let files = SessionFiles::new(store, session_id);
    let dir = store.session_dir(session_id)?;

    let mut session = archive.session;
    session.session_id = session_id.to_string();
    session.meta_csv_path = None;
    session.cits_csv_path = None;
    session.meta_report_path = None;
    session.cits_report_path = None;

    for table in archive.tables {
        if !session.has(table.table) {
            return Err(EditorError::invalid(format!(
                "archive holds a {} table the session does not declare",
                table.table
            )));
        }
        if let Some(csv) = table.csv {
            let path = dir.join(sanitize_file_name(&csv.name, &table.table.default_upload_name()));
            fs::write(&path, &csv.contents)?;
            session.set_csv_path(table.table, path);
        }
        if let Some(report) = table.report {
            let fallback = format!("{}_report.json", table.table);
            let path = dir.join(sanitize_file_name(&report.name, &fallback));
            fs::write(&path, &report.contents)?;
            session.set_report_path(table.table, path);
        }
        files.save_document(DocumentSlot::Table(table.table), &table.document)?;
        if let Some(baseline) = &table.baseline {
            files.save_baseline(table.table, baseline)?;
        }
        files.save_edits(table.table, &table.edits)?;
        files.save_changes(table.table, &table.changes)?;
    }
    if let Some(display) = &archive.display {
        files.save_document(DocumentSlot::Display, display)?;
    }

    session.touch();
    files.save_session(&session)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FileSessionStore;
    use tempfile::TempDir;

    fn sample_archive() -> SessionArchive {
        let mut edits = EditLog::new();
        edits.record("0-title-0", "Old", "New");
        SessionArchive {
            version: ARCHIVE_VERSION,
            session: Session::new("original", true, false, true),
            tables: vec![ArchivedTable {
                table: TableKind::Meta,
                csv: Some(ArchivedFile {
                    name: "my meta.csv".to_string(),
                    contents: b"id,title\ndoi:1,New\n".to_vec(),
                }),
                report: None,
                document: "<table id=\"table-data\"></table>".to_string(),
                baseline: None,
                edits,
                changes: ChangeLog::new(),
            }],
            display: None,
        }
    }

    #[test]
    fn archives_survive_compression() {
        let archive = sample_archive();
        let mut bytes = Vec::new();
        write_archive(&archive, &mut bytes).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(read_archive(bytes.as_slice()).unwrap(), archive);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(read_archive(&b"not an archive"[..]).is_err());
    }

    #[test]
    fn import_rebases_into_a_new_session() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();

        let mut bytes = Vec::new();
        write_archive(&sample_archive(), &mut bytes).unwrap();
        let session = import_archive(&store, &bytes).unwrap();

        assert_ne!(session.session_id, "original");
        assert!(session.verify_id_existence);
        let csv = session.meta_csv_path.clone().unwrap();
        assert!(csv.starts_with(dir.path().join(&session.session_id)));
        assert_eq!(csv.file_name().unwrap(), "my_meta.csv");

        let files = SessionFiles::new(&store, &session.session_id);
        assert_eq!(files.load_edits(TableKind::Meta).unwrap().edited_count(), 1);
    }
}
