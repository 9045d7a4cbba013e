mod common;

use common::{harness, harness_with, session_files, upload};
use oc_table_editor::editor::Upload;
use oc_table_editor::{EditorConfig, EditorError, TableDocument, TableKind};
use std::sync::atomic::Ordering;
use std::time::Duration;

const META_CSV: &str = "id,title,author\ndoi:10.1/a,INVALID title,Smith; Jones\ndoi:10.1/b,Second,Lee\n";

fn item(editor: &oc_table_editor::Editor, session: &str, id: &str) -> Option<String> {
    let html = editor.raw_document(session, None).unwrap();
    TableDocument::parse(&html).unwrap().item_value(id)
}

#[test]
fn blanking_an_author_prunes_it_from_the_export() {
    let h = harness();
    let created = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap();
    let id = created.session_id.as_str();
    assert_eq!(created.validation.total_issues(), 1);

    assert_eq!(item(&h.editor, id, "0-author-0").as_deref(), Some("Smith"));
    assert_eq!(item(&h.editor, id, "0-author-1").as_deref(), Some("Jones"));
    assert!(h.editor.export_csv(id, None).unwrap().content.contains("Smith; Jones"));

    let edited = h.editor.set_item_value(id, None, "0-author-1", "").unwrap();
    assert!(edited.outcome.pruned);
    assert_eq!(edited.outcome.previous, "Jones");
    assert_eq!(item(&h.editor, id, "0-author-1"), None);

    let export = h.editor.export_csv(id, None).unwrap();
    assert_eq!(export.file_name, "metadata_edited.csv");
    let lines: Vec<&str> = export.content.lines().collect();
    assert_eq!(lines[0], "id,title,author");
    assert_eq!(lines[1], "doi:10.1/a,INVALID title,Smith");
    assert_eq!(lines[2], "doi:10.1/b,Second,Lee");
}

#[test]
fn undo_and_redo_restore_document_and_tracking() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    let before_doc = h.editor.raw_document(&id, None).unwrap();
    let before_edits = h.editor.edited_items(&id, None).unwrap();
    assert!(before_edits.is_empty());

    let edited = h.editor.set_item_value(&id, None, "1-title-0", "Corrected").unwrap();
    assert!(edited.availability.can_undo);
    assert!(!edited.availability.can_redo);
    let after_doc = h.editor.raw_document(&id, None).unwrap();
    let after_edits = h.editor.edited_items(&id, None).unwrap();
    assert_eq!(after_edits.len(), 1);
    assert_eq!(after_edits[0].original_value, "Second");
    assert_eq!(after_edits[0].edited_value, "Corrected");

    let undone = h.editor.undo(&id, None).unwrap();
    assert!(undone.applied);
    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before_doc);
    assert_eq!(h.editor.edited_items(&id, None).unwrap(), before_edits);
    assert!(undone.availability.can_redo);

    let redone = h.editor.redo(&id, None).unwrap();
    assert!(redone.applied);
    assert_eq!(h.editor.raw_document(&id, None).unwrap(), after_doc);
    assert_eq!(h.editor.edited_items(&id, None).unwrap(), after_edits);
}

#[test]
fn row_changes_are_part_of_the_snapshot() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    let added = h.editor.add_row(&id, None).unwrap();
    assert_eq!(added.outcome.row_id, "row2");
    assert!(added.document.contains("added-row"));

    h.editor.undo(&id, None).unwrap();
    let current = h.editor.current_document(&id, None).unwrap();
    assert!(!current.contains("added-row"));
    assert!(!TableDocument::parse(&current).unwrap().row_ids().iter().any(|r| r.number() == 2));

    let redone = h.editor.redo(&id, None).unwrap();
    assert!(redone.document.contains("added-row"));
}

#[test]
fn a_new_edit_after_undo_discards_redo() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    h.editor.set_item_value(&id, None, "1-title-0", "First").unwrap();
    h.editor.undo(&id, None).unwrap();
    assert!(h.editor.history_availability(&id, None).unwrap().can_redo);

    h.editor.set_item_value(&id, None, "1-title-0", "Other").unwrap();
    assert!(!h.editor.history_availability(&id, None).unwrap().can_redo);

    let step = h.editor.redo(&id, None).unwrap();
    assert!(!step.applied);
    assert_eq!(item(&h.editor, &id, "1-title-0").as_deref(), Some("Other"));
}

#[test]
fn history_depth_evicts_the_oldest_snapshot() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    for i in 0..21 {
        h.editor.set_item_value(&id, None, "1-title-0", &format!("v{i}")).unwrap();
    }

    let files = session_files(h.dir.path(), &id);
    let snapshots: Vec<&String> = files.iter().filter(|f| f.ends_with(".html") && f.starts_with("undo")).collect();
    assert_eq!(snapshots.len(), 20);
    assert!(!files.iter().any(|f| f.ends_with("meta_0.html")));
    assert!(!files.iter().any(|f| f.ends_with("meta_0.edits.json")));
    assert!(files.iter().any(|f| f.ends_with("meta_20.html")));

    for _ in 0..20 {
        assert!(h.editor.undo(&id, None).unwrap().applied);
    }
    assert!(!h.editor.undo(&id, None).unwrap().applied);
    assert_eq!(item(&h.editor, &id, "1-title-0").as_deref(), Some("v0"));
}

#[test]
fn a_change_that_changes_nothing_is_not_recorded() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    let deleted = h.editor.delete_row(&id, None, "row9").unwrap();
    assert!(!deleted.outcome);
    assert!(!deleted.availability.can_undo);

    let removed = h.editor.remove_item(&id, None, "0-author-7").unwrap();
    assert_eq!(removed.outcome, None);
    assert!(!h.editor.session_info(&id).unwrap().has_edits_since_validation);
}

#[test]
fn failed_mutations_leave_the_document_alone() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;
    let before = h.editor.raw_document(&id, None).unwrap();

    let missing = h.editor.set_item_value(&id, None, "5-title-0", "x").unwrap_err();
    assert!(missing.is_not_found());

    let single = h.editor.append_item(&id, None, "0-title-0", None, Some("x")).unwrap_err();
    assert!(matches!(single, EditorError::InvalidState(_)));

    let malformed = h.editor.clear_cell(&id, None, "r0", "title").unwrap_err();
    assert!(matches!(malformed, EditorError::InvalidState(_)));

    let no_field = h.editor.clear_cell(&id, None, "row0", "volume").unwrap_err();
    assert!(no_field.is_not_found());

    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before);
    assert!(!h.editor.history_availability(&id, None).unwrap().can_undo);
}

#[test]
fn deleted_rows_and_items_show_as_ghosts() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    h.editor.remove_item(&id, None, "0-author-0").unwrap();
    h.editor.delete_row(&id, None, "row1").unwrap();

    let diff = h.editor.deletion_diff(&id, None).unwrap();
    assert_eq!(diff.deleted_rows, vec!["row1".to_string()]);
    assert_eq!(diff.deleted_items, vec!["0-author-0".to_string()]);
    assert_eq!(diff.deleted_item_values.get("0-author-0").map(String::as_str), Some("Smith"));

    let shown = h.editor.current_document(&id, None).unwrap();
    assert!(shown.contains("ghost-row"));
    assert!(shown.contains("ghost-item"));
    // ghosts are display only
    assert!(!h.editor.raw_document(&id, None).unwrap().contains("ghost-row"));
    assert!(h.editor.export_csv(&id, None).unwrap().content.lines().count() == 2);
}

#[test]
fn appended_items_get_fresh_indices() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    let first = h.editor.append_item(&id, None, "0-author-0", Some("; "), Some("Brown")).unwrap();
    assert_eq!(first.outcome, "0-author-2");
    h.editor.remove_item(&id, None, "0-author-2").unwrap();
    let second = h.editor.append_item(&id, None, "0-author-0", Some("; "), None).unwrap();
    assert_eq!(second.outcome, "0-author-3");

    h.editor.set_item_value(&id, None, "0-author-3", "White").unwrap();
    let export = h.editor.export_csv(&id, None).unwrap();
    assert!(export.content.contains("Smith; Jones; White"));
}

#[test]
fn export_keeps_the_upload_delimiter() {
    let h = harness();
    let csv = "id;title;author\ndoi:10.1/a;INVALID;\"Smith; Jones\"\n";
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "semi.csv", csv)], None)
        .unwrap()
        .session_id;

    h.editor.set_item_value(&id, None, "0-title-0", "Fixed").unwrap();
    let export = h.editor.export_csv(&id, None).unwrap();
    let lines: Vec<&str> = export.content.lines().collect();
    assert_eq!(lines[0], "id;title;author");
    assert_eq!(lines[1], "doi:10.1/a;Fixed;\"Smith; Jones\"");
}

#[test]
fn uploads_are_checked_before_anything_is_stored() {
    let h = harness_with(EditorConfig {
        max_upload_bytes: 16,
        ..EditorConfig::default()
    });

    let none = h.editor.create_session(Vec::new(), None).unwrap_err();
    assert!(matches!(none, EditorError::InvalidState(_)));

    let empty = Upload {
        table: TableKind::Meta,
        file_name: None,
        contents: Vec::new(),
    };
    assert!(h.editor.create_session(vec![empty], None).is_err());

    let large = h.editor.create_session(vec![upload(TableKind::Meta, "m.csv", META_CSV)], None);
    assert!(matches!(large, Err(EditorError::InvalidState(_))));
    assert!(h.editor.list_drafts().unwrap().is_empty());
}

#[test]
fn verify_flag_reaches_the_validator() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], Some(true))
        .unwrap()
        .session_id;
    assert!(h.validator.last_verify.load(std::sync::atomic::Ordering::SeqCst));
    assert!(h.editor.session_info(&id).unwrap().verify_id_existence);

    h.editor.revalidate(&id, Some(false)).unwrap();
    assert!(!h.validator.last_verify.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!h.editor.session_info(&id).unwrap().verify_id_existence);
}

#[test]
fn issues_lead_to_their_rows() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    assert_eq!(h.editor.rows_by_issue(&id, None, "meta-0").unwrap(), vec![0]);
    assert!(h.editor.rows_by_issue(&id, None, "meta-9").unwrap().is_empty());

    let filtered = TableDocument::parse(&h.editor.filtered_rows(&id, None, "meta-0").unwrap()).unwrap();
    assert_eq!(filtered.row_ids().len(), 1);
    assert_eq!(filtered.item_value("0-author-1").as_deref(), Some("Jones"));
}

#[test]
fn drafts_and_expiry() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;

    let info = h.editor.save_draft(&id, Some("  spring batch ".to_string())).unwrap();
    assert_eq!(info.draft_name.as_deref(), Some("spring batch"));
    let drafts = h.editor.list_drafts().unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].session_id, id);

    assert!(h.editor.purge_older_than(Duration::from_secs(3600)).unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(h.editor.purge_older_than(Duration::ZERO).unwrap(), vec![id.clone()]);
    assert!(h.editor.session_info(&id).unwrap_err().is_not_found());
}

#[test]
fn archives_recreate_the_session() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;
    h.editor.set_item_value(&id, None, "1-title-0", "Corrected").unwrap();

    let bytes = h.editor.export_archive(&id).unwrap();
    let imported = h.editor.import_archive(&bytes).unwrap();
    let copy = imported.session_id.as_str();

    assert_ne!(copy, id);
    assert_eq!(imported.edited_items, 1);
    assert_eq!(h.editor.raw_document(copy, None).unwrap(), h.editor.raw_document(&id, None).unwrap());
    assert_eq!(h.editor.export_csv(copy, None).unwrap(), h.editor.export_csv(&id, None).unwrap());
    assert!(!h.editor.history_availability(copy, None).unwrap().can_undo);
    assert_eq!(h.editor.deletion_diff(copy, None).unwrap(), h.editor.deletion_diff(&id, None).unwrap());
}

#[test]
fn failed_edit_state_write_rolls_the_mutation_back() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;
    let before = h.editor.raw_document(&id, None).unwrap();

    h.store.fail_edit_state.store(true, Ordering::SeqCst);
    let err = h.editor.set_item_value(&id, None, "1-title-0", "Renamed").unwrap_err();
    assert!(matches!(err, EditorError::Io(_)));
    h.store.fail_edit_state.store(false, Ordering::SeqCst);

    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before);
    assert!(h.editor.edited_items(&id, None).unwrap().is_empty());
    assert!(!h.editor.history_availability(&id, None).unwrap().can_undo);
}

#[test]
fn failed_history_write_rolls_the_mutation_back() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;
    let before = h.editor.raw_document(&id, None).unwrap();

    h.store.fail_history_index.store(true, Ordering::SeqCst);
    assert!(h.editor.add_row(&id, None).is_err());
    h.store.fail_history_index.store(false, Ordering::SeqCst);

    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before);
    assert!(!h.editor.history_availability(&id, None).unwrap().can_undo);
    let files = session_files(h.dir.path(), &id);
    assert!(!files.iter().any(|f| f.starts_with("undo/")), "orphan snapshots: {files:?}");

    // the session keeps working once the store recovers
    h.editor.set_item_value(&id, None, "1-title-0", "Renamed").unwrap();
    assert!(h.editor.undo(&id, None).unwrap().applied);
    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before);
}

#[test]
fn failed_undo_write_keeps_the_undo_available() {
    let h = harness();
    let id = h
        .editor
        .create_session(vec![upload(TableKind::Meta, "meta.csv", META_CSV)], None)
        .unwrap()
        .session_id;
    let before = h.editor.raw_document(&id, None).unwrap();
    h.editor.set_item_value(&id, None, "1-title-0", "Renamed").unwrap();
    let edited = h.editor.raw_document(&id, None).unwrap();

    h.store.fail_edit_state.store(true, Ordering::SeqCst);
    assert!(h.editor.undo(&id, None).is_err());
    h.store.fail_edit_state.store(false, Ordering::SeqCst);

    assert_eq!(h.editor.raw_document(&id, None).unwrap(), edited);
    assert_eq!(h.editor.edited_items(&id, None).unwrap().len(), 1);
    let availability = h.editor.history_availability(&id, None).unwrap();
    assert!(availability.can_undo);
    assert!(!availability.can_redo);

    assert!(h.editor.undo(&id, None).unwrap().applied);
    assert_eq!(h.editor.raw_document(&id, None).unwrap(), before);
}
