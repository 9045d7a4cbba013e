#![cfg(not(tarpaulin_include))]

use oc_table_editor::codec;
use oc_table_editor::diff;
use oc_table_editor::document::TableDocument;
use std::env;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

const USAGE: &str = "\
Usage:
  table_cli export <document.html> [--original <file.csv>]
  table_cli diff <baseline.html> <current.html>
  table_cli issue-rows <document.html> <issue-id>";

fn load(path: &str) -> Result<TableDocument, Box<dyn std::error::Error>> {
    let html = fs::read_to_string(path)?;
    Ok(TableDocument::parse(&html)?)
}

fn export(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (document, original) = match args {
        [document] => (document, None),
        [document, flag, original] if flag == "--original" => (document, Some(original)),
        _ => return Err(USAGE.into()),
    };
    let rows = codec::parse_document(&load(document)?);
    let delimiter = match original {
        Some(path) => codec::sniff_file_delimiter(Path::new(path), Some(rows.fields.len()))?,
        None => b',',
    };
    print!("{}", codec::serialize_rows(&rows, delimiter)?);
    Ok(())
}

fn deletions(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [baseline, current] = args else {
        return Err(USAGE.into());
    };
    let result = diff::diff(&load(baseline)?, &load(current)?);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn issue_rows(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [document, issue] = args else {
        return Err(USAGE.into());
    };
    for row in load(document)?.rows_by_issue(issue) {
        println!("{row}");
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let result = match command.as_str() {
        "export" => export(rest),
        "diff" => deletions(rest),
        "issue-rows" => issue_rows(rest),
        _ => Err(USAGE.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
