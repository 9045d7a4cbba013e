//! Validator, renderer and merger interfaces, and an adapter that drives an
//! external program implementing all three.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

use crate::config::CollaboratorCommand;
use crate::error::ExternalError;

/// One finding of the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub error_type: String,
    pub message: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOptions {
    pub verify_id_existence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub issues: Vec<Issue>,
    /// JSON report written by the validator.
    pub report: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub meta: ValidationOutcome,
    pub cits: ValidationOutcome,
}

pub trait Validator: Send + Sync {
    /// Validate one CSV, writing the report under `output_dir`.
    fn validate(
        &self,
        csv: &Path,
        output_dir: &Path,
        options: &ValidationOptions,
    ) -> Result<ValidationOutcome, ExternalError>;

    /// Validate a metadata/citations pair, cross-checking references between them.
    fn validate_pair(
        &self,
        meta_csv: &Path,
        cits_csv: &Path,
        output_dir: &Path,
        options: &ValidationOptions,
    ) -> Result<PairOutcome, ExternalError>;
}

pub trait Renderer: Send + Sync {
    /// Render a CSV and its report into a `table-data` document.
    fn render(&self, csv: &Path, report: &Path) -> Result<String, ExternalError>;
}

pub trait Merger: Send + Sync {
    /// Merge two rendered documents into one display document.
    fn merge(&self, first: &str, second: &str) -> Result<String, ExternalError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub renderer: Arc<dyn Renderer>,
    pub merger: Arc<dyn Merger>,
}

impl Collaborators {
    pub fn new(
        validator: Arc<dyn Validator>,
        renderer: Arc<dyn Renderer>,
        merger: Arc<dyn Merger>,
    ) -> Self {
        Collaborators {
            validator,
            renderer,
            merger,
        }
    }

    /// All three roles served by one external program.
    pub fn from_command(command: CollaboratorCommand) -> Self {
        let shared = Arc::new(CommandCollaborators::new(command));
        Collaborators {
            validator: shared.clone(),
            renderer: shared.clone(),
            merger: shared,
        }
    }
}

/// Runs `PROGRAM <subcommand> ...` for each collaborator call.
///
/// Validation results are read from stdout as JSON; rendered and merged
/// documents are written by the program to the `--out` path.
#[derive(Debug, Clone)]
pub struct CommandCollaborators {
    command: CollaboratorCommand,
}

impl CommandCollaborators {
    pub fn new(command: CollaboratorCommand) -> Self {
        CommandCollaborators { command }
    }

    fn run(&self, args: &[String]) -> Result<String, ExternalError> {
        debug!(program = %self.command.program.display(), ?args, "running collaborator");
        let output = Command::new(&self.command.program)
            .args(&self.command.args)
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} ({})", stderr.trim(), output.status).into());
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    fn validation_args(subcommand: &str, inputs: &[(&str, &Path)], output_dir: &Path, options: &ValidationOptions) -> Vec<String> {
        let mut args = vec![subcommand.to_string()];
        for (flag, path) in inputs {
            args.push(flag.to_string());
            args.push(path.display().to_string());
        }
        args.push("--out".to_string());
        args.push(output_dir.display().to_string());
        if options.verify_id_existence {
            args.push("--verify-ids".to_string());
        }
        args
    }

    /// Run a subcommand that writes an HTML document to a scratch file.
    fn run_to_file(&self, mut args: Vec<String>) -> Result<String, ExternalError> {
        let out = tempfile::Builder::new().suffix(".html").tempfile()?;
        args.push("--out".to_string());
        args.push(out.path().display().to_string());
        self.run(&args)?;
        Ok(fs::read_to_string(out.path())?)
    }
}

impl Validator for CommandCollaborators {
    fn validate(
        &self,
        csv: &Path,
        output_dir: &Path,
        options: &ValidationOptions,
    ) -> Result<ValidationOutcome, ExternalError> {
        let args = Self::validation_args("validate", &[("--csv", csv)], output_dir, options);
        Ok(serde_json::from_str(&self.run(&args)?)?)
    }

    fn validate_pair(
        &self,
        meta_csv: &Path,
        cits_csv: &Path,
        output_dir: &Path,
        options: &ValidationOptions,
    ) -> Result<PairOutcome, ExternalError> {
        let args = Self::validation_args(
            "validate-pair",
            &[("--meta", meta_csv), ("--cits", cits_csv)],
            output_dir,
            options,
        );
        Ok(serde_json::from_str(&self.run(&args)?)?)
    }
}

impl Renderer for CommandCollaborators {
    fn render(&self, csv: &Path, report: &Path) -> Result<String, ExternalError> {
        self.run_to_file(vec![
            "render".to_string(),
            "--csv".to_string(),
            csv.display().to_string(),
            "--report".to_string(),
            report.display().to_string(),
        ])
    }
}

impl Merger for CommandCollaborators {
    fn merge(&self, first: &str, second: &str) -> Result<String, ExternalError> {
        let first_file = tempfile::Builder::new().suffix(".html").tempfile()?;
        let second_file = tempfile::Builder::new().suffix(".html").tempfile()?;
        fs::write(first_file.path(), first)?;
        fs::write(second_file.path(), second)?;
        self.run_to_file(vec![
            "merge".to_string(),
            "--first".to_string(),
            first_file.path().display().to_string(),
            "--second".to_string(),
            second_file.path().display().to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_keep_extra_fields() {
        let json = r#"{"error_type":"error","message":"bad id","position":{"row":3}}"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.error_type, "error");
        assert_eq!(issue.details["position"]["row"], 3);
    }

    #[test]
    fn validation_arguments() {
        let args = CommandCollaborators::validation_args(
            "validate",
            &[("--csv", Path::new("/s/meta.csv"))],
            Path::new("/s"),
            &ValidationOptions { verify_id_existence: true },
        );
        assert_eq!(args, vec!["validate", "--csv", "/s/meta.csv", "--out", "/s", "--verify-ids"]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_programs_report_stderr() {
        let command: CollaboratorCommand = "sh -c".parse().unwrap();
        let runner = CommandCollaborators::new(command);
        let err = runner
            .run(&["echo broken >&2; exit 3".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
