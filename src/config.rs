//! Runtime configuration.
//!
//! Sessions live under `temp/` by default, uploads are capped at 100 MiB and
//! sessions expire after 24 hours. Every value can be overridden with an
//! `OC_EDITOR_*` environment variable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EditorError, Result};

pub const DEFAULT_SESSION_DIR: &str = "temp";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_UNDO_DEPTH: usize = 20;
pub const DEFAULT_SESSION_EXPIRY_HOURS: u64 = 24;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8000";

/// What revalidation does with edit highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EditTrackingPolicy {
    /// Revalidation is an "accept and recheck" boundary: highlights are dropped.
    #[default]
    Drop,
    /// Edited items stay highlighted across revalidations.
    Preserve,
}

impl FromStr for EditTrackingPolicy {
    type Err = EditorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(EditTrackingPolicy::Drop),
            "preserve" | "keep" => Ok(EditTrackingPolicy::Preserve),
            other => Err(EditorError::invalid(format!(
                "unknown edit tracking policy '{other}'"
            ))),
        }
    }
}

/// External program implementing the validator, renderer and merger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl FromStr for CollaboratorCommand {
    type Err = EditorError;

    /// Parses a whitespace separated command line, e.g. `python3 -m oc_bridge`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EditorError::invalid("collaborator command is empty"))?;
        Ok(CollaboratorCommand {
            program: PathBuf::from(program),
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    /// Root directory holding one sub-directory per session.
    pub session_dir: PathBuf,

    /// Largest accepted upload, per file.
    pub max_upload_bytes: u64,

    /// Default for checking identifier existence against external services.
    pub verify_id_existence: bool,

    /// Undo stack depth per table variant.
    pub max_undo_depth: usize,

    /// Sessions untouched for longer than this are purged. `None` keeps them forever.
    pub session_expiry_hours: Option<u64>,

    pub cleanup_interval_secs: u64,

    pub bind_address: String,

    pub edit_tracking: EditTrackingPolicy,

    pub collaborator: Option<CollaboratorCommand>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        EditorConfig {
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            verify_id_existence: false,
            max_undo_depth: DEFAULT_MAX_UNDO_DEPTH,
            session_expiry_hours: Some(DEFAULT_SESSION_EXPIRY_HOURS),
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            edit_tracking: EditTrackingPolicy::Drop,
            collaborator: None,
        }
    }
}

impl EditorConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; set keys that don't parse are rejected.
    ///
    /// # Arguments
    /// * `lookup` - Returns the raw value for an `OC_EDITOR_*` key, if set
    ///
    /// # Returns
    /// * `Result<EditorConfig>` - The merged configuration or an `InvalidState` error
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = EditorConfig::default();

        if let Some(dir) = lookup("OC_EDITOR_SESSION_DIR") {
            config.session_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("OC_EDITOR_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_value("OC_EDITOR_MAX_UPLOAD_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("OC_EDITOR_VERIFY_IDS") {
            config.verify_id_existence = parse_flag("OC_EDITOR_VERIFY_IDS", &raw)?;
        }
        if let Some(raw) = lookup("OC_EDITOR_UNDO_DEPTH") {
            let depth: usize = parse_value("OC_EDITOR_UNDO_DEPTH", &raw)?;
            if depth == 0 {
                return Err(EditorError::invalid("OC_EDITOR_UNDO_DEPTH must be at least 1"));
            }
            config.max_undo_depth = depth;
        }
        if let Some(raw) = lookup("OC_EDITOR_SESSION_EXPIRY_HOURS") {
            let hours: u64 = parse_value("OC_EDITOR_SESSION_EXPIRY_HOURS", &raw)?;
            config.session_expiry_hours = (hours > 0).then_some(hours);
        }
        if let Some(raw) = lookup("OC_EDITOR_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = parse_value("OC_EDITOR_CLEANUP_INTERVAL_SECS", &raw)?;
        }
        if let Some(bind) = lookup("OC_EDITOR_BIND") {
            config.bind_address = bind;
        }
        if let Some(raw) = lookup("OC_EDITOR_EDIT_TRACKING_POLICY") {
            config.edit_tracking = raw.parse()?;
        }
        if let Some(raw) = lookup("OC_EDITOR_COLLABORATOR") {
            config.collaborator = Some(raw.parse()?);
        }

        Ok(config)
    }

    pub fn session_expiry(&self) -> Option<Duration> {
        self.session_expiry_hours
            .map(|hours| Duration::from_secs(hours * 60 * 60))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| EditorError::invalid(format!("{key}: cannot parse '{raw}'")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EditorError::invalid(format!("{key}: expected a boolean, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = EditorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.session_dir, PathBuf::from("temp"));
        assert_eq!(config.max_undo_depth, 20);
        assert_eq!(config.edit_tracking, EditTrackingPolicy::Drop);
        assert_eq!(config.session_expiry(), Some(Duration::from_secs(86_400)));
        assert!(config.collaborator.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = EditorConfig::from_lookup(lookup(&[
            ("OC_EDITOR_SESSION_DIR", "/var/lib/oc"),
            ("OC_EDITOR_UNDO_DEPTH", "5"),
            ("OC_EDITOR_VERIFY_IDS", "yes"),
            ("OC_EDITOR_SESSION_EXPIRY_HOURS", "0"),
            ("OC_EDITOR_EDIT_TRACKING_POLICY", "preserve"),
            ("OC_EDITOR_COLLABORATOR", "python3 -m oc_bridge"),
        ]))
        .unwrap();

        assert_eq!(config.session_dir, PathBuf::from("/var/lib/oc"));
        assert_eq!(config.max_undo_depth, 5);
        assert!(config.verify_id_existence);
        assert_eq!(config.session_expiry(), None);
        assert_eq!(config.edit_tracking, EditTrackingPolicy::Preserve);
        let command = config.collaborator.unwrap();
        assert_eq!(command.program, PathBuf::from("python3"));
        assert_eq!(command.args, vec!["-m", "oc_bridge"]);
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = EditorConfig::from_lookup(lookup(&[("OC_EDITOR_UNDO_DEPTH", "many")]));
        assert!(matches!(err, Err(EditorError::InvalidState(_))));

        let err = EditorConfig::from_lookup(lookup(&[("OC_EDITOR_UNDO_DEPTH", "0")]));
        assert!(matches!(err, Err(EditorError::InvalidState(_))));

        let err = EditorConfig::from_lookup(lookup(&[("OC_EDITOR_VERIFY_IDS", "maybe")]));
        assert!(matches!(err, Err(EditorError::InvalidState(_))));
    }
}
