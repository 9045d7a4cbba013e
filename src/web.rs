#![cfg(not(tarpaulin_include))]

use env_logger::Env;
use oc_table_editor::app;
use oc_table_editor::config::EditorConfig;

/// Main entry point for the table editor web service
///
/// Reads `OC_EDITOR_*` settings from the environment and serves the editor
/// until the process is stopped. Log output is controlled with `RUST_LOG`.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = EditorConfig::from_env()?;
    app::run(config).await
}
