//! Subcommand handlers for the ResearchOps CLI.

use crate::{Commands, ConfigAction};
use researchops_core::config::{ResearchOpsConfig, load_config};
use researchops_core::providers::Dependencies;
use researchops_core::{ResearchOpsAgent, ResearchOpsError};
use std::path::{Path, PathBuf};

/// Dispatch a parsed subcommand and return the text to print on stdout.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<String> {
    match command {
        Commands::Run {
            query,
            max_papers,
            paper_files,
            local_embeddings,
        } => {
            let mut config = load_config(Some(workspace), config_file, None)?;
            config
                .paper_files
                .extend(paper_files.into_iter().map(|p| resolve(workspace, p)));
            if local_embeddings {
                config.embedding.local = true;
            }
            handle_run(&config, &query, max_papers).await
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

async fn handle_run(
    config: &ResearchOpsConfig,
    query: &str,
    max_papers: usize,
) -> anyhow::Result<String> {
    let deps = Dependencies::from_config(config)?;
    if deps.sources.is_empty() {
        tracing::warn!("No paper sources configured; pass --papers or set paper_files");
    }
    let agent = ResearchOpsAgent::from_config(deps, config);
    match agent.run(query, max_papers).await {
        Ok(outcome) => Ok(serde_json::to_string_pretty(&outcome)?),
        Err(err) => Err(error_report(&err)),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<String> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".researchops");
            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                return Ok(format!(
                    "Config file already exists at {}",
                    config_path.display()
                ));
            }
            std::fs::create_dir_all(&config_dir)?;
            let toml = ResearchOpsConfig::default().to_toml_string()?;
            std::fs::write(&config_path, toml)?;
            Ok(format!("Created config file at {}", config_path.display()))
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), config_file, None)?;
            Ok(config.to_toml_string()?)
        }
    }
}

fn resolve(workspace: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

/// Render a pipeline error as the structured JSON error response.
fn error_report(err: &ResearchOpsError) -> anyhow::Error {
    let response = err.to_response();
    match serde_json::to_string_pretty(&response) {
        Ok(json) => anyhow::anyhow!(json),
        Err(_) => anyhow::anyhow!(err.to_string()),
    }
}
