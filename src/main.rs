use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

mod agent;
mod cli;
mod config;
mod control;
mod dispatch;
mod executor;
mod git;
mod lock;
mod recovery;
mod runtime;
mod shutdown;
mod state;
mod telemetry;
mod transport;
mod worktree;

use crate::config::Settings;
use cli::Cli;
use control::ControlPlaneClient;
use executor::ExecutorOptions;
use lock::InstanceLock;
use runtime::Runtime;
use state::StateStore;

#[tokio::main]
async fn main() -> ExitCode {
    // Flag errors exit 1; --help and --version exit clean.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let benign = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            return if benign { ExitCode::SUCCESS } else { ExitCode::from(1) };
        }
    };

    if let Err(e) = config::load_env_file() {
        eprintln!("Warning: failed to load .env file: {e}");
    }
    if let Err(e) = telemetry::init_telemetry() {
        eprintln!("Warning: failed to initialize telemetry: {e}");
    }

    let result = run(cli).await;
    telemetry::shutdown_telemetry();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dockhand: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load().context("configuration")?;

    if cli.bypass_permissions {
        eprintln!(
            "WARNING: --bypass-permissions is set; the agent CLI will modify files and run \
             commands without asking for confirmation"
        );
    }

    let repo = git::detect_repository(cli.repo.as_deref()).context("repository detection")?;

    // One instance per working directory, and per repository when distinct.
    let cwd = std::env::current_dir()?;
    let _cwd_lock = InstanceLock::acquire_for_dir(&cwd)?;
    let _repo_lock = match repo.repo_path() {
        Some(path) if path.canonicalize().ok() != cwd.canonicalize().ok() => {
            Some(InstanceLock::acquire_for_dir(path)?)
        }
        _ => None,
    };

    // Handshake alias: per-process override, else the repository identifier.
    let agent_alias = match (settings.agent_alias.clone(), repo.repository_id()) {
        (Some(alias), _) => alias,
        (None, Some(repository_id)) => repository_id.to_string(),
        (None, None) => anyhow::bail!(
            "AGENT_ALIAS is required when running outside a git repository"
        ),
    };

    let control = Arc::new(ControlPlaneClient::new(
        &settings.ws_api_url,
        settings.api_key.clone(),
        settings.http_proxy_for_agent.is_some(),
        settings.exec_user.clone(),
    ));
    let adapter = agent::adapter_for(&cli.agent, Arc::clone(&control))?;
    if let Some(model) = &cli.model {
        adapter.validate_model(model)?;
    }

    let store = Arc::new(
        StateStore::load(config::state_file_path())
            .await
            .context("state store")?,
    );
    store.set_repository_context(repo.clone()).await?;
    let agent_id = store.agent_id().await;

    info!(
        agent_id = %agent_id,
        agent = adapter.name(),
        repo_mode = repo.is_repo(),
        alias = %agent_alias,
        host = %hostname::get().unwrap_or_default().to_string_lossy(),
        "dockhand starting"
    );

    Runtime {
        settings,
        store,
        repo,
        adapter,
        agent_id,
        agent_alias,
        executor_options: ExecutorOptions {
            model: cli.model.clone(),
            bypass_permissions: cli.bypass_permissions,
            ..ExecutorOptions::default()
        },
    }
    .run()
    .await
}
