use anyhow::{Context, Result};
use oracle_config::{load_from_env_or_default, validate};
use oracle_storage::SqliteStore;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod caches;
mod error;
mod gating;
mod middleware;
mod rate_limit;
mod routes_admin;
mod routes_dashboard;
mod routes_oracle;
mod routes_webhooks;
mod state;
mod tasks;
mod web;
mod ws;

use state::AppContext;

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli_config = parse_config_arg();
    let default_path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        mint = %config.token.mint,
        "configuration loaded"
    );
    validate(&config).context("configuration validation failed")?;

    let sqlite_path = PathBuf::from(&config.sqlite.path);
    let mut store = SqliteStore::open(&sqlite_path).context("failed to initialize sqlite store")?;
    let migrations_dir = resolve_migrations_dir(&loaded_config_path, &config.system.migrations_dir);
    let applied = store
        .run_migrations(&migrations_dir)
        .with_context(|| format!("failed to apply migrations in {}", migrations_dir.display()))?;
    info!(applied, "sqlite migrations applied");
    store
        .record_heartbeat("oracle-app", "startup")
        .context("failed to write startup heartbeat")?;
    drop(store);

    if config.system.maintenance {
        warn!("maintenance mode is enabled; most endpoints will return 503");
    }

    let state = Arc::new(AppContext::build(config).context("failed to build app context")?);
    let background = tasks::spawn_all(&state);
    info!(services = background.len(), "background services started");

    let server_state = Arc::clone(&state);
    tokio::select! {
        result = web::serve(server_state) => {
            result.context("gateway exited")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    for handle in background {
        handle.abort();
    }
    let store = SqliteStore::open(&state.sqlite_path)?;
    store
        .record_heartbeat("oracle-app", "shutdown")
        .context("failed to write shutdown heartbeat")?;
    Ok(())
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(inline) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(inline));
        }
    }
    None
}

fn resolve_migrations_dir(config_path: &Path, configured_migrations_dir: &str) -> PathBuf {
    let configured = PathBuf::from(configured_migrations_dir);
    if configured.is_absolute() || configured.exists() {
        return configured;
    }

    if let Some(config_parent) = config_path.parent() {
        let sibling = config_parent.join(&configured);
        if sibling.exists() {
            return sibling;
        }
        if let Some(project_root) = config_parent.parent() {
            let root_candidate = project_root.join(&configured);
            if root_candidate.exists() {
                return root_candidate;
            }
        }
    }
    configured
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install terminate handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
