mod api;
mod audit;
mod authz;
mod backend;
mod catalog;
mod cli;
mod config;
mod error;
mod model;
mod pool;
mod router;
mod secrets;
mod session;
mod shared;
mod store;
mod vault;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::audit::AuditWriter;
use crate::authz::AuthorizationEngine;
use crate::catalog::{CatalogReloader, CatalogResolver};
use crate::pool::{PerUserPool, PoolLimits};
use crate::router::ToolRouter;
use crate::secrets::{EnvFallbackProvider, SecretResolver};
use crate::session::{ServerSecret, SessionManager};
use crate::shared::SharedManager;
use crate::store::memory::MemoryStore;
use crate::vault::CredentialVault;

fn load_config(cli: &cli::Cli) -> Result<config::Config> {
    config::load_dotenv();
    let mut config = config::Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn init_tracing(config: &config::Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Wires every component (§4, §6) into a running process: load config and
/// catalog, resolve embedded secrets, construct the storage/session/authz/
/// audit/pool/shared/router stack, serve the HTTP surface, and run the
/// background maintenance tasks until a shutdown signal arrives.
async fn run(cli: cli::Cli) -> Result<()> {
    let mut config = load_config(&cli)?;
    init_tracing(&config);

    if !config.data_dir.exists() {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    }

    let mut secret_resolver = SecretResolver::new(false);
    secret_resolver.register(Box::new(EnvFallbackProvider));
    let secret_resolver = Arc::new(secret_resolver);
    config.resolve_secrets(&secret_resolver)?;

    let mut catalog_entries = config::load_catalog(&config.catalog_path)
        .with_context(|| format!("loading catalog from {}", config.catalog_path.display()))?;
    for entry in &mut catalog_entries {
        secret_resolver
            .resolve_json(&mut entry.config)
            .with_context(|| format!("resolving secrets for backend '{}'", entry.mcp_id))?;
    }

    tracing::info!(
        config_path = %cli.config.display(),
        catalog_path = %config.catalog_path.display(),
        backends = catalog_entries.len(),
        "mcp-ambassador starting"
    );

    let store = Arc::new(MemoryStore::new());
    for entry in catalog_entries {
        store.upsert(entry).await?;
    }

    let server_secret = ServerSecret::load_or_create(&config.data_dir)?;
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        store.clone(),
        server_secret,
    ));

    let authz = Arc::new(AuthorizationEngine::new(store.clone()));
    let resolver = Arc::new(CatalogResolver::new(store.clone(), store.clone(), authz.clone()));
    let shared = Arc::new(SharedManager::new());

    let master_key = CredentialVault::load_or_create_master_key(&config.data_dir)?;
    let vault = Arc::new(CredentialVault::new(master_key));

    let pool_limits = PoolLimits {
        global_capacity: config.pool.global_capacity,
        per_user_capacity: config.pool.per_user_capacity,
        idle_timeout: config.pool.idle_timeout,
    };
    let pool = Arc::new(PerUserPool::new(pool_limits, store.clone(), vault.clone()));

    let reloader = Arc::new(CatalogReloader::new(store.clone(), shared.clone(), pool.clone()));

    let audit_dir = config.data_dir.join("audit");
    let audit = Arc::new(AuditWriter::new(audit_dir, config.audit.retention_days)?);
    match audit.prune_retention() {
        Ok(pruned) if pruned > 0 => tracing::info!(pruned, "pruned expired audit files"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "audit retention pruning failed"),
    }

    let tool_router = Arc::new(ToolRouter::new(
        resolver.clone(),
        authz.clone(),
        shared.clone(),
        pool.clone(),
        store.clone(),
        audit.clone(),
    ));

    let ip_salt = Arc::new(api::IpSalt::load_or_create(&config.data_dir)?);

    let admin_token: Option<Arc<str>> = config.admin.token.clone().map(Arc::from);
    if admin_token.is_none() {
        tracing::warn!("no admin token configured, /v1/admin/* and /v1/audit/events are unreachable");
    }

    let api_state = api::ApiState {
        sessions: sessions.clone(),
        clients: store.clone(),
        catalog: store.clone(),
        router: tool_router,
        audit: audit.clone() as Arc<dyn audit::AuditSink>,
        reloader: reloader.clone(),
        shared: shared.clone(),
        ip_salt,
        admin_token,
    };

    let shutdown = Arc::new(tokio::sync::Notify::new());

    let http_task = {
        let state = api_state.clone();
        let listen = config.listen.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &listen, shutdown).await {
                tracing::error!(error = %e, "http surface failed");
            }
        })
    };

    let flush_task = {
        let audit = audit.clone();
        let shutdown = shutdown.clone();
        let interval = config.audit.flush_interval;
        tokio::spawn(async move {
            audit.run_periodic_flush(interval, &shutdown).await;
        })
    };

    let reap_task = {
        let pool = pool.clone();
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_idle().await;
                        sessions.reap_rate_limits();
                    }
                    _ = shutdown.notified() => return,
                }
            }
        })
    };

    let watch_task = {
        let catalog_path = config.catalog_path.clone();
        let reloader = reloader.clone();
        let secret_resolver = secret_resolver.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            config::watch_catalog(catalog_path, reloader, secret_resolver, shutdown).await;
        })
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    shutdown.notify_waiters();
    audit.mark_shutting_down();

    let _ = http_task.await;
    let _ = watch_task.await;
    let _ = reap_task.await;
    let _ = flush_task.await;

    let _ = audit.flush().await;
    pool.stop_all().await;
    shared.stop_all().await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// `ambassadord audit prune`: removes audit log files outside the
/// configured retention window without booting the HTTP surface.
fn audit_prune(cli: &cli::Cli) -> Result<()> {
    let config = load_config(cli)?;
    init_tracing(&config);
    let audit_dir = config.data_dir.join("audit");
    let writer = AuditWriter::new(audit_dir, config.audit.retention_days)?;
    let pruned = writer.prune_retention()?;
    println!("pruned {pruned} expired audit file(s)");
    Ok(())
}

/// `ambassadord session rotate-secret`: replaces the session-token HMAC
/// secret on disk, invalidating every outstanding session token.
fn session_rotate_secret(cli: &cli::Cli) -> Result<()> {
    let config = load_config(cli)?;
    init_tracing(&config);
    let secret = ServerSecret::load_or_create(&config.data_dir)?;
    secret.rotate()?;
    println!("rotated session HMAC secret; all existing session tokens are now invalid");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = cli::Cli::parse();

    let result = match &cli.command {
        None | Some(cli::Command::Serve) => run(cli).await,
        Some(cli::Command::Audit {
            action: cli::AuditCommand::Prune,
        }) => audit_prune(&cli),
        Some(cli::Command::Session {
            action: cli::SessionCommand::RotateSecret,
        }) => session_rotate_secret(&cli),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            std::process::ExitCode::FAILURE
        }
    }
}
