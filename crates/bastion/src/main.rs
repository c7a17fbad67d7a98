use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bastion::config::AppConfig;
use bastion::policy::{self, ParseContext, PolicyHandle};
use bastion::proxyproto::{ClientConn, ProxyProtoListener};
use bastion::routes;
use bastion::state::AppState;
use bastion::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("starting bastion v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;

    // Challenge methods must be live before the policy validates
    // algorithm names against them.
    bastion::challenge::setup_all();

    // Load and compile the policy; an invalid policy is fatal.
    let parse_ctx = ParseContext {
        providers: Default::default(),
        default_difficulty: config.difficulty,
    };
    let compiled = policy::load(config.policy_fname.as_deref().map(Path::new), &parse_ctx)
        .context("can't load policy")?;

    println!("Rule error IDs:");
    for (name, hash) in compiled.rule_error_ids() {
        println!("* {name}: {hash}");
    }
    println!();

    let policy_handle = PolicyHandle::new(compiled);

    // Initialize application state
    let state = AppState::new(config.clone(), policy_handle.clone()).await?;
    info!(
        target = %config.target,
        difficulty = config.difficulty,
        "configuration loaded"
    );
    // External verifiers (e.g. an SPOE agent) need this to check cookies.
    info!(
        public_key = %state.signer.public_key_b64(),
        "session token verifying key"
    );

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Periodic cleanup of everything that decays.
    let cleanup_state = state.clone();
    let cleanup_shutdown = shutdown_tx.subscribe();
    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs);
    tokio::spawn(async move {
        cleanup_worker(cleanup_state, cleanup_interval, cleanup_shutdown).await;
    });

    // Live policy reload. The watcher handle must stay alive.
    let _policy_watcher = match &config.policy_fname {
        Some(fname) => {
            let fname = fname.clone();
            let handle = policy_handle.clone();
            let ctx = parse_ctx.clone();
            let watch_path = Path::new(&fname).to_path_buf();
            let watcher = bastion::watcher::watch_file(&watch_path, move || {
                match policy::load(Some(Path::new(&fname)), &ctx) {
                    Ok(compiled) => {
                        handle.swap(compiled);
                        info!(file = %fname, "policy reloaded");
                    }
                    Err(e) => {
                        error!(error = %e, "policy reload failed; keeping previous policy");
                    }
                }
            });
            match watcher {
                Ok(w) => Some(w),
                Err(e) => {
                    error!(error = %e, "can't watch policy file");
                    None
                }
            }
        }
        None => None,
    };

    // Allow-list reload rides the same mechanism.
    let _targets_watcher = state
        .allowed_targets
        .as_ref()
        .and_then(|list| match list.watch() {
            Ok(w) => Some(w),
            Err(e) => {
                error!(error = %e, "can't watch allowed targets file");
                None
            }
        });

    // Metrics listener
    if !config.metrics_bind.is_empty() {
        let metrics_bind = config.metrics_bind.clone();
        let metrics_state = state.clone();
        let mut metrics_shutdown = shutdown_tx.subscribe();
        let listener = tokio::net::TcpListener::bind(&metrics_bind)
            .await
            .with_context(|| format!("failed to bind metrics to {metrics_bind}"))?;
        info!(addr = %metrics_bind, "metrics listening");

        tokio::spawn(async move {
            let app = routes::create_metrics_router(metrics_state);
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = metrics_shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    // Build router
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind))?;
    info!(
        addr = %config.bind,
        proxy_protocol = config.proxy_protocol_enable,
        "bastion listening"
    );

    let listener = ProxyProtoListener::new(
        listener,
        config.proxy_protocol_enable,
        Duration::from_secs(config.proxy_header_timeout_secs),
    );

    // Handle graceful shutdown
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<ClientConn>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    info!("bastion shutdown complete");
    Ok(())
}

/// Sweep every decaying structure on a fixed interval.
async fn cleanup_worker(
    state: AppState,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                state.dns.cleanup();
                if let Some(memory) = &state.memory_store {
                    memory.cleanup();
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }
}

/// Wire tracing to the `--log-level` / `--json-logs` flags. A RUST_LOG
/// environment filter still wins when present, so per-module debugging
/// (e.g. `bastion::dns=debug` while chasing FCrDNS behavior) needs no
/// flag change. Decision logs are per-request; `--json-logs` keeps them
/// machine-parseable for the log pipeline.
fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if args.json_logs {
        registry
            .with(fmt::layer().json().flatten_event(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
