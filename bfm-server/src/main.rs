//! Service entry point: clap-based command routing (`serve`, `worker`),
//! logger initialization, component wiring, and graceful shutdown.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;

use bfm_core::backend::default_driver_map;
use bfm_core::config::{BfmConfig, QueueKind, ServerConfig};
use bfm_core::error::{BfmError, Result};
use bfm_core::executor::Executor;
use bfm_core::registry::ScriptRegistry;
use bfm_core::tracker::StateTracker;
use bfm_core::{loader, queue};

use bfm_server::routes;
use bfm_server::state::AppState;

/// Top-level CLI definition.
#[derive(Parser)]
#[command(
    name = "bfm",
    about = "Backend-agnostic schema migration service",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Run the queue worker loop only
    Worker,
}

fn init_logger(config: &ServerConfig) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log_level),
    );
    if config.log_format == "json" {
        builder.format(|buf, record| {
            use std::io::Write;
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    builder.init();
}

fn exit_code(e: &BfmError) -> i32 {
    match e {
        BfmError::ConfigError(_) => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match BfmConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };
    init_logger(&config.server);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker => worker(config).await,
    };

    if let Err(e) = result {
        log::error!("{}", e);
        process::exit(exit_code(&e));
    }
}

/// Load the corpus, open the tracker, and assemble an inline executor.
async fn build_engine(
    config: &BfmConfig,
) -> Result<(Arc<ScriptRegistry>, Arc<StateTracker>, Arc<Executor>)> {
    let registry = Arc::new(ScriptRegistry::new());
    let scripts = loader::load_into(&config.scripts.root, &registry)?;

    let tracker = Arc::new(StateTracker::connect(&config.state)?);
    tracker.initialize().await?;
    for script in &scripts {
        tracker
            .register_scanned_migration(
                &script.migration_id(),
                &script.schema,
                &script.version,
                &script.name,
                &script.connection,
                script.backend,
            )
            .await?;
    }

    let executor = Arc::new(Executor::new(
        registry.clone(),
        tracker.clone(),
        default_driver_map(),
        config.connections.clone(),
    ));
    Ok((registry, tracker, executor))
}

async fn serve(config: BfmConfig) -> Result<()> {
    let (registry, tracker, inline_executor) = build_engine(&config).await?;

    // With a queue configured, the API publishes envelopes and an in-process
    // worker drives the inline executor.
    let api_executor = match queue::build_transport(&config.queue)? {
        Some((producer, consumer)) => {
            tokio::spawn(queue::run_worker(inline_executor.clone(), consumer));
            Arc::new(
                Executor::new(
                    registry.clone(),
                    tracker.clone(),
                    default_driver_map(),
                    config.connections.clone(),
                )
                .with_queue(producer),
            )
        }
        None => inline_executor.clone(),
    };

    // Keep the watcher handle alive for the server's lifetime.
    let _watcher = if config.scripts.watch {
        Some(loader::watch(
            config.scripts.root.clone(),
            registry.clone(),
            tracker.clone(),
        )?)
    } else {
        None
    };

    if config.scripts.reindex_interval_secs > 0 {
        let executor = inline_executor.clone();
        let root = config.scripts.root.clone();
        let secs = config.scripts.reindex_interval_secs;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(secs));
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = executor.reindex(&root).await {
                    log::error!("Periodic reindex failed: {}", e);
                }
            }
        });
    }

    if config.server.api_token.is_empty() {
        log::warn!("BFM_API_TOKEN is not set; every /api/v1 request will be rejected");
    }

    let app_state = AppState::new(
        api_executor,
        config.scripts.root.clone(),
        config.server.api_token.clone(),
    );
    let app = routes::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    log::info!("BFM listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Shutdown complete");
    Ok(())
}

async fn worker(config: BfmConfig) -> Result<()> {
    let (_registry, _tracker, executor) = build_engine(&config).await?;

    let Some((_producer, consumer)) = queue::build_transport(&config.queue)? else {
        return Err(BfmError::ConfigError(
            "Worker mode requires a queue; set BFM_QUEUE".to_string(),
        ));
    };
    if config.queue.kind == QueueKind::InProcess {
        log::warn!(
            "In-process queue in worker mode only receives envelopes published \
             from this process"
        );
    }

    queue::run_worker(executor, consumer).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutdown signal received; draining in-flight requests");
}
