//! CCGate -- multi-tenant reverse proxy for Anthropic-compatible upstreams.
//!
//! This is the application entry point. It wires together all modules:
//!   - Configuration loading (four JSON files + PORT override)
//!   - Tracing/logging
//!   - Usage store + background record writer
//!   - Load balancer + health probing
//!   - Combined HTTP server (proxy, OpenAI front-end, admin API)
//!   - SIGHUP config reload, graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Mutex, RwLock};
use tracing_subscriber::EnvFilter;

use ccgate::api::build_router;
use ccgate::balancer::LoadBalancer;
use ccgate::config::{Config, ConfigStore};
use ccgate::usage::store::UsageStore;
use ccgate::usage::writer::spawn_usage_writer;
use ccgate::AppState;

/// Root of the per-tenant daily usage files.
const USAGE_ROOT: &str = "data/usage";

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_dir: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_dir = PathBuf::from("config");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-dir" | "-c" => {
                if let Some(path) = args.next() {
                    config_dir = PathBuf::from(path);
                } else {
                    eprintln!("Error: --config-dir requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("ccgate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_dir }
}

fn print_usage() {
    println!(
        "\
ccgate {version} -- multi-tenant LLM reverse proxy

USAGE:
    ccgate [OPTIONS]

OPTIONS:
    -c, --config-dir <PATH>    Directory holding server.json, upstreams.json,
                               tenants.json and pricing.json [default: config]
    -h, --help                 Print this help message
    -V, --version              Print version information

ENVIRONMENT:
    RUST_LOG                   Override log level (e.g. RUST_LOG=debug)
    PORT                       Override server.port
    CCGATE_CONFIG_DIR          Alternative to --config-dir
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments (env var wins as an alternative).
    let cli = parse_args();
    let config_dir = std::env::var("CCGATE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or(cli.config_dir);

    // 2. Load configuration; validation failures are fatal (exit code 1).
    let config = Config::load(&config_dir)?;

    // 3. Initialize tracing.
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %config_dir.display(),
        upstreams = config.upstreams.len(),
        tenants = config.tenants.len(),
        "Starting ccgate"
    );

    // 4. Usage store + background writer.
    let store = Arc::new(UsageStore::new(USAGE_ROOT));
    let (usage_tx, usage_rx) = tokio::sync::mpsc::unbounded_channel();
    let writer = spawn_usage_writer(store.clone(), usage_rx);

    // 5. Load balancer.
    let balancer = Arc::new(RwLock::new(LoadBalancer::from_config(&config)));

    // 6. Shared application state.
    let state = AppState {
        config: Arc::new(ConfigStore::new(&config_dir, config.clone())),
        client: ccgate::http_client(),
        balancer,
        store,
        usage_tx,
        health_task: Arc::new(Mutex::new(None)),
        started: Instant::now(),
    };

    // 7. Health probing (first round fires immediately).
    state.restart_health_monitor(&config).await;

    // 8. SIGHUP -> hot reload.
    let reload_task = spawn_sighup_reload(state.clone());

    // 9. Build the router and bind.
    let app = build_router(state.clone(), &config);
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  ccgate v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  Anthropic: http://{listen_addr}/anthropic/");
    println!("  OpenAI:    http://{listen_addr}/openai/v1/chat/completions");
    println!("  Health:    http://{listen_addr}/health");
    if config.admin.enabled {
        println!("  Admin:     http://{listen_addr}{}", config.admin.path);
    }
    println!();

    // 10. Serve with graceful shutdown; connect info feeds client IPs into
    //     usage records.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down gracefully");

    // 11. Stop the background tasks holding state clones, then drop the last
    //     usage sender so the writer drains and exits.
    if let Some(task) = state.health_task.lock().await.take() {
        task.abort();
    }
    if let Some(task) = reload_task {
        task.abort();
    }
    drop(state);
    let _ = writer.await;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    if !config.logging.enable_console {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Reload configuration on SIGHUP (unix only).
fn spawn_sighup_reload(state: AppState) -> Option<tokio::task::JoinHandle<()>> {
    #[cfg(unix)]
    {
        Some(tokio::spawn(async move {
            let mut stream = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };
            while stream.recv().await.is_some() {
                match state.reload().await {
                    Ok(summary) => {
                        tracing::info!(
                            upstreams = summary.upstreams,
                            tenants = summary.tenants,
                            "Reloaded configuration on SIGHUP"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "SIGHUP reload failed; keeping old config");
                    }
                }
            }
        }))
    }

    #[cfg(not(unix))]
    {
        let _ = state;
        None
    }
}
