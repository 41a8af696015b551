use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{StorageBackend, TollgateConfig};
use tollgate::mesh::Cluster;
use tollgate::ratelimit::{Descriptor, Processor, RuleFile, RuleReloader};
use tollgate::store::{CounterStore, MemoryStore, MeshStore};

/// Check JSON descriptors read from stdin against a rule file.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule file, overriding `rules.path` from the configuration
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(rules) = args.rules {
        config.rules.path = Some(rules);
    }
    info!(backend = ?config.storage.backend, "Configuration loaded");

    let sweep_interval = Duration::from_secs(config.storage.sweep_interval_secs);
    let mut cluster = None;
    let (store, sweeper) = match config.storage.backend {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let sweeper = store.clone().spawn_sweeper(sweep_interval);
            (store as Arc<dyn CounterStore>, sweeper)
        }
        StorageBackend::Mesh => {
            let started = Arc::new(
                Cluster::start(config.cluster_config())
                    .await
                    .context("failed to join the mesh")?,
            );
            cluster = Some(started.clone());
            let store = Arc::new(
                MeshStore::new(started)
                    .with_operation_timeout(Duration::from_millis(config.storage.operation_timeout_ms)),
            );
            let sweeper = store.clone().spawn_sweeper(sweep_interval);
            (store as Arc<dyn CounterStore>, sweeper)
        }
    };

    let initial_rules = match &config.rules.path {
        Some(path) => RuleFile::from_file(path)?.into_rules()?,
        None => {
            warn!("No rule file configured, every operation will be admitted");
            Vec::new()
        }
    };

    let processor = Arc::new(
        Processor::builder(store)
            .options(config.processor_options())
            .rules(initial_rules)
            .build()?,
    );

    let reloader = config.rules.path.as_ref().map(|path| {
        RuleReloader::new(
            path,
            Duration::from_secs(config.rules.reload_interval_secs),
            processor.clone(),
        )
        .spawn()
    });

    tokio::select! {
        result = serve(processor) => result?,
        _ = shutdown_signal() => {}
    }

    for task in reloader.into_iter().chain(Some(sweeper)) {
        task.abort();
        let _ = task.await;
    }
    if let Some(cluster) = cluster.and_then(Arc::into_inner) {
        cluster.shutdown().await?;
    }

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Answer one JSON descriptor per stdin line with one JSON check result
/// per stdout line, until stdin closes.
async fn serve(processor: Arc<Processor<Descriptor>>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Descriptor>(&line) {
            Ok(descriptor) => match processor.check(&descriptor).await {
                Ok(result) => {
                    if let Some(tightest) = result.tightest() {
                        debug!(
                            descriptor = %descriptor,
                            rule_id = %tightest.rule_id,
                            remaining = tightest.remaining,
                            is_limited = result.is_limited,
                            "Checked descriptor"
                        );
                    }
                    serde_json::to_string(&result)?
                }
                Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
            },
            Err(e) => {
                warn!(error = %e, "Ignoring malformed descriptor");
                serde_json::json!({ "error": format!("invalid descriptor: {}", e) }).to_string()
            }
        };

        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
