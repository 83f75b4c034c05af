//! Nixie server binary.
//!
//! Bootstrap order: logging, config, WAL open, pool, store, lifecycle,
//! scheduler, WAL replay into the store, TTL sweep timer, then the HTTP
//! listener. Ctrl-c triggers a graceful teardown in the reverse order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use nixie_core::{DurabilityMode, NixieConfig};
use nixie_runtime::{ActorLifecycle, Scheduler};
use nixie_server::api;
use nixie_server::StateService;
use nixie_store::{StateStore, Wal};
use nixie_sync::WorkerPool;

/// Nixie state store server
#[derive(Parser, Debug)]
#[command(name = "nixie-server")]
#[command(about = "Actor-oriented in-memory state store with WAL durability")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(default_value = "0.0.0.0:50051")]
    listen: String,

    /// WAL file path
    #[arg(long, default_value = "nixie.wal")]
    wal: String,

    /// Durability mode
    #[arg(long, value_enum, default_value = "write-ahead")]
    durability: DurabilityArg,

    /// Write-behind flush batch size
    #[arg(long, default_value_t = 100)]
    write_behind_batch: usize,

    /// Worker pool size (0 = available parallelism)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// TTL sweep interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    ttl_sweep_interval_ms: u64,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DurabilityArg {
    WriteAhead,
    WriteBehind,
}

impl From<DurabilityArg> for DurabilityMode {
    fn from(arg: DurabilityArg) -> Self {
        match arg {
            DurabilityArg::WriteAhead => DurabilityMode::WriteAhead,
            DurabilityArg::WriteBehind => DurabilityMode::WriteBehind,
        }
    }
}

impl Cli {
    fn to_config(&self) -> NixieConfig {
        let mut config = NixieConfig::default();
        config.node.listen_address = self.listen.clone();
        config.store.durability = self.durability.into();
        config.store.wal_path = self.wal.clone();
        config.store.write_behind_batch_size = self.write_behind_batch;
        config.store.ttl_sweep_interval_ms = self.ttl_sweep_interval_ms;
        config.runtime.worker_threads = self.workers;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    tracing::info!("nixie-server v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let addr: SocketAddr = config
        .node
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {e}", config.node.listen_address))?;

    // Composition root: every shared component is built here and handed
    // down; there is no process-wide state.
    let wal = Arc::new(
        Wal::open_with_max_size(&config.store.wal_path, config.store.wal_max_size_bytes)
            .map_err(|e| anyhow::anyhow!("opening wal: {e}"))?,
    );

    // The dispatch loop occupies one pool worker; keep at least one more.
    let workers = match config.runtime.worker_threads {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4),
        n => n,
    }
    .max(2);
    let pool = Arc::new(WorkerPool::new(workers));

    let store = Arc::new(
        StateStore::builder()
            .wal(Arc::clone(&wal))
            .durability(config.store.durability)
            .write_behind_batch_size(config.store.write_behind_batch_size)
            .notify_pool(Arc::clone(&pool))
            .build()
            .map_err(|e| anyhow::anyhow!("building store: {e}"))?,
    );
    let lifecycle = Arc::new(ActorLifecycle::new(Arc::clone(&store)));
    let scheduler = Scheduler::new(Arc::clone(&pool));

    // Recover state written before the last shutdown.
    let stats = {
        let store = Arc::clone(&store);
        wal.replay(move |record| store.restore(&record.actor_id, &record.key, &record.value))
            .map_err(|e| anyhow::anyhow!("replaying wal: {e}"))?
    };
    tracing::info!(
        replayed = stats.replayed,
        skipped = stats.skipped,
        durability = ?config.store.durability,
        "wal replay complete"
    );

    // Periodic TTL sweep.
    {
        let store = Arc::clone(&store);
        scheduler.schedule_every(
            Duration::from_millis(config.store.ttl_sweep_interval_ms),
            move || {
                store.cleanup_expired();
            },
        );
    }

    let service = Arc::new(StateService::new(Arc::clone(&store), lifecycle));
    let app = api::router(service);

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    scheduler
        .shutdown()
        .map_err(|e| anyhow::anyhow!("scheduler shutdown: {e}"))?;
    store.shutdown();
    tracing::info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("ctrl-c received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
    }
}
