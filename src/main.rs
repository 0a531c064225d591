mod bundle;
mod cli;
mod codec;
mod health;
mod merger;
mod metrics;
mod store;
#[cfg(test)]
mod test_utils;

use bundle::Bundler;
use cli::{MergerConfig, DEFAULT_DELETION_QUEUE_CAPACITY};
use eyre::{Result, WrapErr};
use merger::deleter::Deleter;
use merger::io::{MergerIo, StoreIo};
use merger::Merger;
use std::sync::Arc;
use store::{FsStore, ObjectStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = MergerConfig::from_args();
    init_tracing(config.verbosity);
    config.validate()?;

    info!(
        one_block_files = %config.storage_one_block_files_path.display(),
        merged_blocks = %config.storage_merged_blocks_files_path.display(),
        grpc_listen_addr = %config.grpc_listen_addr,
        bundle_size = config.bundle_size,
        "starting block merger"
    );

    let source: Arc<dyn ObjectStore> = Arc::new(
        FsStore::open(&config.storage_one_block_files_path)
            .wrap_err("failed to open one-block files store")?,
    );
    let destination: Arc<dyn ObjectStore> = Arc::new(
        FsStore::open(&config.storage_merged_blocks_files_path)
            .wrap_err("failed to open merged blocks store")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let io: Arc<dyn MergerIo> = Arc::new(StoreIo::new(
        Arc::clone(&source),
        Arc::clone(&destination),
        config.bundle_size,
        config.first_streamable_block,
        shutdown_rx.clone(),
    ));

    let start_block = io
        .find_start_block()
        .await
        .wrap_err("failed to resolve start block")?;
    info!(start_block, "resolved first unmerged bundle");

    let deleter = Deleter::start(
        Arc::clone(&source),
        config.one_block_deletion_threads,
        DEFAULT_DELETION_QUEUE_CAPACITY,
        shutdown_rx.clone(),
    );

    let readiness = health::start(config.grpc_listen_addr, shutdown_rx.clone())
        .await
        .wrap_err("failed to start grpc health server")?;
    info!(grpc_listen_addr = %config.grpc_listen_addr, "grpc health server started");

    let bundler = Bundler::new(
        start_block,
        config.stop_block,
        config.bundle_size,
        config.first_streamable_block,
        config.writers_leeway(),
        Arc::clone(&io),
        deleter.handle(),
        shutdown_rx.clone(),
    );
    let mut merger = Merger::new(
        bundler,
        io,
        config.time_between_store_lookups(),
        config.max_one_block_operations_batch_size,
        shutdown_rx,
        Some(readiness),
    );

    let mut merger_task = tokio::spawn(async move { merger.launch().await });
    let result = tokio::select! {
        joined = &mut merger_task => joined.wrap_err("merger task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            merger_task.await.wrap_err("merger task panicked")?
        }
    };

    let _ = shutdown_tx.send(true);
    deleter.join().await;
    result?;
    warn!("shutdown complete");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let (global, local) = match verbosity {
                0 => ("warn", "info"),
                1 => ("warn", "debug"),
                _ => ("info", "trace"),
            };
            EnvFilter::new(format!("{global},block_merger={local}"))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
