//! CLI and config handling.

use clap::{ArgAction, Parser};
use eyre::{bail, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUNDLE_SIZE: u64 = 100;
pub const DEFAULT_TIME_BETWEEN_STORE_LOOKUPS_MS: u64 = 1_000;
pub const DEFAULT_WRITERS_LEEWAY_DURATION_MS: u64 = 60_000;
pub const DEFAULT_ONE_BLOCK_DELETION_THREADS: usize = 10;
pub const DEFAULT_MAX_ONE_BLOCK_OPERATIONS_BATCH_SIZE: usize = 2_000;
pub const MIN_MAX_ONE_BLOCK_OPERATIONS_BATCH_SIZE: usize = 250;
pub const DEFAULT_DELETION_QUEUE_CAPACITY: usize = 100_000;

/// Block merger configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "block-merger", about = "Merges one-block files into bundles")]
pub struct MergerConfig {
    /// Source store holding one-block files.
    #[arg(long)]
    pub storage_one_block_files_path: PathBuf,
    /// Destination store for merged bundles.
    #[arg(long)]
    pub storage_merged_blocks_files_path: PathBuf,
    /// gRPC health check listen address.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub grpc_listen_addr: SocketAddr,
    /// Grace period before a stale one-block file is deleted, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_WRITERS_LEEWAY_DURATION_MS)]
    pub writers_leeway_duration_ms: u64,
    /// Pause between source store polls, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIME_BETWEEN_STORE_LOOKUPS_MS)]
    pub time_between_store_lookups_ms: u64,
    /// Worker tasks deleting merged one-block files.
    #[arg(long, default_value_t = DEFAULT_ONE_BLOCK_DELETION_THREADS)]
    pub one_block_deletion_threads: usize,
    /// Max one-block files visited per store poll.
    #[arg(long, default_value_t = DEFAULT_MAX_ONE_BLOCK_OPERATIONS_BATCH_SIZE)]
    pub max_one_block_operations_batch_size: usize,
    /// Blocks per merged bundle.
    #[arg(long, default_value_t = DEFAULT_BUNDLE_SIZE)]
    pub bundle_size: u64,
    /// First block number the protocol can produce.
    #[arg(long, default_value_t = 0)]
    pub first_streamable_block: u64,
    /// Stop merging once the bundle base reaches this block.
    #[arg(long)]
    pub stop_block: Option<u64>,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbosity: u8,
}

impl MergerConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.one_block_deletion_threads < 1 {
            bail!("need at least 1 one-block deletion thread");
        }
        if self.max_one_block_operations_batch_size < MIN_MAX_ONE_BLOCK_OPERATIONS_BATCH_SIZE {
            bail!(
                "minimum max-one-block-operations-batch-size is {MIN_MAX_ONE_BLOCK_OPERATIONS_BATCH_SIZE}"
            );
        }
        if self.bundle_size == 0 {
            bail!("bundle size must be at least 1");
        }
        Ok(())
    }

    pub fn writers_leeway(&self) -> Duration {
        Duration::from_millis(self.writers_leeway_duration_ms)
    }

    pub fn time_between_store_lookups(&self) -> Duration {
        Duration::from_millis(self.time_between_store_lookups_ms)
    }
}
