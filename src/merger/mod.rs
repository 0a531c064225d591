//! Merger driver loop.

pub mod deleter;
pub mod io;
pub mod reader;

use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bundle::Bundler;
use crate::health::Readiness;
use crate::merger::io::MergerIo;

/// Polls the source store and drives the bundler until shutdown, a stop
/// block, or a fatal merge error.
pub struct Merger {
    bundler: Bundler,
    io: Arc<dyn MergerIo>,
    time_between_store_lookups: Duration,
    max_one_block_operations_batch_size: usize,
    shutdown_rx: watch::Receiver<bool>,
    readiness: Option<Readiness>,
}

impl Merger {
    pub fn new(
        bundler: Bundler,
        io: Arc<dyn MergerIo>,
        time_between_store_lookups: Duration,
        max_one_block_operations_batch_size: usize,
        shutdown_rx: watch::Receiver<bool>,
        readiness: Option<Readiness>,
    ) -> Self {
        Self {
            bundler,
            io,
            time_between_store_lookups,
            max_one_block_operations_batch_size,
            shutdown_rx,
            readiness,
        }
    }

    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    pub async fn launch(&mut self) -> Result<()> {
        self.bundler
            .bootstrap()
            .await
            .wrap_err("bundle bootstrap")?;
        if let Some(readiness) = self.readiness.as_mut() {
            readiness.set_serving().await;
        }
        info!(
            base = self.bundler.bundle_inclusive_lower_block(),
            "merger polling for one-block files"
        );

        loop {
            if self.shutting_down() {
                info!("merger shutting down");
                return Ok(());
            }

            // Another merger instance may already have written our window.
            loop {
                let base = self.bundler.bundle_inclusive_lower_block();
                let Some(files) = self.io.fetch_merged_one_block_files(base).await? else {
                    break;
                };
                info!(base, "bundle already merged in destination store, absorbing");
                self.bundler.absorb_merged(files);
                if self.bundler.passed_stop_block() {
                    info!(base, "stop block reached");
                    return Ok(());
                }
                if self.shutting_down() {
                    info!("merger shutting down");
                    return Ok(());
                }
            }

            let files = self
                .io
                .walk_one_block_files(self.max_one_block_operations_batch_size)
                .await
                .wrap_err("walking one-block files")?;
            let walked = files.len();
            for file in files {
                if self.shutting_down() {
                    info!("merger shutting down");
                    return Ok(());
                }
                self.bundler.handle_block_file(file).await;
            }

            if let Some(err) = self.bundler.take_bundle_error() {
                return Err(err.wrap_err("bundle merge failed"));
            }
            if self.bundler.passed_stop_block() {
                info!(
                    base = self.bundler.bundle_inclusive_lower_block(),
                    "stop block reached"
                );
                return Ok(());
            }

            debug!(
                walked,
                base = self.bundler.bundle_inclusive_lower_block(),
                limit = self.bundler.exclusive_highest_block_limit(),
                "poll cycle complete"
            );
            self.sleep_between_lookups().await;
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn sleep_between_lookups(&mut self) {
        let sleep = tokio::time::sleep(self.time_between_store_lookups);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        sleep.as_mut().await;
                        return;
                    }
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
