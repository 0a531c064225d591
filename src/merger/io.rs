//! Store-backed merger I/O.

use async_trait::async_trait;
use eyre::{bail, Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bundle::OneBlockFile;
use crate::codec;
use crate::merger::reader::{BundleReader, ReadStatus};
use crate::metrics;
use crate::store::ObjectStore;

const LIST_PAGE_SIZE: usize = 1_000;
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Everything the bundler needs from the outside world. Production uses
/// [`StoreIo`]; tests script the trait directly.
#[async_trait]
pub trait MergerIo: Send + Sync {
    /// Next batch of source files, ascending by block number then filename.
    /// Unparseable names are logged and skipped, never fatal.
    async fn walk_one_block_files(&self, limit: usize) -> Result<Vec<Arc<OneBlockFile>>>;

    async fn download_one_block_file(&self, file: &OneBlockFile) -> Result<Vec<u8>>;

    /// Reconstruct the ordered descriptors of the merged bundle at
    /// `low_block_num`; `Ok(None)` when no artifact exists there yet.
    async fn fetch_merged_one_block_files(
        &self,
        low_block_num: u64,
    ) -> Result<Option<Vec<Arc<OneBlockFile>>>>;

    /// Write the merged bundle for the window starting at `low_block_num`.
    /// On failure no artifact may be visible under that key.
    async fn merge_and_store(&self, low_block_num: u64, files: &[Arc<OneBlockFile>])
        -> Result<()>;

    /// First window base with no merged artifact in the destination store.
    async fn find_start_block(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct StoreIo {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    bundle_size: u64,
    first_streamable_block: u64,
    retry_attempts: u32,
    retry_delay: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl StoreIo {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        bundle_size: u64,
        first_streamable_block: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            destination,
            bundle_size,
            first_streamable_block,
            retry_attempts: 5,
            retry_delay: Duration::from_millis(500),
            shutdown_rx,
        }
    }

    #[cfg(test)]
    fn with_retry_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    fn merged_object_name(low_block_num: u64) -> String {
        format!("{low_block_num:010}")
    }
}

#[async_trait]
impl MergerIo for StoreIo {
    async fn walk_one_block_files(&self, limit: usize) -> Result<Vec<Arc<OneBlockFile>>> {
        let names = self
            .source
            .list_from(None, limit)
            .await
            .wrap_err("failed to list one-block files")?;
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            match OneBlockFile::parse_name(&name) {
                Ok(file) => files.push(Arc::new(file)),
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unparseable one-block file");
                }
            }
        }
        files.sort_by(|a, b| {
            (a.block_num, &a.canonical_name).cmp(&(b.block_num, &b.canonical_name))
        });
        Ok(files)
    }

    async fn download_one_block_file(&self, file: &OneBlockFile) -> Result<Vec<u8>> {
        for name in file.filenames() {
            let mut attempt = 0u32;
            let found = loop {
                match self.source.read(&name).await {
                    Ok(found) => break found,
                    Err(err) if attempt + 1 < self.retry_attempts && !*self.shutdown_rx.borrow() => {
                        attempt += 1;
                        warn!(file = %name, attempt, error = %err, "one-block download failed, retrying");
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    Err(err) => return Err(err),
                }
            };
            if let Some(data) = found {
                return Ok(data);
            }
        }
        bail!(
            "one-block file {} not found in source store",
            file.canonical_name
        );
    }

    async fn fetch_merged_one_block_files(
        &self,
        low_block_num: u64,
    ) -> Result<Option<Vec<Arc<OneBlockFile>>>> {
        let name = Self::merged_object_name(low_block_num);
        let Some(data) = self.destination.read(&name).await? else {
            return Ok(None);
        };
        codec::check_header(&data)
            .wrap_err_with(|| format!("merged bundle {name} has a corrupt header"))?;
        let records = codec::decode_records(&data[codec::HEADER_LEN..])
            .wrap_err_with(|| format!("merged bundle {name} is corrupt"))?;
        let files = records
            .iter()
            .map(|record| Arc::new(OneBlockFile::from_record(record)))
            .collect();
        Ok(Some(files))
    }

    async fn merge_and_store(
        &self,
        low_block_num: u64,
        files: &[Arc<OneBlockFile>],
    ) -> Result<()> {
        if files.is_empty() {
            bail!("refusing to merge an empty bundle at {low_block_num}");
        }

        let io: Arc<dyn MergerIo> = Arc::new(self.clone());
        let mut reader = BundleReader::new(io, files.to_vec(), self.shutdown_rx.clone());
        let mut merged = Vec::new();
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await? {
                ReadStatus::Read(n) => merged.extend_from_slice(&chunk[..n]),
                ReadStatus::Eof => break,
                ReadStatus::Cancelled => {
                    bail!("bundle assembly at {low_block_num} interrupted by shutdown")
                }
            }
        }

        let name = Self::merged_object_name(low_block_num);
        let mut attempt = 0u32;
        loop {
            match self.destination.write(&name, &merged).await {
                Ok(()) => break,
                Err(err) if attempt + 1 < self.retry_attempts && !*self.shutdown_rx.borrow() => {
                    attempt += 1;
                    warn!(bundle = %name, attempt, error = %err, "merged bundle upload failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(
            bundle = %name,
            blocks = files.len(),
            bytes = merged.len(),
            "stored merged bundle"
        );
        Ok(())
    }

    async fn find_start_block(&self) -> Result<u64> {
        let mut expected = metrics::window_base(self.first_streamable_block, self.bundle_size);
        let mut cursor: Option<String> = None;
        loop {
            let names = self
                .destination
                .list_from(cursor.as_deref(), LIST_PAGE_SIZE)
                .await
                .wrap_err("failed to list merged bundles")?;
            if names.is_empty() {
                return Ok(expected);
            }
            for name in &names {
                let Ok(base) = name.parse::<u64>() else {
                    continue;
                };
                if base == expected {
                    expected += self.bundle_size;
                } else if base > expected {
                    return Ok(expected);
                }
            }
            cursor = names.last().cloned();
        }
    }
}
