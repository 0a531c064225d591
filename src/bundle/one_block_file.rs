//! One-block file descriptors.

use chrono::{Duration, NaiveDateTime};
use eyre::{bail, eyre, Result, WrapErr};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::OnceCell;

use crate::codec::BlockRecord;
use crate::merger::io::MergerIo;

/// Descriptor for a single uploaded block archive.
///
/// Identity is `(block_num, block_id)`; the same block uploaded by several
/// producers yields one descriptor carrying every observed filename, so the
/// deleter can reclaim all copies. The payload is fetched lazily and at most
/// once, shared between concurrent callers.
pub struct OneBlockFile {
    pub block_num: u64,
    pub block_id: String,
    pub previous_id: String,
    pub lib_num: u64,
    pub block_time: NaiveDateTime,
    pub canonical_name: String,
    filenames: Mutex<BTreeSet<String>>,
    merged_in_store: AtomicBool,
    payload: OnceCell<Vec<u8>>,
}

impl OneBlockFile {
    /// Parse the canonical one-block filename grammar:
    /// `<blockNum:10d>-<timestamp>-<blockID>-<previousID>-<libNum>-<suffix>`.
    pub fn parse_name(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() != 6 {
            bail!(
                "invalid one-block filename {name:?}: expected 6 dash-separated fields, got {}",
                parts.len()
            );
        }
        if parts[0].len() != 10 {
            bail!("invalid one-block filename {name:?}: block number must be 10 digits");
        }
        let block_num: u64 = parts[0]
            .parse()
            .wrap_err_with(|| format!("invalid block number in {name:?}"))?;
        let block_time = parse_block_time(parts[1])
            .wrap_err_with(|| format!("invalid timestamp in {name:?}"))?;
        let block_id = parts[2].to_string();
        let previous_id = parts[3].to_string();
        let lib_num: u64 = parts[4]
            .parse()
            .wrap_err_with(|| format!("invalid lib number in {name:?}"))?;
        if block_id.is_empty() || previous_id.is_empty() {
            bail!("invalid one-block filename {name:?}: empty block or previous id");
        }
        if lib_num > block_num {
            bail!("invalid one-block filename {name:?}: lib {lib_num} above block {block_num}");
        }

        let canonical_name = parts[..5].join("-");
        Ok(Self {
            block_num,
            block_id,
            previous_id,
            lib_num,
            block_time,
            canonical_name,
            filenames: Mutex::new(BTreeSet::from([name.to_string()])),
            merged_in_store: AtomicBool::new(false),
            payload: OnceCell::new(),
        })
    }

    /// Rebuild a descriptor from a record read out of a merged bundle.
    pub fn from_record(record: &BlockRecord) -> Self {
        let canonical_name = format!(
            "{:010}-{}-{}-{}-{}",
            record.block_num,
            format_block_time(record.block_time),
            record.block_id,
            record.previous_id,
            record.lib_num,
        );
        Self {
            block_num: record.block_num,
            block_id: record.block_id.clone(),
            previous_id: record.previous_id.clone(),
            lib_num: record.lib_num,
            block_time: record.block_time,
            canonical_name,
            filenames: Mutex::new(BTreeSet::new()),
            merged_in_store: AtomicBool::new(false),
            payload: OnceCell::new(),
        }
    }

    /// Duplicate-suppression key.
    pub fn fingerprint(&self) -> (u64, String) {
        (self.block_num, self.block_id.clone())
    }

    /// Every filename this block was observed under, ascending.
    pub fn filenames(&self) -> Vec<String> {
        self.filenames
            .lock()
            .expect("filename set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Absorb the filenames of a duplicate upload of the same block.
    pub fn merge(&self, other: &OneBlockFile) {
        let other_names = other.filenames();
        let mut names = self.filenames.lock().expect("filename set lock poisoned");
        names.extend(other_names);
    }

    pub fn mark_merged(&self) {
        self.merged_in_store.store(true, Ordering::Relaxed);
    }

    /// True when this block already lives in a merged bundle and is retained
    /// only as a linkage anchor.
    pub fn is_merged(&self) -> bool {
        self.merged_in_store.load(Ordering::Relaxed)
    }

    /// Memoized payload fetch; concurrent callers share a single download and
    /// the bytes never change once observed.
    pub async fn data(&self, io: &dyn MergerIo) -> Result<Vec<u8>> {
        let data = self
            .payload
            .get_or_try_init(|| io.download_one_block_file(self))
            .await?;
        Ok(data.clone())
    }
}

impl std::fmt::Debug for OneBlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneBlockFile")
            .field("block_num", &self.block_num)
            .field("block_id", &self.block_id)
            .field("previous_id", &self.previous_id)
            .field("lib_num", &self.lib_num)
            .finish()
    }
}

fn parse_block_time(field: &str) -> Result<NaiveDateTime> {
    let (base, fraction) = match field.split_once('.') {
        Some((base, fraction)) => (base, Some(fraction)),
        None => (field, None),
    };
    let time = NaiveDateTime::parse_from_str(base, "%Y%m%dT%H%M%S")?;
    let Some(fraction) = fraction else {
        return Ok(time);
    };
    if fraction.is_empty() || fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid fractional seconds {fraction:?}");
    }
    let nanos: i64 = format!("{fraction:0<9}")
        .parse()
        .map_err(|_| eyre!("invalid fractional seconds {fraction:?}"))?;
    Ok(time + Duration::nanoseconds(nanos))
}

fn format_block_time(time: NaiveDateTime) -> String {
    use chrono::Timelike;
    format!(
        "{}.{}",
        time.format("%Y%m%dT%H%M%S"),
        time.nanosecond() / 100_000_000
    )
}
