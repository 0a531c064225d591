//! Fork-aware bundling state machine.

use chrono::{Duration as ChronoDuration, Utc};
use eyre::{Report, Result, WrapErr};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::bundle::OneBlockFile;
use crate::merger::deleter::DeleterHandle;
use crate::merger::io::MergerIo;

/// Accumulates one-block files and emits one merged bundle per window of
/// `bundle_size` consecutive blocks, once the window's last block is covered
/// by an observed last-irreversible-block number.
///
/// The bundler is single-writer: the merger loop is the only caller of its
/// mutating methods, so the only guarded resource is the merge itself.
pub struct Bundler {
    base_block_num: u64,
    bundle_size: u64,
    stop_block: Option<u64>,
    first_streamable_block: u64,
    writers_leeway: ChronoDuration,
    io: Arc<dyn MergerIo>,
    deleter: DeleterHandle,
    shutdown_rx: watch::Receiver<bool>,
    irreversible_blocks: Vec<Arc<OneBlockFile>>,
    seen_block_files: BTreeSet<(u64, String)>,
    unlinkable: BTreeMap<(u64, String), Arc<OneBlockFile>>,
    max_seen_lib: u64,
    in_process: bool,
    bundle_error: Option<Report>,
}

impl Bundler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_block_num: u64,
        stop_block: Option<u64>,
        bundle_size: u64,
        first_streamable_block: u64,
        writers_leeway: Duration,
        io: Arc<dyn MergerIo>,
        deleter: DeleterHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            base_block_num,
            bundle_size: bundle_size.max(1),
            stop_block,
            first_streamable_block,
            writers_leeway: ChronoDuration::milliseconds(writers_leeway.as_millis() as i64),
            io,
            deleter,
            shutdown_rx,
            irreversible_blocks: Vec::new(),
            seen_block_files: BTreeSet::new(),
            unlinkable: BTreeMap::new(),
            max_seen_lib: 0,
            in_process: false,
            bundle_error: None,
        }
    }

    pub fn bundle_inclusive_lower_block(&self) -> u64 {
        self.base_block_num
    }

    pub fn exclusive_highest_block_limit(&self) -> u64 {
        self.base_block_num + self.bundle_size
    }

    pub fn longest_chain_first_block_num(&self) -> Option<u64> {
        self.irreversible_blocks.first().map(|b| b.block_num)
    }

    pub fn passed_stop_block(&self) -> bool {
        self.stop_block
            .map_or(false, |stop| self.base_block_num >= stop)
    }

    pub fn take_bundle_error(&mut self) -> Option<Report> {
        self.bundle_error.take()
    }

    /// Re-seed tracked state from the merged bundle preceding
    /// `base_block_num`, so the first live file can link onto the existing
    /// chain. Never uploads anything.
    pub async fn bootstrap(&mut self) -> Result<()> {
        if self.base_block_num < self.bundle_size {
            debug!("no previous bundle window to bootstrap from");
            return Ok(());
        }
        let low = self.base_block_num - self.bundle_size;
        let fetched = self
            .io
            .fetch_merged_one_block_files(low)
            .await
            .wrap_err_with(|| format!("fetching merged one-block files at {low}"))?;
        match fetched {
            Some(mut files) => {
                for file in &files {
                    file.mark_merged();
                }
                files.sort_by(|a, b| {
                    (a.block_num, a.block_id.as_str()).cmp(&(b.block_num, b.block_id.as_str()))
                });
                info!(
                    base = low,
                    blocks = files.len(),
                    "bootstrapped from previous merged bundle"
                );
                self.irreversible_blocks = files;
            }
            None => debug!(base = low, "no previous merged bundle found"),
        }
        Ok(())
    }

    /// Fold in a window that another merger instance already wrote: the
    /// bundle base advances and its blocks become linkage anchors, without
    /// uploading or deleting anything.
    pub fn absorb_merged(&mut self, files: Vec<Arc<OneBlockFile>>) {
        let window_end = self.exclusive_highest_block_limit();
        for file in &files {
            file.mark_merged();
        }

        let anchor = self
            .irreversible_blocks
            .iter()
            .rev()
            .find(|b| b.block_num < self.base_block_num)
            .cloned();
        let tail: Vec<Arc<OneBlockFile>> = self
            .irreversible_blocks
            .iter()
            .filter(|b| b.block_num >= window_end)
            .cloned()
            .collect();

        let mut next = Vec::new();
        next.extend(anchor);
        next.extend(files);
        next.extend(tail);
        next.sort_by(|a, b| {
            (a.block_num, a.block_id.as_str()).cmp(&(b.block_num, b.block_id.as_str()))
        });
        self.irreversible_blocks = next;
        self.base_block_num = window_end;
        self.purge_seen();
    }

    /// Discard all un-merged state and restart the window at `new_base`.
    pub fn reset(&mut self, new_base: u64, anchor: Option<Arc<OneBlockFile>>) {
        self.base_block_num = new_base;
        self.irreversible_blocks = anchor.into_iter().collect();
        self.seen_block_files.clear();
        self.unlinkable.clear();
        self.max_seen_lib = 0;
    }

    /// Single admission point for walked one-block files.
    pub async fn handle_block_file(&mut self, file: Arc<OneBlockFile>) {
        // Files beyond the current window are skipped until the window is
        // finalized; the next poll's walk offers them again.
        if file.block_num >= self.exclusive_highest_block_limit() && !self.ready_with(file.lib_num)
        {
            trace!(
                block = file.block_num,
                limit = self.exclusive_highest_block_limit(),
                "holding one-block file beyond the unfinalized window"
            );
            return;
        }
        if self.merge_duplicate(&file) {
            return;
        }
        if file.block_num < self.base_block_num {
            self.handle_too_old(file);
            return;
        }
        if !self.is_linkable(&file) {
            if self.should_reorg(&file) {
                warn!(
                    block = file.block_num,
                    block_id = %file.block_id,
                    "longer competing chain at bundle base, resetting"
                );
                let fork = self.collect_fork_chain(&file);
                self.reset(self.base_block_num, None);
                for block in fork {
                    self.admit_chain(block);
                }
                self.attempt_merge().await;
            } else {
                self.buffer_unlinkable(file);
            }
            return;
        }

        self.admit_chain(file);
        self.attempt_merge().await;
    }

    /// Emit every window that is finalized and fully linked. Non-blocking
    /// with respect to other merges: at most one is ever in flight.
    pub async fn attempt_merge(&mut self) {
        if self.in_process || self.bundle_error.is_some() {
            return;
        }
        self.in_process = true;
        while self.bundle_ready() && !self.passed_stop_block() {
            let Some(bundle) = self.select_bundle() else {
                break;
            };
            let low = self.base_block_num;
            let first_block = bundle[0].block_num;
            let last_block = bundle[bundle.len() - 1].block_num;
            debug!(base = low, first_block, last_block, "bundle complete, merging");
            match self.io.merge_and_store(low, &bundle).await {
                Ok(()) => {
                    let tip_time = bundle[bundle.len() - 1].block_time;
                    info!(
                        base = low,
                        first_block,
                        last_block,
                        blocks = bundle.len(),
                        drift_seconds =
                            crate::metrics::drift_seconds(tip_time, Utc::now().naive_utc()),
                        "merged bundle stored"
                    );
                    self.advance(&bundle);
                }
                Err(err) => {
                    if *self.shutdown_rx.borrow() {
                        debug!(base = low, "merge interrupted by shutdown");
                    } else {
                        self.bundle_error = Some(err);
                    }
                    break;
                }
            }
        }
        self.in_process = false;
    }

    fn bundle_ready(&self) -> bool {
        self.ready_with(0)
    }

    /// The window is ready once some observed lib covers its last block.
    fn ready_with(&self, candidate_lib: u64) -> bool {
        let last_window_block = self.base_block_num + self.bundle_size - 1;
        self.max_seen_lib.max(candidate_lib) >= last_window_block
    }

    fn merge_duplicate(&mut self, file: &OneBlockFile) -> bool {
        if !self.seen_block_files.contains(&file.fingerprint()) {
            return false;
        }
        if let Some(existing) = self
            .irreversible_blocks
            .iter()
            .find(|b| b.block_num == file.block_num && b.block_id == file.block_id)
        {
            existing.merge(file);
        }
        trace!(
            block = file.block_num,
            block_id = %file.block_id,
            "dropping duplicate one-block file"
        );
        true
    }

    fn handle_too_old(&mut self, file: Arc<OneBlockFile>) {
        self.unlinkable.remove(&file.fingerprint());
        if self.past_grace(&file) {
            debug!(
                block = file.block_num,
                block_id = %file.block_id,
                base = self.base_block_num,
                "one-block file below bundle base, deleting"
            );
            self.deleter.delete(&[file]);
        } else {
            trace!(
                block = file.block_num,
                "one-block file below bundle base, still within writer leeway"
            );
        }
    }

    fn is_linkable(&self, file: &OneBlockFile) -> bool {
        if self.irreversible_blocks.is_empty() {
            // nothing to link onto yet: only the chain's first block may
            // found a new chain
            return file.block_num == self.base_block_num.max(self.first_streamable_block);
        }
        self.irreversible_blocks.iter().any(|b| {
            b.block_id == file.previous_id
                || (b.block_num == file.block_num && b.previous_id == file.previous_id)
        })
    }

    fn buffer_unlinkable(&mut self, file: Arc<OneBlockFile>) {
        trace!(
            block = file.block_num,
            block_id = %file.block_id,
            previous_id = %file.previous_id,
            "buffering unlinkable one-block file"
        );
        match self.unlinkable.entry(file.fingerprint()) {
            Entry::Occupied(existing) => existing.get().merge(&file),
            Entry::Vacant(slot) => {
                slot.insert(file);
            }
        }
    }

    /// A mismatched previous id at the bundle base is only honored when the
    /// competing chain buffered so far outgrows the tracked one.
    fn should_reorg(&self, file: &OneBlockFile) -> bool {
        if file.block_num != self.base_block_num {
            return false;
        }
        let has_anchor = self
            .irreversible_blocks
            .iter()
            .any(|b| b.block_num < self.base_block_num);
        if !has_anchor {
            return false;
        }
        let current_len = self
            .irreversible_blocks
            .iter()
            .filter(|b| b.block_num >= self.base_block_num)
            .count();
        self.fork_chain_len(file) > current_len
    }

    fn fork_chain_len(&self, root: &OneBlockFile) -> usize {
        let mut len = 1;
        let mut tip_id = root.block_id.clone();
        let mut tip_num = root.block_num;
        while let Some(next) = self
            .unlinkable
            .values()
            .find(|candidate| candidate.previous_id == tip_id && candidate.block_num > tip_num)
        {
            len += 1;
            tip_id = next.block_id.clone();
            tip_num = next.block_num;
        }
        len
    }

    /// The buffered continuation of `root`, gathered before a reset wipes
    /// the buffer.
    fn collect_fork_chain(&self, root: &Arc<OneBlockFile>) -> Vec<Arc<OneBlockFile>> {
        let mut chain = vec![root.clone()];
        let mut tip_id = root.block_id.clone();
        let mut tip_num = root.block_num;
        while let Some(next) = self
            .unlinkable
            .values()
            .find(|candidate| candidate.previous_id == tip_id && candidate.block_num > tip_num)
        {
            tip_id = next.block_id.clone();
            tip_num = next.block_num;
            chain.push(next.clone());
        }
        chain
    }

    fn admit_chain(&mut self, file: Arc<OneBlockFile>) {
        let mut queue = vec![file];
        while let Some(file) = queue.pop() {
            self.max_seen_lib = self.max_seen_lib.max(file.lib_num);
            self.seen_block_files.insert(file.fingerprint());
            let position = self.irreversible_blocks.partition_point(|b| {
                (b.block_num, b.block_id.as_str()) <= (file.block_num, file.block_id.as_str())
            });
            self.irreversible_blocks.insert(position, file.clone());

            // A block's children may have arrived first and been buffered.
            let buffered: Vec<(u64, String)> = self
                .unlinkable
                .iter()
                .filter(|(_, candidate)| candidate.previous_id == file.block_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in buffered {
                if let Some(child) = self.unlinkable.remove(&key) {
                    if child.block_num < self.exclusive_highest_block_limit()
                        || self.bundle_ready()
                    {
                        queue.push(child);
                    } else {
                        self.unlinkable.insert(key, child);
                    }
                }
            }
        }
    }

    /// Canonical chain inside the current window, linked from the retained
    /// anchor (or accepted as a chain root when no anchor exists). Longest
    /// chain wins; ties break on tip lib, then lowest tip id.
    fn select_bundle(&self) -> Option<Vec<Arc<OneBlockFile>>> {
        let window_end = self.exclusive_highest_block_limit();
        let candidates: Vec<Arc<OneBlockFile>> = self
            .irreversible_blocks
            .iter()
            .filter(|b| {
                b.block_num >= self.base_block_num && b.block_num < window_end && !b.is_merged()
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let anchor = self
            .irreversible_blocks
            .iter()
            .rev()
            .find(|b| b.block_num < self.base_block_num);
        let starts: Vec<usize> = match anchor {
            Some(anchor) => candidates
                .iter()
                .enumerate()
                .filter(|(_, b)| b.previous_id == anchor.block_id)
                .map(|(idx, _)| idx)
                .collect(),
            None => candidates
                .iter()
                .enumerate()
                .filter(|(_, b)| {
                    !candidates
                        .iter()
                        .any(|p| p.block_id == b.previous_id && p.block_num < b.block_num)
                })
                .map(|(idx, _)| idx)
                .collect(),
        };

        let mut best: Option<Vec<usize>> = None;
        for start in starts {
            let chain = longest_chain_from(&candidates, start);
            if best
                .as_ref()
                .map_or(true, |current| chain_beats(&candidates, &chain, current))
            {
                best = Some(chain);
            }
        }
        best.map(|chain| chain.into_iter().map(|idx| candidates[idx].clone()).collect())
    }

    fn advance(&mut self, bundle: &[Arc<OneBlockFile>]) {
        let Some(tip) = bundle.last() else {
            return;
        };
        let tip_key = tip.fingerprint();
        tip.mark_merged();
        let merged_keys: BTreeSet<(u64, String)> =
            bundle.iter().map(|b| b.fingerprint()).collect();
        self.base_block_num += self.bundle_size;
        let new_base = self.base_block_num;

        // Every merged source file is reclaimable; the tip survives only as
        // an in-memory linkage anchor for the next window.
        self.deleter.delete(bundle);

        let mut retained = Vec::with_capacity(self.irreversible_blocks.len());
        let mut stale = Vec::new();
        for block in self.irreversible_blocks.drain(..) {
            let key = block.fingerprint();
            if key == tip_key || block.block_num >= new_base {
                retained.push(block);
            } else if merged_keys.contains(&key) || block.is_merged() {
                // merged copies are already queued for deletion; seeded
                // anchors were never ours to delete
            } else {
                stale.push(block);
            }
        }
        self.irreversible_blocks = retained;
        if !stale.is_empty() {
            debug!(
                count = stale.len(),
                base = new_base,
                "dropping non-canonical blocks below bundle base"
            );
            self.deleter.delete(&stale);
        }

        let swept: Vec<(u64, String)> = self
            .unlinkable
            .iter()
            .filter(|((num, _), file)| *num < new_base && self.past_grace(file))
            .map(|(key, _)| key.clone())
            .collect();
        let mut swept_files = Vec::new();
        for key in swept {
            if let Some(file) = self.unlinkable.remove(&key) {
                swept_files.push(file);
            }
        }
        if !swept_files.is_empty() {
            debug!(
                count = swept_files.len(),
                base = new_base,
                "deleting unlinkable files below bundle base"
            );
            self.deleter.delete(&swept_files);
        }

        self.purge_seen();
    }

    fn past_grace(&self, file: &OneBlockFile) -> bool {
        Utc::now()
            .naive_utc()
            .signed_duration_since(file.block_time)
            >= self.writers_leeway
    }

    fn purge_seen(&mut self) {
        self.seen_block_files = self
            .seen_block_files
            .split_off(&(self.base_block_num, String::new()));
    }
}

fn longest_chain_from(blocks: &[Arc<OneBlockFile>], from: usize) -> Vec<usize> {
    let mut best = vec![from];
    for (idx, candidate) in blocks.iter().enumerate() {
        if idx == from {
            continue;
        }
        if candidate.previous_id == blocks[from].block_id
            && candidate.block_num > blocks[from].block_num
        {
            let mut chain = vec![from];
            chain.extend(longest_chain_from(blocks, idx));
            if chain_beats(blocks, &chain, &best) {
                best = chain;
            }
        }
    }
    best
}

fn chain_beats(blocks: &[Arc<OneBlockFile>], contender: &[usize], current: &[usize]) -> bool {
    if contender.len() != current.len() {
        return contender.len() > current.len();
    }
    let (Some(&contender_tip), Some(&current_tip)) = (contender.last(), current.last()) else {
        return false;
    };
    let contender_tip = &blocks[contender_tip];
    let current_tip = &blocks[current_tip];
    if contender_tip.lib_num != current_tip.lib_num {
        return contender_tip.lib_num > current_tip.lib_num;
    }
    contender_tip.block_id < current_tip.block_id
}
