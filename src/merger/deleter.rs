//! Background deletion of one-block files already folded into a bundle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bundle::OneBlockFile;
use crate::store::ObjectStore;

const MAX_DELETE_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Worker pool erasing source files. The queue is bounded: when full, the
/// oldest entry is dropped with a warning instead of blocking the bundler —
/// an orphaned source file is only wasted storage.
pub struct Deleter {
    handle: DeleterHandle,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DeleterHandle {
    queue: Arc<Mutex<VecDeque<Arc<OneBlockFile>>>>,
    capacity: usize,
    notify: Arc<Notify>,
}

impl DeleterHandle {
    pub fn delete(&self, files: &[Arc<OneBlockFile>]) {
        if files.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().expect("deletion queue lock poisoned");
        for file in files {
            if queue.len() >= self.capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        block = dropped.block_num,
                        block_id = %dropped.block_id,
                        "deletion queue full, dropping oldest entry"
                    );
                }
            }
            queue.push_back(file.clone());
        }
        drop(queue);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("deletion queue lock poisoned").len()
    }

    fn pop(&self) -> Option<Arc<OneBlockFile>> {
        self.queue
            .lock()
            .expect("deletion queue lock poisoned")
            .pop_front()
    }

    /// Standalone queue with no workers attached, for state-machine tests.
    #[cfg(test)]
    pub fn for_tests(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            notify: Arc::new(Notify::new()),
        }
    }

    #[cfg(test)]
    pub fn drain_for_tests(&self) -> Vec<Arc<OneBlockFile>> {
        std::iter::from_fn(|| self.pop()).collect()
    }
}

impl Deleter {
    pub fn start(
        store: Arc<dyn ObjectStore>,
        threads: usize,
        capacity: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let handle = DeleterHandle {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            notify: Arc::new(Notify::new()),
        };
        let workers = (0..threads.max(1))
            .map(|_| {
                tokio::spawn(run_worker(
                    Arc::clone(&store),
                    handle.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        Self { handle, workers }
    }

    pub fn handle(&self) -> DeleterHandle {
        self.handle.clone()
    }

    /// Wait for every worker to observe shutdown and exit.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    store: Arc<dyn ObjectStore>,
    handle: DeleterHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match handle.pop() {
            Some(file) => delete_file(store.as_ref(), &file).await,
            None => {
                tokio::select! {
                    _ = handle.notify.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn delete_file(store: &dyn ObjectStore, file: &OneBlockFile) {
    for name in file.filenames() {
        let mut attempt = 0u32;
        loop {
            match store.delete(&name).await {
                Ok(()) => {
                    debug!(block = file.block_num, file = %name, "deleted one-block file");
                    break;
                }
                Err(err) if attempt + 1 < MAX_DELETE_ATTEMPTS => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        file = %name,
                        attempt,
                        error = %err,
                        "one-block file deletion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        file = %name,
                        error = %err,
                        "abandoning one-block file deletion after repeated failures"
                    );
                    break;
                }
            }
        }
    }
}
