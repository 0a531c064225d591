use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bundle::OneBlockFile;
use crate::store::ObjectStore;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "block-merger-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub fn one_block_file(name: &str) -> Arc<OneBlockFile> {
    Arc::new(OneBlockFile::parse_name(name).expect("valid test filename"))
}

pub fn block_file(num: u64, id: &str, prev: &str, lib: u64) -> Arc<OneBlockFile> {
    one_block_file(&format!(
        "{num:010}-20210728T105016.0-{id}-{prev}-{lib}-suffix"
    ))
}

/// In-memory object store that records deletions and can inject failures.
#[derive(Default)]
pub struct RecordingStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    deleted: Mutex<Vec<String>>,
    delete_failures: AtomicUsize,
    write_failures: AtomicUsize,
}

impl RecordingStore {
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("deleted lock").clone()
    }

    pub fn fail_deletes(&self, count: usize) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .expect("objects lock")
            .insert(name.to_string(), data);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .expect("objects lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn consume_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn list_from(&self, start_after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let mut names = self.names();
        if let Some(after) = start_after {
            names.retain(|name| name.as_str() > after);
        }
        names.truncate(limit);
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().expect("objects lock").get(name).cloned())
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        if Self::consume_failure(&self.write_failures) {
            return Err(eyre!("injected write failure for {name}"));
        }
        self.insert(name, data.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if Self::consume_failure(&self.delete_failures) {
            return Err(eyre!("injected delete failure for {name}"));
        }
        self.objects.lock().expect("objects lock").remove(name);
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(name.to_string());
        Ok(())
    }
}
