#![forbid(unsafe_code)]

//! Last-access bookkeeping for converted artifacts.
//!
//! Every artifact file under the media root should have an entry here; the
//! entry is created when a conversion finishes and refreshed on every read,
//! and a background task deletes artifacts nobody has touched for the
//! configured retention window. An entry whose file is already gone is
//! harmless: the sweep drops the entry without complaint.

use crate::console;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct CacheStore {
    media_root: PathBuf,
    entries: Mutex<HashMap<String, Instant>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed from the map (with their file deleted when present).
    pub removed: usize,
    /// Files whose deletion failed; their entries stay for the next pass.
    pub failed: usize,
}

impl CacheStore {
    pub fn new(media_root: PathBuf) -> Self {
        Self {
            media_root,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or refreshes the last-access timestamp for `file_name`.
    pub fn touch(&self, file_name: &str) {
        self.entries
            .lock()
            .insert(file_name.to_string(), Instant::now());
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.entries.lock().contains_key(file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One eviction pass over a snapshot of the current entries. Iterating a
    /// snapshot keeps the lock short and makes concurrent `touch` calls safe
    /// while files are being deleted.
    pub fn sweep_once(&self, retention: Duration) -> SweepStats {
        let snapshot: Vec<(String, Instant)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(name, last_used)| (name.clone(), *last_used))
                .collect()
        };

        let mut stats = SweepStats::default();
        for (file_name, last_used) in snapshot {
            if last_used.elapsed() <= retention {
                continue;
            }

            let path = self.media_root.join(&file_name);
            if path.exists() {
                if let Err(err) = std::fs::remove_file(&path) {
                    console::warn(format!("could not delete {}: {err}", path.display()));
                    stats.failed += 1;
                    continue;
                }
                console::debug(format!("Deleted \"{file_name}\""));
            }

            self.entries.lock().remove(&file_name);
            stats.removed += 1;
        }
        stats
    }
}

/// Spawns the periodic sweep task. A non-positive interval or retention
/// disables sweeping entirely; there is exactly one sweeper per server.
pub fn spawn_sweeper(
    store: Arc<CacheStore>,
    interval_secs: i64,
    retention_secs: i64,
) -> Option<JoinHandle<()>> {
    if interval_secs <= 0 || retention_secs <= 0 {
        return None;
    }

    let period = Duration::from_secs(interval_secs as u64);
    let retention = Duration::from_secs(retention_secs as u64);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first pass happens one full period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = store.sweep_once(retention);
            if stats.removed > 0 {
                console::info(format!("cache sweep removed {} artifact(s)", stats.removed));
            }
        }
    }))
}
