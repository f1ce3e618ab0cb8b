/*!
SERVICE REGISTRY - one record per managed connection

ROLE:
In-memory map of ServiceRecords behind a single mutex, persisted as pretty
JSON so restart counters survive a supervisor restart.

OPERATION:
Callers snapshot under the lock, do their service-manager I/O unlocked, then
commit. Every `register` hands out a new generation; a commit carrying a stale
generation is refused, which is how an add racing a remove finds out it lost.
*/

use crate::error::SupervisorError;
use conduit_core::ConnectionDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub conn_id: String,
    pub protocol: String,
    pub module: String,
    pub enabled: bool,
    pub active: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_restart: Option<OffsetDateTime>,
    #[serde(skip)]
    pub generation: u64,
}

impl ServiceRecord {
    pub fn new(connection: &ConnectionDescriptor, module: &str) -> Self {
        Self {
            conn_id: connection.id.clone(),
            protocol: connection.protocol.clone(),
            module: module.to_string(),
            enabled: connection.enabled,
            active: false,
            restart_count: 0,
            last_restart: None,
            generation: 0,
        }
    }
}

#[derive(Default)]
struct Records {
    by_id: BTreeMap<String, ServiceRecord>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    records: Arc<Mutex<Records>>,
    path: Option<PathBuf>,
    // serializes writers of the JSON file
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ServiceRegistry {
    /// Registry that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            records: Arc::new(Mutex::new(Records::default())),
            path: None,
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the persisted records; a missing file is an empty registry
    pub async fn load(&self) -> Result<usize, SupervisorError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let loaded: BTreeMap<String, ServiceRecord> = serde_json::from_str(&content)?;

        let mut records = self.records.lock();
        for (id, mut record) in loaded {
            records.next_generation += 1;
            record.generation = records.next_generation;
            records.by_id.insert(id, record);
        }
        let count = records.by_id.len();
        drop(records);

        info!("Loaded {} service record(s) from {}", count, path.display());
        Ok(count)
    }

    pub async fn save(&self) -> Result<(), SupervisorError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _writer = self.save_lock.lock().await;
        let content = {
            let records = self.records.lock();
            serde_json::to_string_pretty(&records.by_id)?
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Inserts or refreshes the record and returns its new generation.
    ///
    /// Restart bookkeeping of an existing record is kept.
    pub fn register(&self, record: ServiceRecord) -> u64 {
        let mut records = self.records.lock();
        records.next_generation += 1;
        let generation = records.next_generation;
        match records.by_id.get_mut(&record.conn_id) {
            Some(existing) => {
                existing.protocol = record.protocol;
                existing.module = record.module;
                existing.enabled = record.enabled;
                existing.generation = generation;
            }
            None => {
                records.by_id.insert(
                    record.conn_id.clone(),
                    ServiceRecord {
                        generation,
                        ..record
                    },
                );
            }
        }
        generation
    }

    pub fn get(&self, conn_id: &str) -> Option<ServiceRecord> {
        self.records.lock().by_id.get(conn_id).cloned()
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.records.lock().by_id.contains_key(conn_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered by connection id
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.records.lock().by_id.values().cloned().collect()
    }

    /// True while `generation` is still the one the record carries
    pub fn is_current(&self, conn_id: &str, generation: u64) -> bool {
        self.records
            .lock()
            .by_id
            .get(conn_id)
            .is_some_and(|r| r.generation == generation)
    }

    /// Sets the active flag unless the record was removed or re-registered meanwhile
    pub fn commit_active(&self, conn_id: &str, generation: u64, active: bool) -> bool {
        let mut records = self.records.lock();
        match records.by_id.get_mut(conn_id) {
            Some(record) if record.generation == generation => {
                record.active = active;
                true
            }
            _ => false,
        }
    }

    pub fn update<F>(&self, conn_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ServiceRecord),
    {
        match self.records.lock().by_id.get_mut(conn_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, conn_id: &str) -> Option<ServiceRecord> {
        self.records.lock().by_id.remove(conn_id)
    }
}
