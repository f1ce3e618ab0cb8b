use super::{ConfigStore, StoreError};
use crate::models::{BlockDescriptor, ConnectionDescriptor, TagMapping};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Tables {
    connections: BTreeMap<String, ConnectionDescriptor>,
    blocks: BTreeMap<String, BlockDescriptor>,
    tags: Vec<TagMapping>,
    unavailable: Option<String>,
    read_delay: Option<Duration>,
}

/// In-process store; clones share the same tables.
///
/// Used by tests and tooling that want store semantics without a database file.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_connection(&self, connection: ConnectionDescriptor) {
        self.tables
            .lock()
            .connections
            .insert(connection.id.clone(), connection);
    }

    /// Deletes a connection together with its blocks and tag mappings
    pub fn remove_connection(&self, id: &str) -> Option<ConnectionDescriptor> {
        let mut tables = self.tables.lock();
        let removed = tables.connections.remove(id);
        let block_ids: Vec<String> = tables
            .blocks
            .values()
            .filter(|b| b.connection_id == id)
            .map(|b| b.id.clone())
            .collect();
        for block_id in &block_ids {
            tables.blocks.remove(block_id);
        }
        tables.tags.retain(|t| !block_ids.contains(&t.block_id));
        removed
    }

    /// Returns false when the connection does not exist
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.tables.lock().connections.get_mut(id) {
            Some(connection) => {
                connection.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Applies `change` to a stored connection in place
    pub fn modify_connection<F>(&self, id: &str, change: F) -> bool
    where
        F: FnOnce(&mut ConnectionDescriptor),
    {
        match self.tables.lock().connections.get_mut(id) {
            Some(connection) => {
                change(connection);
                true
            }
            None => false,
        }
    }

    pub fn upsert_block(&self, block: BlockDescriptor) {
        self.tables.lock().blocks.insert(block.id.clone(), block);
    }

    pub fn remove_block(&self, id: &str) -> Option<BlockDescriptor> {
        let mut tables = self.tables.lock();
        tables.tags.retain(|t| t.block_id != id);
        tables.blocks.remove(id)
    }

    pub fn add_tag_mapping(&self, mapping: TagMapping) {
        let mut tables = self.tables.lock();
        tables
            .tags
            .retain(|t| !(t.block_id == mapping.block_id && t.tag == mapping.tag && t.field == mapping.field));
        tables.tags.push(mapping);
    }

    /// Makes every read fail with `StoreError::Unavailable` until cleared with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.tables.lock().unavailable = reason.map(str::to_string);
    }

    /// Blocks the calling thread this long on every read, like a busy database
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.tables.lock().read_delay = delay;
    }

    fn read(&self) -> MutexGuard<'_, Tables> {
        let delay = self.tables.lock().read_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.tables.lock()
    }

    fn check(tables: &Tables) -> Result<(), StoreError> {
        match &tables.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn list_enabled_connections(&self) -> Result<Vec<ConnectionDescriptor>, StoreError> {
        let tables = self.read();
        Self::check(&tables)?;
        Ok(tables
            .connections
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionDescriptor>, StoreError> {
        let tables = self.read();
        Self::check(&tables)?;
        Ok(tables.connections.get(id).cloned())
    }

    fn list_blocks(&self, connection_id: &str) -> Result<Vec<BlockDescriptor>, StoreError> {
        let tables = self.read();
        Self::check(&tables)?;
        Ok(tables
            .blocks
            .values()
            .filter(|b| b.connection_id == connection_id)
            .cloned()
            .collect())
    }

    fn list_tag_mappings(&self, block_id: &str) -> Result<Vec<TagMapping>, StoreError> {
        let tables = self.read();
        Self::check(&tables)?;
        let mut tags: Vec<TagMapping> = tables
            .tags
            .iter()
            .filter(|t| t.block_id == block_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| (&a.tag, &a.field).cmp(&(&b.tag, &b.field)));
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, PropertyMap, TriggerMode};

    fn connection(id: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: id.into(),
            protocol: "mtc".into(),
            host: Some("127.0.0.1".into()),
            port: Some(502),
            timeout_s: 1.0,
            retry_s: 1.0,
            enabled: true,
            properties: PropertyMap::new(),
            updated_at: None,
        }
    }

    fn block(id: &str, conn: &str) -> BlockDescriptor {
        BlockDescriptor {
            id: id.into(),
            connection_id: conn.into(),
            enabled: true,
            direction: Direction::Read,
            trigger: TriggerMode::Cyclic,
            period_s: 1.0,
            properties: PropertyMap::new(),
        }
    }

    #[test]
    fn test_disabled_connections_are_not_listed() {
        let store = MemoryStore::new();
        store.upsert_connection(connection("b"));
        store.upsert_connection(connection("a"));
        store.upsert_connection(connection("c"));
        assert!(store.set_enabled("c", false));
        assert!(!store.set_enabled("zz", false));

        let ids: Vec<_> = store
            .list_enabled_connections()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.get_connection("c").unwrap().is_some());
    }

    #[test]
    fn test_remove_connection_cascades() {
        let store = MemoryStore::new();
        store.upsert_connection(connection("a"));
        store.upsert_block(block("b1", "a"));
        store.add_tag_mapping(TagMapping {
            block_id: "b1".into(),
            tag: "t".into(),
            field: "v".into(),
            scale: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            properties: PropertyMap::new(),
        });

        store.remove_connection("a");
        assert!(store.list_blocks("a").unwrap().is_empty());
        assert!(store.list_tag_mappings("b1").unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_store_fails_reads() {
        let store = MemoryStore::new();
        store.set_unavailable(Some("locked"));
        assert!(matches!(
            store.get_connection("a"),
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(None);
        assert!(store.get_connection("a").unwrap().is_none());
    }
}
