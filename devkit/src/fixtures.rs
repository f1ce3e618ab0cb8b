//! Record builders for tests.

use conduit_core::store::MemoryStore;
use conduit_core::{
    BlockDescriptor, ConnectionDescriptor, Direction, PropertyMap, TagMapping, TriggerMode,
};

pub fn connection(id: &str, protocol: &str, host: &str) -> ConnectionDescriptor {
    ConnectionDescriptor {
        id: id.to_string(),
        protocol: protocol.to_string(),
        host: Some(host.to_string()),
        port: Some(502),
        timeout_s: 1.0,
        retry_s: 1.0,
        enabled: true,
        properties: PropertyMap::new(),
        updated_at: None,
    }
}

pub fn block(id: &str, conn_id: &str, period_s: f64) -> BlockDescriptor {
    BlockDescriptor {
        id: id.to_string(),
        connection_id: conn_id.to_string(),
        enabled: true,
        direction: Direction::Read,
        trigger: TriggerMode::Cyclic,
        period_s,
        properties: PropertyMap::new(),
    }
}

pub fn tag(block_id: &str, tag: &str) -> TagMapping {
    TagMapping {
        block_id: block_id.to_string(),
        tag: tag.to_string(),
        field: "v".to_string(),
        scale: 1.0,
        offset: 0.0,
        min: None,
        max: None,
        properties: PropertyMap::new(),
    }
}

/// A store holding one enabled `mtc` connection per id, each with one block and one tag
pub fn seeded_store(ids: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    for (i, id) in ids.iter().enumerate() {
        store.upsert_connection(connection(id, "mtc", &format!("10.0.0.{}", i + 1)));
        let block_id = format!("{id}-b1");
        store.upsert_block(block(&block_id, id, 1.0));
        store.add_tag_mapping(tag(&block_id, &format!("{id}/value")));
    }
    store
}
