use super::{ConfigStore, StoreError};
use crate::models::{BlockDescriptor, ConnectionDescriptor, PropertyMap, TagMapping};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connection (
    id          TEXT PRIMARY KEY,
    protocol    TEXT NOT NULL,
    host        TEXT,
    port        INTEGER,
    timeout_s   REAL NOT NULL DEFAULT 5.0,
    retry_s     REAL NOT NULL DEFAULT 10.0,
    enabled     INTEGER NOT NULL DEFAULT 1,
    properties  TEXT NOT NULL DEFAULT '{}',
    updated_at  INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS block (
    id            TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL REFERENCES connection(id),
    enabled       INTEGER NOT NULL DEFAULT 1,
    direction     TEXT NOT NULL DEFAULT 'ro',
    trigger_mode  TEXT NOT NULL DEFAULT 'cyc',
    period_s      REAL NOT NULL DEFAULT 1.0,
    properties    TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS tag_mapping (
    block_id     TEXT NOT NULL REFERENCES block(id),
    tag          TEXT NOT NULL,
    field        TEXT NOT NULL DEFAULT 'v',
    scale        REAL NOT NULL DEFAULT 1.0,
    offset_value REAL NOT NULL DEFAULT 0.0,
    min_value    REAL,
    max_value    REAL,
    properties   TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (block_id, tag, field)
);

CREATE INDEX IF NOT EXISTS idx_block_connection ON block(connection_id);
"#;

const CONNECTION_COLUMNS: &str =
    "id, protocol, host, port, timeout_s, retry_s, enabled, properties, updated_at";

/// Configuration store backed by the edge SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::Unavailable(format!(
                "database not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens (or creates) the database and makes sure the schema exists
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let store = Self::from_connection(Connection::open(path)?)?;
        store.init_schema()?;
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(30))?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Raw SQL access for provisioning tools and tests
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

struct RawConnection {
    id: String,
    protocol: String,
    host: Option<String>,
    port: Option<i64>,
    timeout_s: f64,
    retry_s: f64,
    enabled: bool,
    properties: String,
    updated_at: Option<i64>,
}

impl RawConnection {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            protocol: row.get("protocol")?,
            host: row.get("host")?,
            port: row.get("port")?,
            timeout_s: row.get("timeout_s")?,
            retry_s: row.get("retry_s")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            properties: row.get("properties")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_descriptor(self) -> Result<ConnectionDescriptor, StoreError> {
        let record = format!("connection {}", self.id);
        let port = self
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|e| StoreError::malformed(&record, format!("port: {e}")))?;
        let updated_at = self
            .updated_at
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|e| StoreError::malformed(&record, format!("updated_at: {e}")))?;
        Ok(ConnectionDescriptor {
            properties: parse_properties(&record, &self.properties)?,
            id: self.id,
            protocol: self.protocol,
            host: self.host.filter(|h| !h.trim().is_empty()),
            port,
            timeout_s: self.timeout_s,
            retry_s: self.retry_s,
            enabled: self.enabled,
            updated_at,
        })
    }
}

fn parse_properties(record: &str, raw: &str) -> Result<PropertyMap, StoreError> {
    if raw.trim().is_empty() {
        return Ok(PropertyMap::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::malformed(
            record,
            format!("properties must be a JSON object, got {other}"),
        )),
        Err(e) => Err(StoreError::malformed(record, format!("properties: {e}"))),
    }
}

impl ConfigStore for SqliteStore {
    fn list_enabled_connections(&self) -> Result<Vec<ConnectionDescriptor>, StoreError> {
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONNECTION_COLUMNS} FROM connection WHERE enabled = 1 ORDER BY id"
            ))?;
            // step errors abort the listing, decode errors stay with their row
            let rows = stmt.query_map([], |row| Ok(RawConnection::from_row(row)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut connections = Vec::with_capacity(raws.len());
        for raw in raws {
            match raw.map_err(StoreError::from).and_then(RawConnection::into_descriptor) {
                Ok(connection) => connections.push(connection),
                Err(e) => warn!("Skipping enabled connection: {}", e),
            }
        }
        Ok(connections)
    }

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionDescriptor>, StoreError> {
        let raw = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {CONNECTION_COLUMNS} FROM connection WHERE id = ?1"),
                params![id],
                RawConnection::from_row,
            )
            .optional()?;
        raw.map(RawConnection::into_descriptor).transpose()
    }

    fn list_blocks(&self, connection_id: &str) -> Result<Vec<BlockDescriptor>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, connection_id, enabled, direction, trigger_mode, period_s, properties \
             FROM block WHERE connection_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![connection_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (id, connection_id, enabled, direction, trigger, period_s, properties) = row?;
            let record = format!("block {id}");
            blocks.push(BlockDescriptor {
                direction: direction
                    .parse()
                    .map_err(|e| StoreError::malformed(&record, format!("direction: {e}")))?,
                trigger: trigger
                    .parse()
                    .map_err(|e| StoreError::malformed(&record, format!("trigger: {e}")))?,
                properties: parse_properties(&record, &properties)?,
                id,
                connection_id,
                enabled,
                period_s,
            });
        }
        Ok(blocks)
    }

    fn list_tag_mappings(&self, block_id: &str) -> Result<Vec<TagMapping>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT block_id, tag, field, scale, offset_value, min_value, max_value, properties \
             FROM tag_mapping WHERE block_id = ?1 ORDER BY tag, field",
        )?;
        let rows = stmt.query_map(params![block_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut mappings = Vec::new();
        for row in rows {
            let (block_id, tag, field, scale, offset, min, max, properties) = row?;
            let record = format!("tag mapping {block_id}/{tag}");
            mappings.push(TagMapping {
                properties: parse_properties(&record, &properties)?,
                block_id,
                tag,
                field,
                scale,
                offset,
                min,
                max,
            });
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TriggerMode};

    fn seeded() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::create(dir.path().join("edge.db")).unwrap();
        store
            .execute_batch(
                r#"
                INSERT INTO connection (id, protocol, host, port, timeout_s, retry_s, enabled, properties)
                VALUES ('mtc-02', 'mtc', '10.0.0.2', 502, 3.0, 5.0, 1, '{"unit_id": 2}'),
                       ('mtc-01', 'mtc', '10.0.0.1', 502, 3.0, 5.0, 1, '{}'),
                       ('ouc-01', 'ouc', 'opc.local', 4840, 5.0, 10.0, 0, '{}');
                INSERT INTO block (id, connection_id, direction, trigger_mode, period_s, properties)
                VALUES ('b2', 'mtc-01', 'rw', 'chg', 0.5, '{}'),
                       ('b1', 'mtc-01', 'ro', 'cyc', 1.0, '{"func_code": 4}');
                INSERT INTO tag_mapping (block_id, tag, field, scale, offset_value, min_value)
                VALUES ('b1', 'line1/temp', 'v', 0.1, -40.0, -40.0);
                "#,
            )
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_enabled_connections_ordered_by_id() {
        let (_dir, store) = seeded();
        let conns = store.list_enabled_connections().unwrap();
        let ids: Vec<_> = conns.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["mtc-01", "mtc-02"]);
        assert_eq!(conns[1].properties["unit_id"], 2);
        assert!(conns[0].updated_at.is_some());
    }

    #[test]
    fn test_get_connection_absent_is_none() {
        let (_dir, store) = seeded();
        assert!(store.get_connection("nope").unwrap().is_none());
        let disabled = store.get_connection("ouc-01").unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.port, Some(4840));
    }

    #[test]
    fn test_blocks_and_mappings() {
        let (_dir, store) = seeded();
        let blocks = store.list_blocks("mtc-01").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, "b1");
        assert_eq!(blocks[0].trigger, TriggerMode::Cyclic);
        assert_eq!(blocks[1].direction, Direction::ReadWrite);
        assert!(store.list_blocks("mtc-02").unwrap().is_empty());

        let tags = store.list_tag_mappings("b1").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].offset, -40.0);
        assert_eq!(tags[0].max, None);
        assert!(store.list_tag_mappings("b2").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_properties_are_reported() {
        let (_dir, store) = seeded();
        store
            .execute_batch("UPDATE block SET properties = '[1, 2]' WHERE id = 'b2';")
            .unwrap();
        let err = store.list_blocks("mtc-01").unwrap_err();
        assert!(matches!(err, StoreError::Malformed { ref record, .. } if record == "block b2"));
    }

    #[test]
    fn test_bad_connection_row_does_not_hide_the_others() {
        let (_dir, store) = seeded();
        store
            .execute_batch(
                r#"
                INSERT INTO connection (id, protocol, host, port, enabled, properties)
                VALUES ('mtc-03', 'mtc', '10.0.0.3', 502, 1, '{broken'),
                       ('mtc-04', 'mtc', '10.0.0.4', 70000, 1, '{}'),
                       ('mtc-05', 'mtc', '10.0.0.5', 502, 1, '{}');
                UPDATE connection SET timeout_s = 'soon' WHERE id = 'mtc-02';
                "#,
            )
            .unwrap();

        let ids: Vec<_> = store
            .list_enabled_connections()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["mtc-01", "mtc-05"]);
        // single reads still surface the problem
        assert!(matches!(
            store.get_connection("mtc-03"),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_open_missing_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::open(dir.path().join("missing.db")).err().unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
