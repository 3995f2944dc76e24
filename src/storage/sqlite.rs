//! SQLite3 storage backend implementation

use crate::error::{PlaybackError, Result};
use crate::storage::{merge_sorted, RawRecord, StorageReader};
use crate::types::{Connection, MessageDefinition, MessageDefinitionFormat};
use rusqlite::Connection as SqliteConnection;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// SQLite3 storage reader implementation
pub struct SqliteReader {
    /// Database connections (one per file)
    databases: Vec<SqliteConnection>,
    /// Topic connections, deduplicated by topic name across files
    connections: Vec<Connection>,
    /// Per database: local topics.id -> connection id
    topic_ids: Vec<HashMap<i64, u32>>,
    /// Schema version detected from the last database
    schema_version: u32,
}

impl SqliteReader {
    /// Open every database read-only and read its topics
    pub fn open(paths: &[&Path]) -> Result<Self> {
        let mut databases = Vec::with_capacity(paths.len());
        for path in paths {
            let conn = SqliteConnection::open_with_flags(
                path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            )?;
            Self::check_required_tables(&conn, path)?;
            databases.push(conn);
        }

        let schema_version = match databases.last() {
            Some(conn) => Self::detect_schema_version(conn)?,
            None => 0,
        };
        let definitions = match databases.last() {
            Some(conn) if schema_version >= 4 => Self::load_message_definitions(conn)?,
            _ => HashMap::new(),
        };

        let mut connections: Vec<Connection> = Vec::new();
        let mut topic_ids = Vec::with_capacity(databases.len());
        for conn in &databases {
            let mut ids = HashMap::new();
            let mut stmt =
                conn.prepare("SELECT id, name, type, serialization_format FROM topics ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (local_id, name, message_type, serialization_format) = row?;
                let existing = connections.iter().find(|c| c.topic == name).map(|c| c.id);
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = connections.len() as u32 + 1;
                        let message_definition =
                            definitions.get(&message_type).cloned().unwrap_or_default();
                        connections.push(Connection {
                            id,
                            topic: name,
                            message_type,
                            message_definition,
                            serialization_format,
                        });
                        id
                    }
                };
                ids.insert(local_id, id);
            }
            topic_ids.push(ids);
        }

        debug!(
            files = databases.len(),
            schema_version,
            connections = connections.len(),
            "opened sqlite3 storage"
        );

        Ok(Self {
            databases,
            connections,
            topic_ids,
            schema_version,
        })
    }

    /// Schema version of the newest database file
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn check_required_tables(conn: &SqliteConnection, path: &Path) -> Result<()> {
        let table_count: i32 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('messages', 'topics')",
            [],
            |row| row.get(0),
        )?;
        if table_count != 2 {
            return Err(PlaybackError::invalid_bag(format!(
                "database {} is missing required tables",
                path.display()
            )));
        }
        Ok(())
    }

    /// Detect the schema version from the database
    fn detect_schema_version(conn: &SqliteConnection) -> Result<u32> {
        let schema_table_exists: i32 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='schema'",
            [],
            |row| row.get(0),
        )?;

        if schema_table_exists > 0 {
            let version: i32 =
                conn.query_row("SELECT schema_version FROM schema", [], |row| row.get(0))?;
            return Ok(version as u32);
        }

        // No schema table: v2 added offered_qos_profiles to topics
        let mut stmt = conn.prepare("PRAGMA table_info(topics)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for column in columns {
            if column? == "offered_qos_profiles" {
                return Ok(2);
            }
        }
        Ok(1)
    }

    /// Load message definitions (schema version 4+), keyed by type name
    fn load_message_definitions(conn: &SqliteConnection) -> Result<HashMap<String, MessageDefinition>> {
        let mut stmt = conn.prepare(
            "SELECT topic_type, encoding, encoded_message_definition
             FROM message_definitions ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut definitions = HashMap::new();
        for row in rows {
            let (topic_type, encoding, data) = row?;
            definitions.insert(
                topic_type,
                MessageDefinition {
                    format: MessageDefinitionFormat::from_encoding(&encoding),
                    data,
                },
            );
        }
        Ok(definitions)
    }
}

impl StorageReader for SqliteReader {
    fn connections(&self) -> &[Connection] {
        &self.connections
    }

    fn time_range(&self) -> Result<Option<(u64, u64)>> {
        let mut range: Option<(u64, u64)> = None;
        for conn in &self.databases {
            let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM messages",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if let (Some(min), Some(max)) = (min, max) {
                let (min, max) = (min as u64, max as u64);
                range = Some(match range {
                    Some((start, end)) => (start.min(min), end.max(max)),
                    None => (min, max),
                });
            }
        }
        Ok(range)
    }

    fn messages(&self, connection_ids: &[u32], start: u64, end: u64) -> Result<Vec<RawRecord>> {
        if connection_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_file = Vec::with_capacity(self.databases.len());
        for (conn, ids) in self.databases.iter().zip(&self.topic_ids) {
            let local_ids: Vec<(i64, u32)> = ids
                .iter()
                .filter(|(_, id)| connection_ids.contains(id))
                .map(|(local, id)| (*local, *id))
                .collect();
            if local_ids.is_empty() {
                continue;
            }

            let placeholders = vec!["?"; local_ids.len()].join(",");
            let query = format!(
                "SELECT topic_id, timestamp, data FROM messages
                 WHERE topic_id IN ({placeholders}) AND timestamp >= ? AND timestamp <= ?
                 ORDER BY timestamp, id"
            );
            let mut params: Vec<i64> = local_ids.iter().map(|(local, _)| *local).collect();
            params.push(start as i64);
            params.push(end.min(i64::MAX as u64) as i64);

            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (topic_id, timestamp, data) = row?;
                if let Some(connection_id) = ids.get(&topic_id) {
                    records.push(RawRecord {
                        connection_id: *connection_id,
                        timestamp: timestamp as u64,
                        data,
                    });
                }
            }
            per_file.push(records);
        }

        Ok(merge_sorted(per_file))
    }

    fn close(&mut self) -> Result<()> {
        for conn in self.databases.drain(..) {
            conn.close().map_err(|(_, err)| PlaybackError::from(err))?;
        }
        self.topic_ids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_database(dir: &TempDir, name: &str, rows: &[(i64, &str, i64)]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let conn = SqliteConnection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE topics (id INTEGER PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
                 serialization_format TEXT NOT NULL, offered_qos_profiles TEXT NOT NULL);
             CREATE TABLE messages (id INTEGER PRIMARY KEY, topic_id INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL, data BLOB NOT NULL);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO topics VALUES (1, '/a', 'std_msgs/msg/String', 'cdr', ''), \
             (2, '/b', 'std_msgs/msg/String', 'cdr', '')",
            [],
        )
        .unwrap();
        for (topic_id, _, timestamp) in rows {
            conn.execute(
                "INSERT INTO messages (topic_id, timestamp, data) VALUES (?1, ?2, x'00')",
                rusqlite::params![topic_id, timestamp],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn reads_inclusive_window_for_selected_topics() {
        let dir = TempDir::new().unwrap();
        let path = write_database(&dir, "bag_0.db3", &[(1, "/a", 10), (2, "/b", 15), (1, "/a", 20), (1, "/a", 30)]);
        let reader = SqliteReader::open(&[path.as_path()]).unwrap();

        assert_eq!(reader.schema_version(), 2);
        assert_eq!(reader.connections().len(), 2);
        assert_eq!(reader.time_range().unwrap(), Some((10, 30)));

        let records = reader.messages(&[1], 10, 20).unwrap();
        let timestamps: Vec<u64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20]);
    }

    #[test]
    fn missing_tables_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.db3");
        SqliteConnection::open(&path).unwrap();
        let err = SqliteReader::open(&[path.as_path()]).err().unwrap();
        assert!(matches!(err, PlaybackError::InvalidBag { .. }));
    }

    #[test]
    fn empty_database_has_no_time_range() {
        let dir = TempDir::new().unwrap();
        let path = write_database(&dir, "bag_0.db3", &[]);
        let reader = SqliteReader::open(&[path.as_path()]).unwrap();
        assert_eq!(reader.time_range().unwrap(), None);
    }
}
