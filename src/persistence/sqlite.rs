//! SQLite-backed tier persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::schema::{initialize_schema, is_initialized};
use super::TierPersistence;
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, NexusPoint, RecordId, Reference, Role, SignificanceType, Tier};

/// All tiers and nexus points in one SQLite database.
#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_error)?;
        if is_initialized(&conn) {
            debug!("Existing database, applying pending migrations");
        }
        initialize_schema(&conn).map_err(storage_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        initialize_schema(&conn).map_err(storage_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("SQLite task failed: {}", e)))?
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            id: row.get(0)?,
            tier: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            last_accessed_at: row.get(5)?,
            access_count: row.get(6)?,
            token_count: row.get(7)?,
            reference: row.get(8)?,
            metadata: row.get(9)?,
            derived_from: row.get(10)?,
        })
    }
}

/// Column values before parsing into domain types.
struct RawRecord {
    id: String,
    tier: String,
    role: String,
    content: String,
    created_at: String,
    last_accessed_at: String,
    access_count: i64,
    token_count: i64,
    reference: String,
    metadata: Option<String>,
    derived_from: Option<String>,
}

impl RawRecord {
    fn into_record(self) -> Result<MemoryRecord> {
        let metadata: HashMap<String, serde_json::Value> = match self.metadata {
            Some(m) => serde_json::from_str(&m)?,
            None => HashMap::new(),
        };
        let derived_from: Vec<Reference> = match self.derived_from {
            Some(d) => serde_json::from_str(&d)?,
            None => Vec::new(),
        };

        Ok(MemoryRecord {
            id: self.id.parse::<RecordId>()?,
            role: serde_json::from_value(serde_json::Value::String(self.role))?,
            content: self.content,
            tier: self.tier.parse::<Tier>()?,
            created_at: parse_time(&self.created_at)?,
            last_accessed_at: parse_time(&self.last_accessed_at)?,
            access_count: self.access_count.max(0) as u64,
            token_count: self.token_count.max(0) as u64,
            reference: Reference::parse(&self.reference)?,
            metadata,
            derived_from,
        })
    }
}

fn storage_error(e: rusqlite::Error) -> Error {
    Error::persistence_with_source("SQLite error", e)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::persistence(format!("bad timestamp {:?}: {}", s, e)))
}

fn role_name(role: Role) -> String {
    role.to_string()
}

#[async_trait]
impl TierPersistence for SqlitePersistence {
    async fn load(&self, tier: Tier) -> Result<Vec<MemoryRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, tier, role, content, created_at, last_accessed_at,
                            access_count, token_count, reference, metadata, derived_from
                     FROM records WHERE tier = ?1 ORDER BY position",
                )
                .map_err(storage_error)?;
            let raw = stmt
                .query_map(params![tier.as_str()], Self::row_to_record)
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            raw.into_iter().map(RawRecord::into_record).collect()
        })
        .await
    }

    async fn save(&self, tier: Tier, records: &[MemoryRecord]) -> Result<()> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_error)?;
            tx.execute("DELETE FROM records WHERE tier = ?1", params![tier.as_str()])
                .map_err(storage_error)?;
            for (position, record) in records.iter().enumerate() {
                let metadata = if record.metadata.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&record.metadata)?)
                };
                let derived_from = if record.derived_from.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&record.derived_from)?)
                };
                tx.execute(
                    "INSERT OR REPLACE INTO records (
                        id, tier, position, role, content, created_at, last_accessed_at,
                        access_count, token_count, reference, metadata, derived_from
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        record.id.to_string(),
                        tier.as_str(),
                        position as i64,
                        role_name(record.role),
                        record.content,
                        record.created_at.to_rfc3339(),
                        record.last_accessed_at.to_rfc3339(),
                        record.access_count as i64,
                        record.token_count as i64,
                        record.reference.as_str(),
                        metadata,
                        derived_from,
                    ],
                )
                .map_err(storage_error)?;
            }
            tx.commit().map_err(storage_error)
        })
        .await
    }

    async fn load_nexus(&self) -> Result<Vec<NexusPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, record_id, significance, related, created_at, description, automatic
                     FROM nexus_points ORDER BY created_at",
                )
                .map_err(storage_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                    ))
                })
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;

            rows.into_iter()
                .map(|(id, record_id, significance, related, created_at, description, automatic)| {
                    Ok(NexusPoint {
                        id: serde_json::from_value(serde_json::Value::String(id))?,
                        record_id: record_id.parse::<RecordId>()?,
                        significance: serde_json::from_value::<SignificanceType>(
                            serde_json::Value::String(significance),
                        )?,
                        related: serde_json::from_str(&related)?,
                        created_at: parse_time(&created_at)?,
                        description,
                        automatic,
                    })
                })
                .collect()
        })
        .await
    }

    async fn save_nexus(&self, points: &[NexusPoint]) -> Result<()> {
        let points = points.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_error)?;
            tx.execute("DELETE FROM nexus_points", [])
                .map_err(storage_error)?;
            for point in &points {
                tx.execute(
                    "INSERT INTO nexus_points (
                        id, record_id, significance, related, created_at, description, automatic
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        point.id.to_string(),
                        point.record_id.to_string(),
                        point.significance.to_string(),
                        serde_json::to_string(&point.related)?,
                        point.created_at.to_rfc3339(),
                        point.description,
                        point.automatic,
                    ],
                )
                .map_err(storage_error)?;
            }
            tx.commit().map_err(storage_error)
        })
        .await
    }
}
