pub mod export;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use glam::{Mat4, Vec3};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

use crate::geometry::{FeatureKind, Geometry};
use crate::tracking::AnchorId;

const SCHEMA_VERSION: i64 = 1;
const INLIER_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("geometry encoding error: {0}")]
    Geometry(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object name `{0}` is already taken")]
    DuplicateName(String),
    #[error("unsupported schema version {0}")]
    UnsupportedSchema(i64),
    #[error("corrupt record for anchor {anchor}: {reason}")]
    Corrupt { anchor: String, reason: String },
}

/// Durable record of a committed object, keyed by its anchor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedObject {
    pub anchor_id: AnchorId,
    pub name: String,
    pub geometry: Geometry,
    #[serde(skip)]
    pub inliers: Vec<Vec3>,
    pub rms_error: f32,
    pub created_at: DateTime<Utc>,
}

impl PersistedObject {
    pub fn kind(&self) -> FeatureKind {
        self.geometry.kind()
    }
}

/// Listing row; omits the inlier payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSummary {
    pub anchor_id: AnchorId,
    pub name: String,
    pub kind: FeatureKind,
    pub inlier_count: usize,
    pub rms_error: f32,
    pub created_at: DateTime<Utc>,
}

pub struct ObjectStore {
    conn: Connection,
}

impl ObjectStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            other => return Err(StoreError::UnsupportedSchema(other)),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS objects (
                anchor_id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                geometry TEXT NOT NULL,
                inliers BLOB NOT NULL,
                inlier_count INTEGER NOT NULL CHECK (inlier_count >= 0),
                rms_error REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_objects_created_at ON objects(created_at);
            ",
        )
    }

    pub fn insert(&self, object: &PersistedObject) -> Result<(), StoreError> {
        let geometry = serde_json::to_string(&object.geometry)?;
        let inliers = encode_inliers(&object.inliers)?;
        let result = self.conn.execute(
            "INSERT INTO objects (
                anchor_id, name, kind, geometry, inliers, inlier_count, rms_error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                object.anchor_id.to_string(),
                object.name,
                object.kind().as_str(),
                geometry,
                inliers,
                object.inliers.len() as i64,
                object.rms_error,
                object.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, Some(message)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && message.contains("objects.name") =>
            {
                Err(StoreError::DuplicateName(object.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn find(&self, anchor_id: AnchorId) -> Result<Option<PersistedObject>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT name, geometry, inliers, rms_error, created_at
                 FROM objects
                 WHERE anchor_id = ?1",
                params![anchor_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, f32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, geometry, inliers, rms_error, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(PersistedObject {
            anchor_id,
            name,
            geometry: serde_json::from_str(&geometry)?,
            inliers: decode_inliers(&inliers).map_err(|reason| corrupt(anchor_id, reason))?,
            rms_error,
            created_at: parse_timestamp(&created_at).map_err(|reason| corrupt(anchor_id, reason))?,
        }))
    }

    pub fn name_exists(&self, name: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn delete(&self, anchor_id: AnchorId) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM objects WHERE anchor_id = ?1",
            params![anchor_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Rewrites the stored placement. Returns false when no record exists.
    pub fn update_extrinsics(&self, anchor_id: AnchorId, extrinsics: Mat4) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let geometry: Option<String> = tx
            .query_row(
                "SELECT geometry FROM objects WHERE anchor_id = ?1",
                params![anchor_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(geometry) = geometry else {
            return Ok(false);
        };
        let mut geometry: Geometry = serde_json::from_str(&geometry)?;
        geometry.set_extrinsics(extrinsics);
        tx.execute(
            "UPDATE objects SET geometry = ?2 WHERE anchor_id = ?1",
            params![anchor_id.to_string(), serde_json::to_string(&geometry)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn list(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT anchor_id, name, kind, inlier_count, rms_error, created_at
             FROM objects
             ORDER BY created_at ASC, name ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_id: String = row.get(0)?;
            let anchor_id = raw_id.parse::<AnchorId>().map_err(|err| StoreError::Corrupt {
                anchor: raw_id.clone(),
                reason: err.to_string(),
            })?;
            let raw_kind: String = row.get(2)?;
            let kind = FeatureKind::parse(&raw_kind)
                .ok_or_else(|| corrupt(anchor_id, format!("unknown kind `{raw_kind}`")))?;
            let created_at: String = row.get(5)?;
            out.push(ObjectSummary {
                anchor_id,
                name: row.get(1)?,
                kind,
                inlier_count: row.get::<_, i64>(3)? as usize,
                rms_error: row.get(4)?,
                created_at: parse_timestamp(&created_at).map_err(|reason| corrupt(anchor_id, reason))?,
            });
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM objects", [])?)
    }
}

fn corrupt(anchor_id: AnchorId, reason: String) -> StoreError {
    StoreError::Corrupt {
        anchor: anchor_id.to_string(),
        reason,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| format!("bad created_at `{raw}`: {err}"))
}

/// Inliers are stored as packed little-endian f32 triples, zstd-compressed.
fn encode_inliers(points: &[Vec3]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(points.len() * 12);
    for point in points {
        for component in point.to_array() {
            raw.extend_from_slice(&component.to_le_bytes());
        }
    }
    zstd::stream::encode_all(raw.as_slice(), INLIER_COMPRESSION_LEVEL)
}

fn decode_inliers(blob: &[u8]) -> Result<Vec<Vec3>, String> {
    let raw = zstd::stream::decode_all(blob).map_err(|err| err.to_string())?;
    if raw.len() % 12 != 0 {
        return Err(format!("inlier payload of {} bytes is not a whole number of points", raw.len()));
    }
    Ok(raw
        .chunks_exact(12)
        .map(|chunk| {
            let component = |offset: usize| {
                f32::from_le_bytes([
                    chunk[offset],
                    chunk[offset + 1],
                    chunk[offset + 2],
                    chunk[offset + 3],
                ])
            };
            Vec3::new(component(0), component(4), component(8))
        })
        .collect())
}
