//! `faces` table: durable backing for the enrollment gallery.
//!
//! Vectors are stored as little-endian f32 blobs.

use crate::Database;
use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, EnrolledFace, FaceStore, GalleryError};
use rusqlite::{params, ErrorCode};

pub struct SqliteFaceStore {
    db: Database,
}

impl SqliteFaceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn storage_err(e: rusqlite::Error) -> GalleryError {
    GalleryError::Storage(e.to_string())
}

pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

impl FaceStore for SqliteFaceStore {
    fn load_all(&self) -> Result<Vec<EnrolledFace>, GalleryError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, dimension, vector, quality, enrolled_at
                 FROM faces ORDER BY identity_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, f32>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })
            .map_err(storage_err)?;

        let mut faces = Vec::new();
        for row in rows {
            let (identity_id, dimension, blob, quality, enrolled_at) = row.map_err(storage_err)?;
            let values = decode_vector(&blob)
                .filter(|v| v.len() as i64 == dimension)
                .ok_or_else(|| {
                    GalleryError::Storage(format!(
                        "corrupt vector for identity {identity_id}: {} bytes, dimension {dimension}",
                        blob.len()
                    ))
                })?;
            faces.push(EnrolledFace {
                identity_id,
                embedding: Embedding::new(values),
                quality,
                enrolled_at,
            });
        }
        Ok(faces)
    }

    fn insert(&self, face: &EnrolledFace) -> Result<(), GalleryError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO faces (identity_id, dimension, vector, quality, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                face.identity_id,
                face.embedding.dimension() as i64,
                encode_vector(&face.embedding.values),
                face.quality,
                face.enrolled_at,
            ],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => {
                GalleryError::DuplicateIdentity(face.identity_id.clone())
            }
            _ => storage_err(e),
        })?;
        Ok(())
    }

    fn delete(&self, identity_id: &str) -> Result<bool, GalleryError> {
        let conn = self.db.lock();
        let deleted = conn
            .execute("DELETE FROM faces WHERE identity_id = ?1", params![identity_id])
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }
}
