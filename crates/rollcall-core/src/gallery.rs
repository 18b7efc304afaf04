//! Enrollment gallery: one embedding per identity, served as immutable snapshots.
//!
//! Mutations build a new sorted vector and swap it in behind an `Arc`, so a
//! scan that already holds a snapshot never observes a half-applied enroll
//! or revoke.

use crate::types::{Embedding, EnrolledFace};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Point-in-time view of the gallery, sorted by identity id.
pub type Snapshot = Arc<Vec<EnrolledFace>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity {0} already has an enrolled embedding")]
    DuplicateIdentity(String),
    #[error("identity {0} has no enrolled embedding")]
    NotFound(String),
    #[error("invalid embedding: {0}")]
    InvalidVector(String),
    #[error("face store: {0}")]
    Storage(String),
}

/// Durable backing for the gallery. Writes happen before the in-memory swap.
pub trait FaceStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<EnrolledFace>, GalleryError>;
    fn insert(&self, face: &EnrolledFace) -> Result<(), GalleryError>;
    /// Returns `false` if no row existed.
    fn delete(&self, identity_id: &str) -> Result<bool, GalleryError>;
}

pub struct Gallery {
    dimension: usize,
    faces: RwLock<Snapshot>,
    /// Serializes enroll/revoke so check + persist + swap is one step.
    writer: Mutex<()>,
    store: Option<Box<dyn FaceStore>>,
}

impl std::fmt::Debug for Gallery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gallery")
            .field("dimension", &self.dimension)
            .field("enrolled", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Gallery {
    /// Empty, non-persistent gallery.
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            dimension,
            faces: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(()),
            store: None,
        }
    }

    /// Load every stored face and keep the store for write-through.
    ///
    /// Fails if any stored vector disagrees with `dimension`.
    pub fn open(dimension: usize, store: Box<dyn FaceStore>) -> Result<Self, GalleryError> {
        let mut faces = store.load_all()?;
        if let Some(bad) = faces.iter().find(|f| f.embedding.dimension() != dimension) {
            tracing::error!(
                identity = %bad.identity_id,
                stored = bad.embedding.dimension(),
                expected = dimension,
                "stored embedding has wrong dimension"
            );
            return Err(GalleryError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.dimension(),
            });
        }
        faces.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        faces.dedup_by(|a, b| a.identity_id == b.identity_id);

        tracing::info!(enrolled = faces.len(), dimension, "gallery loaded");

        Ok(Self {
            dimension,
            faces: RwLock::new(Arc::new(faces)),
            writer: Mutex::new(()),
            store: Some(store),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Current contents, sorted by identity id.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.faces.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, identity_id: &str) -> Option<EnrolledFace> {
        let snapshot = self.snapshot();
        snapshot
            .binary_search_by(|f| f.identity_id.as_str().cmp(identity_id))
            .ok()
            .map(|idx| snapshot[idx].clone())
    }

    /// Enroll a new identity.
    pub fn enroll(
        &self,
        identity_id: &str,
        vector: Vec<f32>,
        quality: f32,
    ) -> Result<EnrolledFace, GalleryError> {
        if identity_id.trim().is_empty() {
            return Err(GalleryError::InvalidVector("identity id is empty".into()));
        }
        if vector.len() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let embedding = Embedding::new(vector);
        if !embedding.is_finite() {
            return Err(GalleryError::InvalidVector(
                "embedding contains non-finite values".into(),
            ));
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let pos = match current.binary_search_by(|f| f.identity_id.as_str().cmp(identity_id)) {
            Ok(_) => return Err(GalleryError::DuplicateIdentity(identity_id.to_string())),
            Err(pos) => pos,
        };

        let face = EnrolledFace {
            identity_id: identity_id.to_string(),
            embedding,
            quality,
            enrolled_at: Utc::now(),
        };
        if let Some(store) = &self.store {
            store.insert(&face)?;
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend_from_slice(&current[..pos]);
        next.push(face.clone());
        next.extend_from_slice(&current[pos..]);
        self.swap(next);

        tracing::info!(identity = identity_id, quality, "identity enrolled");
        Ok(face)
    }

    /// Remove an identity's embedding.
    pub fn revoke(&self, identity_id: &str) -> Result<EnrolledFace, GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let pos = current
            .binary_search_by(|f| f.identity_id.as_str().cmp(identity_id))
            .map_err(|_| GalleryError::NotFound(identity_id.to_string()))?;

        if let Some(store) = &self.store {
            if !store.delete(identity_id)? {
                tracing::warn!(identity = identity_id, "revoked identity was missing from store");
            }
        }

        let mut next = current.as_ref().clone();
        let removed = next.remove(pos);
        self.swap(next);

        tracing::info!(identity = identity_id, "identity revoked");
        Ok(removed)
    }

    fn swap(&self, next: Vec<EnrolledFace>) {
        *self.faces.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}
