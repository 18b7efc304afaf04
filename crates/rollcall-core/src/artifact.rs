//! Transient probe artifacts: captured images that must not outlive one request.
//!
//! A [`ProbeArtifact`] owns its file and deletes it in `Drop`, so every exit
//! path (return, `?`, panic unwind, future cancellation) releases it exactly
//! once.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PROBE_PREFIX: &str = "probe-";

#[derive(Debug, Default)]
struct SpoolStats {
    created: AtomicU64,
    released: AtomicU64,
}

/// Directory where probe images are staged for the extraction collaborator.
#[derive(Debug, Clone)]
pub struct ArtifactSpool {
    dir: PathBuf,
    stats: Arc<SpoolStats>,
}

impl ArtifactSpool {
    /// Use `dir` as the spool, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stats: Arc::new(SpoolStats::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh, uniquely named file.
    ///
    /// The guard exists before the write starts, so a partial write is
    /// cleaned up too.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<ProbeArtifact> {
        let artifact = self.reserve();
        tokio::fs::write(&artifact.path, bytes).await?;
        tracing::debug!(path = %artifact.path.display(), bytes = bytes.len(), "probe artifact written");
        Ok(artifact)
    }

    /// Take ownership of a file path without writing it.
    pub fn adopt(&self, path: impl Into<PathBuf>) -> ProbeArtifact {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        ProbeArtifact {
            path: path.into(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Delete probe files left behind by a previous process.
    pub fn purge_stale(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let is_probe = entry.file_name().to_string_lossy().starts_with(PROBE_PREFIX);
            if is_probe && entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Artifacts created so far.
    pub fn created(&self) -> u64 {
        self.stats.created.load(Ordering::SeqCst)
    }

    /// Artifacts released so far.
    pub fn released(&self) -> u64 {
        self.stats.released.load(Ordering::SeqCst)
    }

    /// Artifacts currently alive.
    pub fn outstanding(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }

    fn reserve(&self) -> ProbeArtifact {
        let name = format!("{PROBE_PREFIX}{}.img", uuid::Uuid::new_v4());
        self.adopt(self.dir.join(name))
    }
}

/// Scoped handle to one captured image. Deleted on drop.
#[derive(Debug)]
pub struct ProbeArtifact {
    path: PathBuf,
    stats: Arc<SpoolStats>,
}

impl ProbeArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProbeArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete probe artifact");
            }
        }
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(path = %self.path.display(), "probe artifact released");
    }
}
