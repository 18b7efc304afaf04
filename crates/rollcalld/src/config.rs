use anyhow::{bail, Context, Result};
use rollcall_core::{RecognitionPolicy, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration.
///
/// Defaults, then an optional TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables (highest precedence).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory where probe images are staged during extraction.
    pub spool_dir: PathBuf,
    /// Length of every embedding vector (gallery and probes).
    pub embedding_dim: usize,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Embedding extractor program; receives the image path as its last argument.
    pub extractor_program: String,
    /// Arguments placed before the image path. `ROLLCALL_EXTRACTOR_ARGS` is
    /// split on whitespace; set this list in the config file when an argument
    /// contains spaces.
    pub extractor_args: Vec<String>,
    /// Timeout in seconds for one extraction call.
    pub extract_timeout_secs: u64,
    /// Ledger write attempts when a write conflicts.
    pub upsert_attempts: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let spool_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("rollcall/spool"))
            .unwrap_or_else(|_| std::env::temp_dir().join("rollcall-spool"));

        Self {
            db_path: data_dir.join("rollcall.db"),
            spool_dir,
            embedding_dim: 512,
            similarity_threshold: DEFAULT_THRESHOLD,
            extractor_program: "rollcall-embed".to_string(),
            extractor_args: Vec::new(),
            extract_timeout_secs: 10,
            upsert_attempts: 3,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and `ROLLCALL_*` environment variables.
    pub fn load() -> Result<Self> {
        let base = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_EXTRACTOR") {
            self.extractor_program = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_EXTRACTOR_ARGS") {
            // No quoting: arguments with spaces must come from the config file.
            self.extractor_args = split_args(&v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_BUS") {
            match v.as_str() {
                "system" => self.bus = BusKind::System,
                "session" => self.bus = BusKind::Session,
                other => tracing::warn!(value = other, "ignoring unknown ROLLCALL_BUS"),
            }
        }
        self.embedding_dim = env_usize("ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.similarity_threshold =
            env_f32("ROLLCALL_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.extract_timeout_secs = env_u64("ROLLCALL_EXTRACT_TIMEOUT_SECS", self.extract_timeout_secs);
        self.upsert_attempts = env_usize("ROLLCALL_UPSERT_ATTEMPTS", self.upsert_attempts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            bail!("embedding_dim must be positive");
        }
        if !self.similarity_threshold.is_finite() || !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold {} must be within [-1, 1]",
                self.similarity_threshold
            );
        }
        if self.extract_timeout_secs == 0 {
            bail!("extract_timeout_secs must be positive");
        }
        if self.upsert_attempts == 0 {
            bail!("upsert_attempts must be at least 1");
        }
        if self.extractor_program.trim().is_empty() {
            bail!("extractor_program is empty");
        }
        Ok(())
    }

    /// Recognition tunables derived from this config.
    pub fn policy(&self) -> RecognitionPolicy {
        RecognitionPolicy {
            default_threshold: self.similarity_threshold,
            extraction_timeout: Duration::from_secs(self.extract_timeout_secs),
            upsert_attempts: self.upsert_attempts,
            ..RecognitionPolicy::default()
        }
    }
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
