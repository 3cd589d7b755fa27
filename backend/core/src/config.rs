use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable that overrides [`RagConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "LOCALRAG_DATA_DIR";

/// Knowledge-base value meaning "no knowledge base selected".
pub const NONE_SENTINEL: &str = "none";
/// Placeholder shown when no knowledge base exists yet.
pub const NO_KB_SENTINEL: &str = "No available knowledge base";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Base directory for knowledge bases and models
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/knowledge_bases`
    pub knowledge_base_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/models`
    pub models_dir: Option<PathBuf>,
    pub none_sentinel: String,
    pub no_kb_sentinel: String,
    /// How many source documents the retriever reads per query
    pub max_context_files: usize,
    /// Unload an idle model after this many seconds. `None` keeps it loaded.
    pub idle_unload_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            knowledge_base_dir: None,
            models_dir: None,
            none_sentinel: NONE_SENTINEL.to_string(),
            no_kb_sentinel: NO_KB_SENTINEL.to_string(),
            max_context_files: 3,
            idle_unload_secs: None,
            connect_timeout_secs: 60,
            read_timeout_secs: 300,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("localrag")
}

impl RagConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn knowledge_base_dir(&self) -> PathBuf {
        self.knowledge_base_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("knowledge_bases"))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn idle_unload(&self) -> Option<Duration> {
        self.idle_unload_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// True when `knowledge_base` is one of the "skip retrieval" sentinels.
    ///
    /// Exact, case-sensitive comparison.
    pub fn is_no_retrieval(&self, knowledge_base: &str) -> bool {
        knowledge_base == self.none_sentinel || knowledge_base == self.no_kb_sentinel
    }
}
