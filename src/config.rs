use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which embedding backend to construct at engine startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Remote,
    Local,
}

/// How task-type prefixes are applied to texts before embedding.
///
/// `Auto` resolves from the model id once at provider construction; the
/// resolved strategy is a closed enum, never string matching at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixChoice {
    Auto,
    None,
    Nomic,
    E5Instruct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Remote: model name sent in the request body.
    /// Local: `<data>/models/<model>.onnx` next to `tokenizer.json`.
    pub model: String,
    pub api_key: Option<String>,
    pub endpoint: String,
    /// Overrides the provider-declared dimension. Leave unset to let the
    /// provider probe it (local: at load; remote: first request).
    pub dimension: Option<usize>,
    pub prefix: PrefixChoice,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Remote,
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            dimension: None,
            prefix: PrefixChoice::Auto,
            connect_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bounded L1 capacity (entries). The durable tier is unbounded.
    pub max_in_memory: usize,
    pub flush_interval_ms: u64,
    /// Entries drained per batched upsert.
    pub batch_size: usize,
    /// Buffer length past which a flush is scheduled immediately.
    pub max_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_in_memory: 10_000,
            flush_interval_ms: 1_000,
            batch_size: 100,
            max_buffer: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Quiet period after the last inventory event before a container's
    /// index job fires. Bursty open/close traffic coalesces into one job.
    pub debounce_ms: u64,
    pub graph_degree: usize,
    pub construction_depth: usize,
    pub overflow_factor: f32,
    pub alpha: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            graph_degree: 16,
            construction_depth: 100,
            overflow_factor: 1.2,
            alpha: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Only "sqlite" is recognized today.
    pub provider: String,
    /// Overrides the database directory; defaults to `data_dir`.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Directory holding the SQLite files and index artifacts.
    pub fn db_dir(&self) -> &Path {
        self.storage.path.as_deref().unwrap_or(&self.data_dir)
    }

    /// `<data>/models/` — local ONNX graph + tokenizer live here.
    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lootlens")
}

/// Read `lootlens.json` from `dir`. Missing or unparseable files fall back
/// to defaults; unknown keys are ignored.
pub fn load_config(dir: &Path) -> Config {
    let primary = dir.join("lootlens.json");

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.cache.max_in_memory, 10_000);
        assert_eq!(c.cache.batch_size, 100);
        assert_eq!(c.cache.max_buffer, 1_000);
        assert_eq!(c.index.graph_degree, 16);
        assert_eq!(c.index.construction_depth, 100);
        assert!((c.index.alpha - 1.2).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_config_keeps_section_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"index": {"debounce_ms": 250}}"#).unwrap();
        assert_eq!(parsed.index.debounce_ms, 250);
        assert_eq!(parsed.index.graph_degree, 16);
        assert_eq!(parsed.cache.max_in_memory, 10_000);
    }

    #[test]
    fn storage_path_overrides_db_dir() {
        let mut c = Config::default();
        assert_eq!(c.db_dir(), c.data_dir.as_path());
        c.storage.path = Some(PathBuf::from("/tmp/elsewhere"));
        assert_eq!(c.db_dir(), Path::new("/tmp/elsewhere"));
    }
}
