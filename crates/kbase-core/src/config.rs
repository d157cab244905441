use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{unit_interval, CoverageConfig};

pub struct Config {
    figment: Figment,
    base_dir: PathBuf,
    env_name: String,
}

impl Config {
    /// Load `config.toml` + `config.<env>.toml` + `APP_*` from the working directory.
    pub fn load() -> Result<Self> { Self::load_from(Path::new(".")) }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Ok(Self { figment: Self::figment_for(dir, &env_name), base_dir: dir.to_path_buf(), env_name })
    }

    fn figment_for(dir: &Path, env_name: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::Configuration(format!("Failed to get '{}': {}", key, e)))
    }

    /// Extract, path-resolve and validate the full settings tree.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings: Settings = self.figment.extract()?;
        for store in [&mut settings.primary, &mut settings.fallback] {
            store.uri = resolve_uri(&self.base_dir, &store.uri);
        }
        settings.cache.uri = resolve_uri(&self.base_dir, &settings.cache.uri);
        if let Some(dir) = settings.embedding.model_dir.take() {
            settings.embedding.model_dir = Some(resolve_with_base(&self.base_dir, dir.to_string_lossy()));
        }
        settings.validate()?;
        tracing::debug!(env = %self.env_name, primary = %settings.primary.uri, fallback = %settings.fallback.uri, "configuration loaded");
        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub primary: StoreSettings,
    pub fallback: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub cache: CacheSettings,
    pub search: SearchSettings,
    pub coverage: CoverageConfig,
    pub health: HealthSettings,
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary: StoreSettings::default(),
            fallback: StoreSettings { uri: "data/fallback".into(), ..StoreSettings::default() },
            embedding: EmbeddingSettings::default(),
            cache: CacheSettings::default(),
            search: SearchSettings::default(),
            coverage: CoverageConfig::default(),
            health: HealthSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.coverage.validate()?;
        if !unit_interval(self.search.sparse_weight) {
            return Err(Error::Configuration(format!("search.sparse_weight = {} is outside [0, 1]", self.search.sparse_weight)));
        }
        if self.search.overfetch_factor == 0 {
            return Err(Error::Configuration("search.overfetch_factor must be at least 1".into()));
        }
        if self.sync.page_size == 0 {
            return Err(Error::Configuration("sync.page_size must be at least 1".into()));
        }
        if self.embedding.max_attempts == 0 || self.embedding.max_batch_size == 0 {
            return Err(Error::Configuration("embedding.max_attempts and embedding.max_batch_size must be at least 1".into()));
        }
        if self.embedding.dim == 0 {
            return Err(Error::Configuration("embedding.dim must be at least 1".into()));
        }
        if self.primary.uri == self.fallback.uri && self.primary.collection == self.fallback.collection {
            return Err(Error::Configuration("primary and fallback must not point at the same collection".into()));
        }
        Ok(())
    }
}

/// Endpoint and credentials of one vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub uri: String,
    pub collection: String,
    pub api_key: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self { Self { uri: "data/primary".into(), collection: "chunks".into(), api_key: None } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Deterministic hashed bag-of-words vectors.
    #[default]
    Hash,
    /// Local BGE-M3 transformer.
    BgeM3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: ProviderKind,
    /// Overrides the provider's own identity in the cache namespace.
    pub model_id: Option<String>,
    pub dim: usize,
    pub model_dir: Option<PathBuf>,
    pub max_batch_size: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hash,
            model_id: None,
            dim: 1024,
            model_dir: None,
            max_batch_size: 32,
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl EmbeddingSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Bounded exponential backoff for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { EmbeddingSettings::default().retry_policy() }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub uri: String,
    pub table: String,
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self { Self { uri: "data/cache".into(), table: "embedding_cache".into(), max_bytes: 256 * 1024 * 1024 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub sparse_weight: f32,
    pub overfetch_factor: usize,
    pub rerank: bool,
    pub io_timeout_ms: u64,
    pub default_top_k: usize,
}

impl Default for SearchSettings {
    fn default() -> Self { Self { sparse_weight: 0.3, overfetch_factor: 3, rerank: false, io_timeout_ms: 10_000, default_top_k: 10 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub timeout_ms: u64,
    pub ttl_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self { Self { timeout_ms: 2_000, ttl_ms: 5_000 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub page_size: usize,
    pub deadline_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self { Self { page_size: 500, deadline_ms: 600_000 } }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Like [`resolve_with_base`] but leaves scheme URIs (`s3://`, `db://`) alone.
pub fn resolve_uri(base: &Path, uri: &str) -> String {
    if uri.contains("://") { return uri.to_string(); }
    resolve_with_base(base, uri).to_string_lossy().into_owned()
}
