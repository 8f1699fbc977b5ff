//! TOML configuration and its resolved, clamped form.
//!
//! [`Config`] mirrors the file on disk. [`MemoryConfig::resolve`] validates
//! it and produces a [`ResolvedConfig`]: weights normalized, multipliers
//! and thresholds clamped, overlap kept below the chunk size. The resolved
//! form carries a fingerprint of the raw section so managers can be
//! rebuilt when the configuration changes.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bridge_memory_core::cache::CacheSettings;
use bridge_memory_core::models::Source;
use bridge_memory_core::paths::PathRules;
use bridge_memory_core::search::{
    HybridWeights, SearchParams, MAX_CANDIDATE_MULTIPLIER, MAX_RESULTS, MIN_CANDIDATE_MULTIPLIER,
};

/// Upper bound on retry attempts for embedding calls.
pub const MAX_EMBED_RETRIES: u32 = 5;
/// One week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
pub const MAX_BATCH_TIMEOUT_MINUTES: u64 = 24 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MemoryConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub extra_paths: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_fallback")]
    pub fallback: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            extra_paths: Vec::new(),
            provider: default_provider(),
            model: None,
            fallback: default_fallback(),
            url: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            chunking: ChunkingConfig::default(),
            sync: SyncConfig::default(),
            query: QueryConfig::default(),
            vector: VectorConfig::default(),
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

fn default_sources() -> Vec<String> {
    vec!["memory".to_string(), "sessions".to_string()]
}
fn default_provider() -> String {
    "none".to_string()
}
fn default_fallback() -> String {
    "none".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: default_chunk_tokens(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    80
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub on_session_start: bool,
    #[serde(default = "default_true")]
    pub on_search: bool,
    #[serde(default = "default_true")]
    pub watch: bool,
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,
    #[serde(default)]
    pub interval_minutes: u64,
    #[serde(default)]
    pub sessions: SessionSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_session_start: true,
            on_search: true,
            watch: true,
            watch_debounce_ms: default_debounce_ms(),
            interval_minutes: 0,
            sessions: SessionSyncConfig::default(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    1500
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SessionSyncConfig {
    #[serde(default = "default_delta_bytes")]
    pub delta_bytes: u64,
    #[serde(default = "default_delta_messages")]
    pub delta_messages: u64,
    #[serde(default)]
    pub retention_days: u64,
}

impl Default for SessionSyncConfig {
    fn default() -> Self {
        Self {
            delta_bytes: default_delta_bytes(),
            delta_messages: default_delta_messages(),
            retention_days: 0,
        }
    }
}

fn default_delta_bytes() -> u64 {
    100_000
}
fn default_delta_messages() -> u64 {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueryConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default)]
    pub hybrid: HybridConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            min_score: default_min_score(),
            hybrid: HybridConfig::default(),
        }
    }
}

fn default_max_results() -> usize {
    6
}
fn default_min_score() -> f64 {
    0.35
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_text_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    4
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct RemoteConfig {
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub wait: bool,
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_timeout_minutes")]
    pub timeout_minutes: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait: true,
            concurrency: default_batch_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_minutes: default_batch_timeout_minutes(),
        }
    }
}

fn default_batch_concurrency() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_batch_timeout_minutes() -> u64 {
    60
}

/// Embedding backends selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    None,
    Local,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<ProviderKind> {
        match value {
            "none" | "disabled" => Some(ProviderKind::None),
            "local" => Some(ProviderKind::Local),
            "openai" => Some(ProviderKind::OpenAi),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::None => "none",
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            ProviderKind::None => None,
            ProviderKind::Local => Some("all-minilm-l6-v2"),
            ProviderKind::OpenAi => Some("text-embedding-3-small"),
            ProviderKind::Ollama => Some("nomic-embed-text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub fallback: Option<ProviderKind>,
    pub model: Option<String>,
    pub url: Option<String>,
    pub dims: Option<usize>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl ProviderSettings {
    /// Model for `kind`: the configured one for the primary provider,
    /// the kind's default for a fallback.
    pub fn model_for(&self, kind: ProviderKind) -> Option<String> {
        if kind == self.kind {
            if let Some(model) = &self.model {
                return Some(model.clone());
            }
        }
        kind.default_model().map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkingSettings {
    pub tokens: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSettings {
    pub on_session_start: bool,
    pub on_search: bool,
    pub watch: bool,
    pub watch_debounce_ms: u64,
    pub interval_minutes: u64,
    pub delta_bytes: u64,
    pub delta_messages: u64,
    pub retention_days: u64,
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_minutes > 0).then(|| Duration::from_secs(self.interval_minutes.saturating_mul(60)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSettings {
    pub enabled: bool,
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
}

/// Validated configuration with every invariant applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    pub sources: Vec<Source>,
    pub extra_paths: Vec<String>,
    pub provider: ProviderSettings,
    pub chunking: ChunkingSettings,
    pub sync: SyncSettings,
    pub search: SearchParams,
    pub vector_enabled: bool,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    /// SHA-256 of the raw `[memory]` section.
    pub fingerprint: String,
}

impl ResolvedConfig {
    pub fn path_rules(&self) -> Result<PathRules> {
        Ok(PathRules::new(
            &self.extra_paths,
            self.sources.contains(&Source::Memory),
            self.sources.contains(&Source::Sessions),
        )?)
    }

    pub fn sessions_enabled(&self) -> bool {
        self.sources.contains(&Source::Sessions)
    }
}

impl MemoryConfig {
    /// SHA-256 over the serialized section.
    pub fn fingerprint(&self) -> Result<String> {
        let encoded = serde_json::to_string(self).context("Failed to encode memory config")?;
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Validate and clamp into a [`ResolvedConfig`].
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut sources = Vec::new();
        for name in &self.sources {
            match Source::parse(name) {
                Some(s) if !sources.contains(&s) => sources.push(s),
                Some(_) => {}
                None => bail!(
                    "Unknown memory source: '{}'. Must be memory or sessions.",
                    name
                ),
            }
        }
        if sources.is_empty() {
            bail!("memory.sources must name at least one source");
        }

        let kind = ProviderKind::parse(&self.provider).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown embedding provider: '{}'. Must be none, local, openai, or ollama.",
                self.provider
            )
        })?;
        let fallback = match ProviderKind::parse(&self.fallback) {
            Some(ProviderKind::None) => None,
            Some(k) if k == kind => None,
            Some(k) => Some(k),
            None => bail!(
                "Unknown fallback provider: '{}'. Must be none, local, openai, or ollama.",
                self.fallback
            ),
        };

        if self.chunking.tokens == 0 {
            bail!("memory.chunking.tokens must be > 0");
        }
        let overlap = self.chunking.overlap.min(self.chunking.tokens - 1);

        // Validates extra paths as a side effect.
        PathRules::new(&self.extra_paths, true, true)
            .with_context(|| "Invalid memory.extra_paths")?;

        let min_score = if self.query.min_score.is_finite() {
            self.query.min_score.clamp(0.0, 1.0)
        } else {
            default_min_score()
        };

        Ok(ResolvedConfig {
            search: SearchParams {
                max_results: self.query.max_results.clamp(1, MAX_RESULTS),
                min_score,
                hybrid_enabled: self.query.hybrid.enabled,
                weights: HybridWeights::normalized(
                    self.query.hybrid.vector_weight,
                    self.query.hybrid.text_weight,
                ),
                candidate_multiplier: self
                    .query
                    .hybrid
                    .candidate_multiplier
                    .clamp(MIN_CANDIDATE_MULTIPLIER, MAX_CANDIDATE_MULTIPLIER),
                sources: sources.clone(),
            },
            sources,
            extra_paths: self.extra_paths.clone(),
            provider: ProviderSettings {
                kind,
                fallback,
                model: self.model.clone(),
                url: self.url.clone(),
                dims: self.dims,
                batch_size: self.batch_size.max(1),
                max_retries: self.max_retries.min(MAX_EMBED_RETRIES),
                timeout_secs: self.timeout_secs.max(1),
            },
            chunking: ChunkingSettings {
                tokens: self.chunking.tokens,
                overlap,
            },
            sync: SyncSettings {
                on_session_start: self.sync.on_session_start,
                on_search: self.sync.on_search,
                watch: self.sync.watch,
                watch_debounce_ms: self.sync.watch_debounce_ms,
                interval_minutes: self.sync.interval_minutes.min(MAX_INTERVAL_MINUTES),
                delta_bytes: self.sync.sessions.delta_bytes,
                delta_messages: self.sync.sessions.delta_messages,
                retention_days: self.sync.sessions.retention_days,
            },
            vector_enabled: self.vector.enabled,
            cache: CacheSettings {
                enabled: self.cache.enabled,
                max_entries: self.cache.max_entries,
            },
            batch: BatchSettings {
                enabled: self.remote.batch.enabled,
                wait: self.remote.batch.wait,
                concurrency: self.remote.batch.concurrency.max(1),
                poll_interval_ms: self.remote.batch.poll_interval_ms.max(10),
                timeout_minutes: self.remote.batch.timeout_minutes.clamp(1, MAX_BATCH_TIMEOUT_MINUTES),
            },
            fingerprint: self.fingerprint()?,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.memory.resolve()?;

    Ok(config)
}
