use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level settings, deserialized from the JSON settings file.
///
/// See `settings.template.json` for a complete example. All sections carry
/// serde defaults so a minimal file with only the API entries is valid.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path the settings were loaded from. Not part of the file itself.
    #[serde(skip)]
    pub config_path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TokenizerConfig {
    #[serde(default = "default_tokenizer_path")]
    pub config_path: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            config_path: default_tokenizer_path(),
        }
    }
}

fn default_tokenizer_path() -> String {
    "tokenizer.json".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub nof_max_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub nof_min_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_percentage: f32,
    #[serde(default)]
    pub semantic: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            nof_max_tokens: default_max_tokens(),
            nof_min_tokens: default_min_tokens(),
            overlap_percentage: default_overlap(),
            semantic: false,
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_min_tokens() -> usize {
    50
}
fn default_overlap() -> f32 {
    0.1
}

/// One external API provider entry (embedding or generation).
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_url: String,
    /// Bearer key; `${VAR}` expands from the environment at access time.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Query-side template with exactly one `{}` placeholder, or empty.
    #[serde(default)]
    pub query_format: String,
    /// Document-side template with exactly one `{}` placeholder, or empty.
    #[serde(default)]
    pub document_format: String,
    /// Field name the provider expects for the max-token limit
    /// (e.g. `max_tokens` or `max_completion_tokens`).
    #[serde(default = "default_max_tokens_name")]
    pub max_tokens_name: String,
    #[serde(default = "default_true")]
    pub temperature_support: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub context_length: usize,
    #[serde(default)]
    pub pricing_tpm: PricingConfig,
    #[serde(default)]
    pub fim: FimConfig,
}

fn default_max_tokens_name() -> String {
    "max_tokens".to_string()
}
fn default_true() -> bool {
    true
}

/// Price per million tokens.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct PricingConfig {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cached_input: f64,
}

/// FIM sub-config. A non-empty `prefix_name` means the provider has a
/// native fill-in-the-middle endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FimConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub prefix_name: String,
    #[serde(default)]
    pub suffix_name: String,
    #[serde(default)]
    pub stop_tokens: Vec<String>,
}

/// Fraction of input tokens assumed served from the provider's prompt cache
/// when blending input prices.
const CACHE_HIT_RATIO: f64 = 0.05;

impl ApiConfig {
    /// Bearer key with `${VAR}` environment expansion applied.
    pub fn resolved_api_key(&self) -> String {
        expand_env(&self.api_key)
    }

    /// Effective combined price per million tokens (input blend + output).
    pub fn combined_price(&self) -> f64 {
        self.effective_input_price() + self.pricing_tpm.output
    }

    /// Approximate dollar cost of `tokens` input tokens.
    pub fn input_tokens_price(&self, tokens: usize) -> f64 {
        (tokens as f64 / 1_000_000.0) * self.effective_input_price()
    }

    /// Approximate dollar cost of `tokens` output tokens.
    pub fn output_tokens_price(&self, tokens: usize) -> f64 {
        (tokens as f64 / 1_000_000.0) * self.pricing_tpm.output
    }

    fn effective_input_price(&self) -> f64 {
        if self.pricing_tpm.cached_input > 0.0 {
            CACHE_HIT_RATIO * self.pricing_tpm.cached_input
                + (1.0 - CACHE_HIT_RATIO) * self.pricing_tpm.input
        } else {
            self.pricing_tpm.input
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    #[serde(default)]
    pub current_api: String,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub prepend_label_format: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            apis: Vec::new(),
            current_api: String::new(),
            timeout_ms: default_embedding_timeout(),
            batch_size: default_batch_size(),
            top_k: default_top_k(),
            prepend_label_format: String::new(),
        }
    }
}

fn default_embedding_timeout() -> u64 {
    10_000
}
fn default_batch_size() -> usize {
    4
}
fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    #[serde(default)]
    pub current_api: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_full_sources")]
    pub max_full_sources: usize,
    #[serde(default = "default_max_related")]
    pub max_related_per_source: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    #[serde(default = "default_gen_max_tokens")]
    pub default_max_tokens: usize,
    #[serde(default)]
    pub prepend_label_format: String,
    #[serde(default)]
    pub excerpt: ExcerptConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            apis: Vec::new(),
            current_api: String::new(),
            timeout_ms: default_generation_timeout(),
            max_full_sources: default_max_full_sources(),
            max_related_per_source: default_max_related(),
            max_chunks: default_max_chunks(),
            default_temperature: default_temperature(),
            default_max_tokens: default_gen_max_tokens(),
            prepend_label_format: String::new(),
            excerpt: ExcerptConfig::default(),
        }
    }
}

fn default_generation_timeout() -> u64 {
    20_000
}
fn default_max_full_sources() -> usize {
    2
}
fn default_max_related() -> usize {
    3
}
fn default_max_chunks() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.5
}
fn default_gen_max_tokens() -> usize {
    2048
}

/// Excerpt extraction policy for sources too large to inject whole.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExcerptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_excerpt_min")]
    pub min_chunks: usize,
    #[serde(default = "default_excerpt_max")]
    pub max_chunks: usize,
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f32,
}

impl Default for ExcerptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chunks: default_excerpt_min(),
            max_chunks: default_excerpt_max(),
            threshold_ratio: default_threshold_ratio(),
        }
    }
}

fn default_excerpt_min() -> usize {
    3
}
fn default_excerpt_max() -> usize {
    9
}
fn default_threshold_ratio() -> f32 {
    0.6
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_index_path")]
    pub index_path: String,
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    /// `"cosine"` (inner product over normalized vectors) or `"l2"`.
    #[serde(default = "default_metric")]
    pub distance_metric: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            index_path: default_index_path(),
            vector_dim: default_vector_dim(),
            max_elements: default_max_elements(),
            distance_metric: default_metric(),
        }
    }
}

fn default_sqlite_path() -> String {
    "db.sqlite".to_string()
}
fn default_index_path() -> String {
    "index".to_string()
}
fn default_vector_dim() -> usize {
    768
}
fn default_max_elements() -> usize {
    100_000
}
fn default_metric() -> String {
    "cosine".to_string()
}

/// One configured source: a directory walk, a single file, or a URL.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Directory {
        path: String,
        #[serde(default = "default_true")]
        recursive: bool,
        /// Extension allow-list; empty falls back to
        /// `source.default_extensions`.
        #[serde(default)]
        extensions: Vec<String>,
        /// Glob-style exclude patterns, merged with `source.global_exclude`.
        #[serde(default)]
        exclude: Vec<String>,
    },
    File {
        path: String,
    },
    Url {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_url_timeout")]
        timeout_ms: u64,
    },
}

fn default_url_timeout() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub global_exclude: Vec<String>,
    #[serde(default = "default_extensions")]
    pub default_extensions: Vec<String>,
    #[serde(default)]
    pub paths: Vec<SourceDescriptor>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project_title: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            encoding: default_encoding(),
            global_exclude: Vec::new(),
            default_extensions: default_extensions(),
            paths: Vec::new(),
            project_id: String::new(),
            project_title: String::new(),
        }
    }
}

fn default_max_file_size_mb() -> u64 {
    10
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_extensions() -> Vec<String> {
    vec![".txt".to_string(), ".md".to_string()]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_file")]
    pub logging_file: String,
    #[serde(default = "default_diagnostics_file")]
    pub diagnostics_file: String,
    #[serde(default = "default_true")]
    pub log_to_file: bool,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logging_file: default_logging_file(),
            diagnostics_file: default_diagnostics_file(),
            log_to_file: true,
            log_to_console: true,
        }
    }
}

fn default_logging_file() -> String {
    "output.log".to_string()
}
fn default_diagnostics_file() -> String {
    "diagnostics.log".to_string()
}

impl Settings {
    /// Load settings from a JSON file, validating the pieces the engine
    /// depends on.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let mut settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        settings.config_path = path.to_path_buf();
        settings.validate()?;
        Ok(settings)
    }

    /// Replace the settings content from an already-parsed JSON value,
    /// keeping the current file path. Used by `POST /api/setup`.
    pub fn replace_from_json(&mut self, config: serde_json::Value) -> Result<()> {
        for key in ["embedding", "generation", "database", "chunking"] {
            if config.get(key).is_none() {
                anyhow::bail!("Missing {} field", key);
            }
        }
        let mut settings: Settings = serde_json::from_value(config)?;
        settings.config_path = self.config_path.clone();
        settings.validate()?;
        *self = settings;
        Ok(())
    }

    /// Write the settings back to their file, pretty-printed.
    pub fn save(&self) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, body)
            .with_context(|| format!("Failed to write settings: {}", self.config_path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.nof_max_tokens == 0 {
            anyhow::bail!("chunking.nof_max_tokens must be > 0");
        }
        if self.chunking.nof_min_tokens > self.chunking.nof_max_tokens {
            anyhow::bail!("chunking.nof_min_tokens must be <= nof_max_tokens");
        }
        if !(0.0..1.0).contains(&self.chunking.overlap_percentage) {
            anyhow::bail!("chunking.overlap_percentage must be in [0.0, 1.0)");
        }
        if self.database.vector_dim == 0 {
            anyhow::bail!("database.vector_dim must be > 0");
        }
        match self.database.distance_metric.as_str() {
            "cosine" | "l2" => {}
            other => anyhow::bail!(
                "Unknown distance metric: '{}'. Must be cosine or l2.",
                other
            ),
        }
        Ok(())
    }

    /// Current embedding API entry. Falls back to the first enabled entry
    /// when `current_api` names nothing.
    pub fn embedding_current_api(&self) -> Result<ApiConfig> {
        current_api(&self.embedding.apis, &self.embedding.current_api)
            .context("No embedding API configured")
    }

    /// Current generation API entry.
    pub fn generation_current_api(&self) -> Result<ApiConfig> {
        current_api(&self.generation.apis, &self.generation.current_api)
            .context("No generation API configured")
    }

    /// Resolve a generation API by id, falling back to the current one for
    /// unknown ids (the `targetapi` request field contract).
    pub fn generation_api_or_current(&self, id: Option<&str>) -> Result<ApiConfig> {
        if let Some(id) = id {
            if let Some(api) = self.generation.apis.iter().find(|a| a.id == id) {
                return Ok(api.clone());
            }
        }
        self.generation_current_api()
    }

    /// Generate and persist `source.project_id` / `source.project_title`
    /// when missing. The title defaults to the cwd basename.
    pub fn hydrate_project_identity(&mut self) -> Result<()> {
        let mut changed = false;
        if self.source.project_id.is_empty() {
            self.source.project_id = uuid::Uuid::new_v4().to_string();
            changed = true;
        }
        if self.source.project_title.is_empty() {
            self.source.project_title = std::env::current_dir()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_default();
            changed = true;
        }
        if changed && self.config_path.exists() {
            self.save()?;
        }
        Ok(())
    }
}

fn current_api(apis: &[ApiConfig], current: &str) -> Option<ApiConfig> {
    apis.iter()
        .find(|a| a.id == current)
        .or_else(|| apis.iter().find(|a| a.enabled))
        .cloned()
}

/// Expand `${VAR}` references from the environment. Unset variables expand
/// to the empty string.
pub fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Locate the settings file: the explicit path if it exists, then
/// `settings.json` in `.`, `..`, `../..`, `$HOME/.config/embedder/`,
/// and `/etc/embedder/`.
pub fn find_config_file(explicit: &Path) -> Result<PathBuf> {
    if explicit.exists() {
        return Ok(explicit.to_path_buf());
    }
    let filename = explicit
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "settings.json".to_string());

    let mut candidates = vec![
        PathBuf::from(&filename),
        PathBuf::from("..").join(&filename),
        PathBuf::from("../..").join(&filename),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/embedder").join(&filename));
    }
    candidates.push(PathBuf::from("/etc/embedder").join(&filename));

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }
    anyhow::bail!(
        "Settings file not found. Searched: {}",
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
