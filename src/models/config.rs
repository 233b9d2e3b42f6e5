//! Configuration models for polyeval.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use crate::backend::{BackendKey, BackendKind};
use crate::interface::ModelFamily;
use crate::models::ResultType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model under evaluation and where it runs
    pub model: ModelConfig,

    /// Hosted API settings (used when `model.backend = "api"`)
    #[serde(default)]
    pub api: ApiConfig,

    /// Local inference server settings (used by `huggingface` and `vllm`)
    #[serde(default)]
    pub local: LocalConfig,

    /// Batch sizing and admission control
    #[serde(default)]
    pub batching: BatchingConfig,

    /// What to evaluate and where results go
    pub run: RunConfig,
}

/// Model identity.
///
/// K_i: The tuple (id, device, backend, parallelism) identifies one backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model id (e.g., "Qwen/Qwen3-8B", "gpt-5")
    pub id: String,

    /// Backend kind: api | huggingface | vllm
    pub backend: BackendKind,

    /// Device string (e.g., "cuda", "cuda:0,1", "cpu")
    #[serde(default = "default_device")]
    pub device: String,

    /// Parallelism degree (shards / tensor-parallel size)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Override the prompt family detected from the model id
    #[serde(default)]
    pub family: Option<ModelFamily>,
}

fn default_device() -> String {
    "cuda".to_string()
}

fn default_parallelism() -> usize {
    1
}

/// OpenAI-compatible API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key (can also be set via the env var named by `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Concurrent requests; doubles as the batch-size hint for API backends
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Input price per 1M tokens (USD)
    #[serde(default)]
    pub input_price_per_1m: f64,

    /// Output price per 1M tokens (USD)
    #[serde(default)]
    pub output_price_per_1m: f64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    16
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
            input_price_per_1m: 0.0,
            output_price_per_1m: 0.0,
        }
    }
}

/// Local inference server configuration.
///
/// I^B: Server start-up time depends on model size and disk speed → bounded wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Host the launched server binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// First port handed out to launched servers
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// How long to wait for a launched server to become healthy
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Per-request timeout against a launched server
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Program launched for `huggingface` backends
    #[serde(default = "default_tgi_launcher")]
    pub tgi_launcher: String,

    /// Program launched for `vllm` backends
    #[serde(default = "default_vllm_launcher")]
    pub vllm_launcher: String,

    /// Extra arguments appended to the launcher command line
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Use the server already answering here instead of launching one
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    8100
}

fn default_startup_timeout() -> u64 {
    900
}

fn default_request_timeout() -> u64 {
    600
}

fn default_tgi_launcher() -> String {
    "text-generation-launcher".to_string()
}

fn default_vllm_launcher() -> String {
    "vllm".to_string()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            startup_timeout_secs: default_startup_timeout(),
            request_timeout_secs: default_request_timeout(),
            tgi_launcher: default_tgi_launcher(),
            vllm_launcher: default_vllm_launcher(),
            extra_args: Vec::new(),
            base_url: None,
        }
    }
}

/// Batch sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Fixed batch size; discovered from the backend when omitted
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// First trial batch size
    #[serde(default = "default_discovery_start")]
    pub discovery_start: usize,

    /// Largest batch size discovery will try
    #[serde(default = "default_discovery_max")]
    pub discovery_max: usize,

    /// Retries per task after a capacity error shrinks the batch
    #[serde(default = "default_capacity_retries")]
    pub capacity_retries: u32,

    /// Persist results after this many batches
    #[serde(default = "default_flush_every")]
    pub flush_every_batches: usize,
}

fn default_discovery_start() -> usize {
    1
}

fn default_discovery_max() -> usize {
    64
}

fn default_capacity_retries() -> u32 {
    2
}

fn default_flush_every() -> usize {
    1
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            discovery_start: default_discovery_start(),
            discovery_max: default_discovery_max(),
            capacity_retries: default_capacity_retries(),
            flush_every_batches: default_flush_every(),
        }
    }
}

/// Run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Which result type this run produces
    pub result_type: ResultType,

    /// First language code
    pub lang1: String,

    /// Second language code
    pub lang2: String,

    /// Directory holding `{lang}_{correct|incorrect}.jsonl`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory for result files
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,

    /// Keep only the first N entries of every dataset file
    #[serde(default)]
    pub sample_limit: Option<usize>,

    /// Per-task timeout; unbounded when omitted
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// Generation budget for chain-of-thought judgments
    #[serde(default = "default_cot_tokens")]
    pub cot_max_new_tokens: u32,

    /// Generation budget for free-form responses
    #[serde(default = "default_response_tokens")]
    pub response_max_new_tokens: u32,

    /// Optional keyword-assist file checked against entry ids
    #[serde(default)]
    pub keywords_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("judge/datasets")
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("judge/result")
}

fn default_cot_tokens() -> u32 {
    2048
}

fn default_response_tokens() -> u32 {
    512
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.lang1 == self.run.lang2 {
            return Err(ConfigError::Invalid(format!(
                "lang1 and lang2 must differ (both are '{}')",
                self.run.lang1
            )));
        }
        if self.model.parallelism == 0 {
            return Err(ConfigError::Invalid("model.parallelism must be at least 1".into()));
        }
        if self.batching.batch_size == Some(0) {
            return Err(ConfigError::Invalid("batching.batch_size must be at least 1".into()));
        }
        if self.batching.flush_every_batches == 0 {
            return Err(ConfigError::Invalid(
                "batching.flush_every_batches must be at least 1".into(),
            ));
        }
        self.model_family()?;
        Ok(())
    }

    /// Resolve the prompt family for the configured model.
    pub fn model_family(&self) -> Result<ModelFamily, ConfigError> {
        if let Some(family) = self.model.family {
            return Ok(family);
        }
        ModelFamily::detect(&self.model.id, self.model.backend)
            .ok_or_else(|| ConfigError::UnknownModelFamily(self.model.id.clone()))
    }

    /// Identity of the backend instance this run needs.
    pub fn backend_key(&self) -> BackendKey {
        BackendKey::new(
            &self.model.id,
            &self.model.device,
            self.model.backend,
            self.model.parallelism,
        )
    }

    /// Resolve API key from config or environment.
    ///
    /// B_i(api key available) → Result
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.api.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.api.api_key_env.clone(),
        })
    }
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error, inconsistent values
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or api.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Cannot determine prompt family for model '{0}'; set model.family")]
    UnknownModelFamily(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[model]
id = "Qwen/Qwen3-8B"
backend = "vllm"

[run]
result_type = "preference_direct"
lang1 = "fr"
lang2 = "en"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.model.device, "cuda");
        assert_eq!(config.model.parallelism, 1);
        assert_eq!(config.batching.batch_size, None);
        assert_eq!(config.batching.flush_every_batches, 1);
        assert_eq!(config.run.data_dir, PathBuf::from("judge/datasets"));
        assert_eq!(config.local.tgi_launcher, "text-generation-launcher");
        assert_eq!(config.model_family().unwrap(), ModelFamily::Qwen3);
    }

    #[test]
    fn test_identical_languages_rejected() {
        let text = MINIMAL.replace("lang1 = \"fr\"", "lang1 = \"en\"");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let text = format!("{MINIMAL}\n[batching]\nbatch_size = 0\n");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_local_family_needs_override() {
        let text = MINIMAL.replace("Qwen/Qwen3-8B", "acme/mystery-7b");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModelFamily(_)));

        let text = text.replace("backend = \"vllm\"", "backend = \"vllm\"\nfamily = \"llama3\"");
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.model_family().unwrap(), ModelFamily::Llama3);
    }

    #[test]
    fn test_backend_key_from_config() {
        let text = MINIMAL.replace(
            "backend = \"vllm\"",
            "backend = \"vllm\"\ndevice = \"cuda:0,1\"\nparallelism = 2",
        );
        let config = Config::from_toml_str(&text).unwrap();
        let key = config.backend_key();
        assert_eq!(key.model_id, "Qwen/Qwen3-8B");
        assert_eq!(key.device, "cuda:0,1");
        assert_eq!(key.kind, BackendKind::Vllm);
        assert_eq!(key.parallelism, 2);
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholders() {
        let expanded = expand_env_vars("key-${POLYEVAL_SURELY_UNSET_VAR}");
        assert_eq!(expanded, "key-${POLYEVAL_SURELY_UNSET_VAR}");
    }
}
