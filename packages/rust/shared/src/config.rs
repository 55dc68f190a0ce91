//! Application configuration for bbqscan.
//!
//! User config lives at `~/.bbqscan/bbqscan.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{BbqScanError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "bbqscan.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bbqscan";

// ---------------------------------------------------------------------------
// Config structs (matching bbqscan.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenAI-compatible capability settings.
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Fixed-wait retry for transient capability failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Two-stage classification settings.
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// PDF page rendering.
    #[serde(default)]
    pub rendering: RenderingConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Run root holding the leaflet PDFs and page-group directories.
    #[serde(default = "default_pdf_dir")]
    pub pdf_dir: String,

    /// Number of re-validation passes per image.
    #[serde(default = "default_validations")]
    pub validations: u32,

    /// Whether to run the two-stage classifier.
    #[serde(default = "default_true")]
    pub categorize: bool,

    /// File name of the result table inside each page-group and the run root.
    #[serde(default = "default_results_file")]
    pub results_file: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            pdf_dir: default_pdf_dir(),
            validations: default_validations(),
            categorize: true,
            results_file: default_results_file(),
        }
    }
}

fn default_pdf_dir() -> String {
    "pdf-files".into()
}
fn default_validations() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_results_file() -> String {
    "results.csv".into()
}

/// `[openai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for extraction, validation and classification.
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL, without the trailing endpoint path.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Sampling temperature for classification calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.5
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed wait between attempts, in seconds.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wait_secs: default_wait_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_wait_secs() -> u64 {
    60
}

/// What to discard when a coarse category batch returns the wrong number of results.
///
/// Applies to stage 1 only. A mismatched grill batch always loses just its own rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Reject every stage-1 batch; no row reaches the grill stage.
    #[default]
    Stage,
    /// Reject only the offending batch.
    Batch,
}

/// `[classification]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Product names per classification request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on classification requests in flight.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    #[serde(default)]
    pub mismatch_policy: MismatchPolicy,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            mismatch_policy: MismatchPolicy::default(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_max_concurrent_batches() -> usize {
    4
}

/// `[rendering]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderingConfig {
    /// Executable that turns PDF pages into PNG images.
    #[serde(default = "default_render_command")]
    pub command: String,

    /// Output resolution; 288 dpi is four times the PDF point grid.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            command: default_render_command(),
            dpi: default_dpi(),
        }
    }
}

fn default_render_command() -> String {
    "pdftoppm".into()
}
fn default_dpi() -> u32 {
    288
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Bounded fixed-wait retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            wait: Duration::ZERO,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            wait: Duration::from_secs(config.wait_secs),
        }
    }
}

/// Classifier runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierSettings {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub mismatch_policy: MismatchPolicy,
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for ClassifierSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.classification.batch_size.max(1),
            max_concurrent_batches: config.classification.max_concurrent_batches.max(1),
            mismatch_policy: config.classification.mismatch_policy,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Runtime configuration for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Run root directory.
    pub root: PathBuf,
    /// Re-validation passes per image.
    pub validations: u32,
    /// Run the two-stage classifier.
    pub categorize: bool,
    /// Recompute page-groups that already have a stored result.
    pub overwrite: bool,
    /// Result table file name.
    pub results_file: String,
    /// Retry settings for extraction and validation calls.
    pub retry: RetryPolicy,
    pub classifier: ClassifierSettings,
    /// Seed for tie-breaks between equally voted values; `None` draws from the OS.
    pub seed: Option<u64>,
    /// Collection date stamped on every row; `None` means today.
    pub collected_on: Option<NaiveDate>,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            root: PathBuf::from(&config.defaults.pdf_dir),
            validations: config.defaults.validations,
            categorize: config.defaults.categorize,
            overwrite: false,
            results_file: config.defaults.results_file.clone(),
            retry: RetryPolicy::from(&config.retry),
            classifier: ClassifierSettings::from(config),
            seed: None,
            collected_on: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.bbqscan/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| BbqScanError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.bbqscan/bbqscan.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BbqScanError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| BbqScanError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BbqScanError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| BbqScanError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BbqScanError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the API key from the env var named in `[openai].api_key_env`.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openai.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(BbqScanError::config(format!(
            "API key not found. Set the {var_name} environment variable \
             or run with --use-test-client"
        ))),
    }
}
