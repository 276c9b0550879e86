//! Configuration system for clipscript.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> explicit config file -> environment.
//! Configuration is loaded from `~/.config/clipscript/config.toml` and/or
//! `clipscript.toml` in the workspace directory.

use chrono::NaiveDate;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Workspace-level config file name.
pub const CONFIG_FILE_NAME: &str = "clipscript.toml";

/// Prefix for environment overrides (`CLIPSCRIPT_COLLECTOR__CLIENT_SECRET`, ...).
pub const ENV_PREFIX: &str = "CLIPSCRIPT_";

const REDACTED: &str = "********";

/// The research API rejects windows longer than this.
pub const MAX_WINDOW_DAYS: i64 = 30;

/// The research API caps a single page at this many videos.
pub const MAX_RESULTS_PER_QUERY: u32 = 100;

/// Top-level configuration for every clipscript driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipConfig {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub python: PythonConfig,
    #[serde(default)]
    pub model: ModelConfig,
    /// Shared by training and generation; the adapter only applies correctly
    /// when both sides load the base model the same way.
    #[serde(default)]
    pub quantization: QuantizationConfig,
    #[serde(default)]
    pub lora: LoraConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Research API transcript collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// OAuth client key.
    pub client_key: String,
    /// OAuth client secret. Prefer `CLIPSCRIPT_COLLECTOR__CLIENT_SECRET`.
    pub client_secret: String,
    /// Client-credential token endpoint (trailing slash required).
    pub token_url: String,
    /// Video query endpoint, without the `fields` query parameter.
    pub query_url: String,
    /// Fields requested for each video.
    pub fields: Vec<String>,
    /// Account handles to query, in order.
    pub handles: Vec<String>,
    /// Region codes for the `IN region_code` clause. Empty disables the clause.
    pub region_codes: Vec<String>,
    /// First day of the query window (inclusive).
    pub start_date: NaiveDate,
    /// Last day of the query window (inclusive).
    pub end_date: NaiveDate,
    /// Maximum videos per handle (one page, at most 100).
    pub max_count: u32,
    /// Fixed pause after every handle, successful or not.
    pub delay_secs: u64,
    /// CSV file rows are appended to.
    pub output: PathBuf,
    /// Per-request timeout; unset means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            client_key: String::new(),
            client_secret: String::new(),
            token_url: "https://open.tiktokapis.com/v2/oauth/token/".to_string(),
            query_url: "https://open.tiktokapis.com/v2/research/video/query/".to_string(),
            fields: [
                "id",
                "username",
                "video_description",
                "like_count",
                "view_count",
                "voice_to_text",
            ]
            .iter()
            .map(|f| f.to_string())
            .collect(),
            handles: Vec::new(),
            region_codes: vec!["US".to_string()],
            start_date: NaiveDate::from_ymd_opt(2025, 11, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2025, 11, 9).unwrap_or_default(),
            max_count: MAX_RESULTS_PER_QUERY,
            delay_secs: 2,
            output: PathBuf::from("tiktok_user_videos_and_transcripts.csv"),
            request_timeout_secs: None,
        }
    }
}

/// Python interpreter used for the ML workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Path to the Python executable (auto-detected if not set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_path: Option<PathBuf>,
    /// Virtual environment to run from (auto-detected if not set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<PathBuf>,
}

/// Base model shared by training and generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hugging Face model id or local path.
    pub base_model: String,
    /// Environment variable holding a Hugging Face read token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_token_env: Option<String>,
    /// Conversation markup the model family expects.
    pub chat_template: ChatTemplateKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
            hf_token_env: Some("HF_TOKEN".to_string()),
            chat_template: ChatTemplateKind::Llama3,
        }
    }
}

/// Chat markup conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplateKind {
    /// `<|start_header_id|>role<|end_header_id|>` ... `<|eot_id|>`
    #[default]
    Llama3,
    /// `<|im_start|>role` ... `<|im_end|>`
    ChatMl,
}

/// 4-bit storage formats understood by bitsandbytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    #[default]
    Nf4,
    Fp4,
}

/// Precision of intermediate activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDtype {
    #[default]
    Bfloat16,
    Float16,
    Float32,
}

/// Base model quantization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub quant_type: QuantType,
    pub double_quant: bool,
    pub compute_dtype: ComputeDtype,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::Nf4,
            double_quant: false,
            compute_dtype: ComputeDtype::Bfloat16,
        }
    }
}

/// Which bias terms the adapter trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    #[default]
    None,
    All,
    LoraOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    CausalLm,
}

/// Low-rank adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub rank: u32,
    pub alpha: f32,
    pub dropout: f32,
    pub bias: LoraBias,
    pub task_type: TaskType,
    /// Linear layers the adapter wraps.
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 64,
            alpha: 16.0,
            dropout: 0.1,
            bias: LoraBias::None,
            task_type: TaskType::CausalLm,
            target_modules: [
                "q_proj",
                "k_proj",
                "v_proj",
                "o_proj",
                "gate_proj",
                "up_proj",
                "down_proj",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        }
    }
}

/// Training dataset input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// JSON array or JSON Lines file.
    pub path: PathBuf,
    /// Field holding the script text in each record.
    pub text_field: String,
    /// User turn paired with every script.
    pub instruction: String,
    /// Fraction of records held out for evaluation.
    pub eval_fraction: f64,
    /// Shuffle seed; unset shuffles differently on every run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/reddit_transcripts.json"),
            text_field: "tiktok_script".to_string(),
            instruction:
                "Generate a viral short-form video script in the Gen Z voice for a TikTok video."
                    .to_string(),
            eval_fraction: 0.1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalStrategy {
    No,
    #[default]
    Steps,
    Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Constant,
    Linear,
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    #[serde(rename = "paged_adamw_8bit")]
    PagedAdamw8bit,
    AdamwTorch,
}

/// Supervised fine-tuning run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Where adapter weights and the tokenizer are saved.
    pub output_dir: PathBuf,
    /// Where per-run staging directories (formatted splits, plan) are created.
    pub staging_dir: PathBuf,
    pub batch_size: u32,
    pub grad_accum: u32,
    pub epochs: u32,
    pub learning_rate: f64,
    pub max_length: usize,
    pub warmup_ratio: f64,
    pub logging_steps: u32,
    pub eval_steps: u32,
    pub eval_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub scheduler: SchedulerKind,
    pub optimizer: OptimizerKind,
    pub bf16: bool,
    /// Kill the training worker after this long; unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./llama_tiktok"),
            staging_dir: PathBuf::from(".clipscript/runs"),
            batch_size: 1,
            grad_accum: 8,
            epochs: 3,
            learning_rate: 2e-4,
            max_length: 512,
            warmup_ratio: 0.03,
            logging_steps: 5,
            eval_steps: 10,
            eval_strategy: IntervalStrategy::Steps,
            save_strategy: IntervalStrategy::Epoch,
            scheduler: SchedulerKind::Constant,
            optimizer: OptimizerKind::PagedAdamw8bit,
            bf16: true,
            timeout_secs: None,
        }
    }
}

/// Single-shot generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Adapter directory produced by training.
    pub adapter_path: PathBuf,
    /// Merge the adapter into the base weights before decoding.
    pub merge_adapter: bool,
    pub system_prompt: String,
    /// Upper bound on generated tokens (about two minutes of speech).
    pub max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            adapter_path: PathBuf::from("./llama_tiktok"),
            merge_adapter: true,
            system_prompt: "You are a Gen Z digital analyst and content creator. Your primary task is \
                to receive a formal news summary and translate its core message into a short, highly \
                engaging TikTok script. Use Gen Z slang (e.g., 'no cap', 'it's giving', 'period'), \
                relevant emojis, and a conversational, punchy tone. The output must be concise and \
                self-contained."
                .to_string(),
            max_new_tokens: 385,
            timeout_secs: None,
        }
    }
}

impl ClipConfig {
    /// Check every section for values the drivers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.collector.validate()?;
        self.lora.validate()?;
        self.dataset.validate()?;
        self.training.validate()?;
        self.generation.validate()?;
        self.model.validate()
    }

    /// A copy safe to print: credentials are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.collector.client_secret.is_empty() {
            config.collector.client_secret = REDACTED.to_string();
        }
        config
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_count == 0 || self.max_count > MAX_RESULTS_PER_QUERY {
            return Err(ConfigError::invalid(
                "collector.max_count",
                format!("must be between 1 and {MAX_RESULTS_PER_QUERY}"),
            ));
        }
        if self.end_date < self.start_date {
            return Err(ConfigError::invalid(
                "collector.end_date",
                format!(
                    "{} is before start_date {}",
                    self.end_date, self.start_date
                ),
            ));
        }
        let span = (self.end_date - self.start_date).num_days();
        if span > MAX_WINDOW_DAYS {
            return Err(ConfigError::invalid(
                "collector.end_date",
                format!("window spans {span} days, the API allows at most {MAX_WINDOW_DAYS}"),
            ));
        }
        if self.fields.is_empty() {
            return Err(ConfigError::invalid("collector.fields", "must not be empty"));
        }
        Ok(())
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_model.trim().is_empty() {
            return Err(ConfigError::invalid("model.base_model", "must not be empty"));
        }
        Ok(())
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens == 0 {
            return Err(ConfigError::invalid(
                "generation.max_new_tokens",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl LoraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rank == 0 {
            return Err(ConfigError::invalid("lora.rank", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::invalid("lora.dropout", "must be in [0, 1)"));
        }
        if self.target_modules.is_empty() {
            return Err(ConfigError::invalid(
                "lora.target_modules",
                "must name at least one layer",
            ));
        }
        Ok(())
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.eval_fraction > 0.0 && self.eval_fraction < 1.0) {
            return Err(ConfigError::invalid(
                "dataset.eval_fraction",
                "must be strictly between 0 and 1",
            ));
        }
        if self.text_field.trim().is_empty() {
            return Err(ConfigError::invalid("dataset.text_field", "must not be empty"));
        }
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("training.batch_size", self.batch_size),
            ("training.grad_accum", self.grad_accum),
            ("training.epochs", self.epochs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid("training.learning_rate", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.warmup_ratio) {
            return Err(ConfigError::invalid("training.warmup_ratio", "must be in [0, 1)"));
        }
        if self.eval_strategy == IntervalStrategy::Steps && self.eval_steps == 0 {
            return Err(ConfigError::invalid(
                "training.eval_steps",
                "must be at least 1 when eval_strategy is 'steps'",
            ));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `CLIPSCRIPT_`)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`clipscript.toml`)
/// 4. User config (`~/.config/clipscript/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<ClipConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ClipConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "clipscript", "clipscript") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(CONFIG_FILE_NAME);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // CLIPSCRIPT_COLLECTOR__HANDLES, CLIPSCRIPT_TRAINING__EPOCHS, ...
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

/// Write the default configuration to `<workspace>/clipscript.toml`.
///
/// Returns `None` when the file already exists.
pub fn init_config(workspace: &Path) -> Result<Option<PathBuf>, crate::error::ClipError> {
    let path = workspace.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Ok(None);
    }
    let toml_str = toml::to_string_pretty(&ClipConfig::default()).map_err(|e| {
        ConfigError::invalid("defaults", format!("failed to serialize: {e}"))
    })?;
    std::fs::write(&path, toml_str)?;
    Ok(Some(path))
}
