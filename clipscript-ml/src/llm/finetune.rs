//! QLoRA fine-tuning driver.
//!
//! Everything up to the training call happens here: dataset formatting, the
//! train/held-out split, and a serialized `TrainingPlan` in a per-run staging
//! directory. The SFT loop itself runs in the Python training worker, which
//! saves adapter weights and tokenizer to the configured output directory.

use crate::error::MlError;
use crate::llm::adapter::{AdapterArtifact, AdapterManifest, PeftLoraConfig};
use crate::llm::dataset_prep::{format_examples, load_scripts, train_eval_split, write_jsonl};
use crate::llm::quantize::BitsAndBytesConfig;
use crate::llm::template::ChatTemplate;
use crate::runtime::PythonRuntime;
use chrono::{DateTime, Utc};
use clipscript_core::config::{
    ClipConfig, IntervalStrategy, OptimizerKind, SchedulerKind, TrainingConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const TRAIN_WORKER: &str = include_str!("../../python/train_sft.py");

/// `transformers.TrainingArguments` keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerArguments {
    pub output_dir: PathBuf,
    pub eval_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub logging_steps: u32,
    pub eval_steps: u32,
    pub per_device_train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub num_train_epochs: u32,
    pub learning_rate: f64,
    pub optim: OptimizerKind,
    pub warmup_ratio: f64,
    pub bf16: bool,
    pub group_by_length: bool,
    pub lr_scheduler_type: SchedulerKind,
    pub report_to: String,
}

impl TrainerArguments {
    fn new(config: &TrainingConfig, output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            eval_strategy: config.eval_strategy,
            save_strategy: config.save_strategy,
            logging_steps: config.logging_steps,
            eval_steps: config.eval_steps,
            per_device_train_batch_size: config.batch_size,
            gradient_accumulation_steps: config.grad_accum,
            num_train_epochs: config.epochs,
            learning_rate: config.learning_rate,
            optim: config.optimizer,
            warmup_ratio: config.warmup_ratio,
            bf16: config.bf16,
            group_by_length: false,
            lr_scheduler_type: config.scheduler,
            report_to: "none".to_string(),
        }
    }
}

/// Everything the training worker needs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub base_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_token_env: Option<String>,
    pub bnb: BitsAndBytesConfig,
    pub lora: PeftLoraConfig,
    pub training_args: TrainerArguments,
    pub max_length: usize,
    pub train_file: PathBuf,
    pub eval_file: PathBuf,
    pub output_dir: PathBuf,
}

/// A staged run: formatted splits and plan written, training not started.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub plan: TrainingPlan,
    pub staging_dir: PathBuf,
    pub train_examples: usize,
    pub eval_examples: usize,
}

/// Metrics reported by the training worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    #[serde(default)]
    pub global_step: Option<u64>,
    #[serde(default)]
    pub train_loss: Option<f64>,
    #[serde(default)]
    pub eval_loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FineTuneOutcome {
    pub run: PreparedRun,
    pub metrics: TrainingMetrics,
    pub adapter: AdapterArtifact,
}

/// Configures and launches one supervised fine-tuning run.
pub struct FineTuneDriver {
    config: ClipConfig,
    runtime: PythonRuntime,
}

impl FineTuneDriver {
    pub fn new(config: ClipConfig, runtime: PythonRuntime) -> Result<Self, MlError> {
        config.lora.validate()?;
        config.dataset.validate()?;
        config.training.validate()?;
        Ok(Self { config, runtime })
    }

    /// Format the dataset, split it, and write the staging directory.
    pub fn prepare(&self) -> Result<PreparedRun, MlError> {
        let dataset = &self.config.dataset;
        let dataset_path = self.runtime.resolve(&dataset.path);
        info!(path = %dataset_path.display(), "Loading and formatting dataset");

        let scripts = load_scripts(&dataset_path, &dataset.text_field)?;
        let template = ChatTemplate::new(self.config.model.chat_template);
        let examples = format_examples(&scripts, &dataset.instruction, &template);
        let split = train_eval_split(examples, dataset.eval_fraction, dataset.seed)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let staging_dir = self
            .runtime
            .resolve(&self.config.training.staging_dir)
            .join(&run_id);
        std::fs::create_dir_all(&staging_dir)?;

        let train_file = staging_dir.join("train.jsonl");
        let eval_file = staging_dir.join("eval.jsonl");
        let train_examples = write_jsonl(&train_file, &split.train)?;
        let eval_examples = write_jsonl(&eval_file, &split.eval)?;

        let output_dir = self.runtime.resolve(&self.config.training.output_dir);
        let plan = TrainingPlan {
            run_id,
            created_at: Utc::now(),
            base_model: self.config.model.base_model.clone(),
            hf_token_env: self.config.model.hf_token_env.clone(),
            bnb: BitsAndBytesConfig::from(&self.config.quantization),
            lora: PeftLoraConfig::from(&self.config.lora),
            training_args: TrainerArguments::new(&self.config.training, output_dir.clone()),
            max_length: self.config.training.max_length,
            train_file,
            eval_file,
            output_dir,
        };
        write_plan(&staging_dir, &plan)?;

        info!(
            run_id = %plan.run_id,
            staging = %staging_dir.display(),
            train = train_examples,
            eval = eval_examples,
            "Prepared fine-tuning run"
        );

        Ok(PreparedRun {
            plan,
            staging_dir,
            train_examples,
            eval_examples,
        })
    }

    /// Prepare, train, and record the adapter manifest. Any failure is fatal.
    pub async fn run(&self) -> Result<FineTuneOutcome, MlError> {
        let run = self.prepare()?;

        info!(
            base_model = %run.plan.base_model,
            quantization = %run.plan.bnb,
            rank = run.plan.lora.r,
            "Starting QLoRA fine-tuning"
        );
        let timeout = self.config.training.timeout_secs.map(Duration::from_secs);
        let result = self
            .runtime
            .run_worker(TRAIN_WORKER, &serde_json::to_value(&run.plan)?, timeout)
            .await
            .map_err(|e| match e {
                MlError::Python(msg) => MlError::training(msg),
                other => other,
            })?;
        let metrics: TrainingMetrics = serde_json::from_value(result)?;

        let manifest = AdapterManifest {
            run_id: run.plan.run_id.clone(),
            base_model: run.plan.base_model.clone(),
            quantization: self.config.quantization.clone(),
            lora: self.config.lora.clone(),
            created_at: Utc::now(),
        };
        let adapter = AdapterArtifact::save_manifest(&run.plan.output_dir, &manifest)?;

        info!(
            output = %adapter.path().display(),
            train_loss = ?metrics.train_loss,
            eval_loss = ?metrics.eval_loss,
            "Adapter weights and tokenizer saved"
        );

        Ok(FineTuneOutcome {
            run,
            metrics,
            adapter,
        })
    }
}

fn write_plan(staging_dir: &Path, plan: &TrainingPlan) -> Result<(), MlError> {
    let content = serde_json::to_string_pretty(plan)?;
    std::fs::write(staging_dir.join("plan.json"), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipscript_core::config::PythonConfig;

    fn workspace_with_dataset(records: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        let lines: Vec<String> = (0..records)
            .map(|i| serde_json::json!({"tiktok_script": format!("script {i}")}).to_string())
            .collect();
        std::fs::write(
            dir.path().join("data/reddit_transcripts.json"),
            lines.join("\n"),
        )
        .unwrap();
        dir
    }

    fn driver(dir: &tempfile::TempDir, config: ClipConfig) -> FineTuneDriver {
        let python = PythonConfig {
            python_path: Some(PathBuf::from("/nonexistent/bin/python3")),
            venv_path: Some(dir.path().join("no-venv")),
        };
        FineTuneDriver::new(config, PythonRuntime::from_config(&python, dir.path().into())).unwrap()
    }

    #[test]
    fn test_trainer_arguments_wire_names() {
        let args = TrainerArguments::new(&TrainingConfig::default(), PathBuf::from("/out"));
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["per_device_train_batch_size"], 1);
        assert_eq!(json["gradient_accumulation_steps"], 8);
        assert_eq!(json["num_train_epochs"], 3);
        assert_eq!(json["optim"], "paged_adamw_8bit");
        assert_eq!(json["eval_strategy"], "steps");
        assert_eq!(json["save_strategy"], "epoch");
        assert_eq!(json["lr_scheduler_type"], "constant");
        assert_eq!(json["report_to"], "none");
    }

    #[test]
    fn test_prepare_writes_staging_dir() {
        let dir = workspace_with_dataset(20);
        let mut config = ClipConfig::default();
        config.dataset.seed = Some(1);
        let run = driver(&dir, config).prepare().unwrap();

        assert_eq!(run.train_examples, 18);
        assert_eq!(run.eval_examples, 2);
        assert!(run.staging_dir.starts_with(dir.path()));
        assert!(run.staging_dir.join("plan.json").is_file());

        let train = std::fs::read_to_string(&run.plan.train_file).unwrap();
        assert_eq!(train.lines().count(), 18);
        let first: serde_json::Value = serde_json::from_str(train.lines().next().unwrap()).unwrap();
        let text = first["text"].as_str().unwrap();
        assert!(text.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>"));
        assert!(text.contains("Generate a viral short-form video script"));

        let plan: TrainingPlan = serde_json::from_str(
            &std::fs::read_to_string(run.staging_dir.join("plan.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(plan.run_id, run.plan.run_id);
        assert_eq!(plan.output_dir, dir.path().join("llama_tiktok"));
        assert_eq!(plan.lora.r, 64);
        assert!(!plan.bnb.bnb_4bit_use_double_quant);
    }

    #[test]
    fn test_prepare_missing_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = driver(&dir, ClipConfig::default()).prepare().unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)));
        assert!(!dir.path().join(".clipscript/runs").exists());
    }

    #[test]
    fn test_failed_split_leaves_no_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.jsonl"), "{\"tiktok_script\": \"only\"}\n").unwrap();
        let mut config = ClipConfig::default();
        config.dataset.path = PathBuf::from("one.jsonl");

        assert!(driver(&dir, config).prepare().is_err());
        assert!(!dir.path().join(".clipscript/runs").exists());
    }

    #[test]
    fn test_new_rejects_invalid_training_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClipConfig::default();
        config.training.batch_size = 0;
        let result = FineTuneDriver::new(config, PythonRuntime::new(dir.path().into()));
        assert!(matches!(result, Err(MlError::Config(_))));
    }

    #[tokio::test]
    async fn test_worker_failure_is_fatal() {
        let dir = workspace_with_dataset(10);
        let err = driver(&dir, ClipConfig::default()).run().await.unwrap_err();
        assert!(matches!(err, MlError::Training(_)));
        assert!(!dir.path().join("llama_tiktok").exists());
    }
}
