//! Script generation from a news summary with the fine-tuned adapter.

use crate::error::MlError;
use crate::llm::adapter::AdapterArtifact;
use crate::llm::quantize::BitsAndBytesConfig;
use crate::llm::template::{ChatMessage, ChatTemplate, Role};
use crate::runtime::PythonRuntime;
use clipscript_core::config::ClipConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const GENERATE_WORKER: &str = include_str!("../../python/generate.py");

/// Input document for the generation worker.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationPayload {
    pub base_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_token_env: Option<String>,
    pub bnb: BitsAndBytesConfig,
    pub adapter_path: PathBuf,
    pub merge_adapter: bool,
    pub prompt: String,
    pub max_new_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    raw: String,
    #[serde(default)]
    new_tokens: Option<u64>,
}

/// Result of one generation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Fully rendered prompt sent to the model.
    pub prompt: String,
    /// Decoded output including special tokens.
    pub raw: String,
    /// The assistant turn, or the raw text behind the parse-error prefix.
    pub reply: String,
    pub new_tokens: Option<u64>,
}

pub struct GenerationDriver {
    config: ClipConfig,
    runtime: PythonRuntime,
    template: ChatTemplate,
}

impl GenerationDriver {
    pub fn new(config: ClipConfig, runtime: PythonRuntime) -> Result<Self, MlError> {
        config.model.validate()?;
        config.generation.validate()?;
        let template = ChatTemplate::new(config.model.chat_template);
        Ok(Self {
            config,
            runtime,
            template,
        })
    }

    /// System prompt followed by the summary as the user turn.
    pub fn messages(&self, summary: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, self.config.generation.system_prompt.as_str()),
            ChatMessage::new(Role::User, format!("News Summary:\n{summary}")),
        ]
    }

    pub fn build_prompt(&self, summary: &str) -> String {
        self.template.render(&self.messages(summary), true)
    }

    pub fn payload(&self, summary: &str) -> GenerationPayload {
        GenerationPayload {
            base_model: self.config.model.base_model.clone(),
            hf_token_env: self.config.model.hf_token_env.clone(),
            bnb: BitsAndBytesConfig::from(&self.config.quantization),
            adapter_path: self.runtime.resolve(&self.config.generation.adapter_path),
            merge_adapter: self.config.generation.merge_adapter,
            prompt: self.build_prompt(summary),
            max_new_tokens: self.config.generation.max_new_tokens,
        }
    }

    /// Generate a script for `summary` with greedy decoding.
    ///
    /// The adapter directory is checked before any model is loaded.
    pub async fn generate(&self, summary: &str) -> Result<GenerationOutput, MlError> {
        if summary.trim().is_empty() {
            return Err(MlError::generation("news summary is empty"));
        }

        let payload = self.payload(summary);
        let adapter = AdapterArtifact::open(&payload.adapter_path)?;
        adapter.ensure_compatible(&self.config.model.base_model, &self.config.quantization)?;

        info!(
            base_model = %payload.base_model,
            adapter = %adapter.path().display(),
            merge = payload.merge_adapter,
            "Loading base model and adapter"
        );
        let timeout = self.config.generation.timeout_secs.map(Duration::from_secs);
        let value = self
            .runtime
            .run_worker(GENERATE_WORKER, &serde_json::to_value(&payload)?, timeout)
            .await
            .map_err(|e| match e {
                MlError::Python(msg) => MlError::generation(msg),
                other => other,
            })?;
        let worker: WorkerReply = serde_json::from_value(value)?;
        debug!(new_tokens = ?worker.new_tokens, "Generation finished");

        let reply = self.template.extract_reply(&worker.raw);
        Ok(GenerationOutput {
            prompt: payload.prompt,
            raw: worker.raw,
            reply,
            new_tokens: worker.new_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::adapter::{ADAPTER_CONFIG_FILE, AdapterManifest};
    use clipscript_core::config::{ChatTemplateKind, PythonConfig, QuantizationConfig};

    fn runtime(dir: &tempfile::TempDir) -> PythonRuntime {
        let python = PythonConfig {
            python_path: Some(PathBuf::from("/nonexistent/bin/python3")),
            venv_path: Some(dir.path().join("no-venv")),
        };
        PythonRuntime::from_config(&python, dir.path().into())
    }

    fn driver(dir: &tempfile::TempDir, config: ClipConfig) -> GenerationDriver {
        GenerationDriver::new(config, runtime(dir)).unwrap()
    }

    #[test]
    fn test_new_rejects_zero_max_new_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClipConfig::default();
        config.generation.max_new_tokens = 0;
        let err = GenerationDriver::new(config, runtime(&dir)).err().unwrap();
        assert!(matches!(err, MlError::Config(_)));
        assert!(err.to_string().contains("generation.max_new_tokens"));
    }

    #[test]
    fn test_new_rejects_blank_base_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClipConfig::default();
        config.model.base_model = "   ".into();
        let err = GenerationDriver::new(config, runtime(&dir)).err().unwrap();
        assert!(matches!(err, MlError::Config(_)));
        assert!(err.to_string().contains("model.base_model"));
    }

    #[test]
    fn test_messages_shape() {
        let dir = tempfile::tempdir().unwrap();
        let messages = driver(&dir, ClipConfig::default()).messages("Rates rose again.");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("Gen Z"));
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "News Summary:\nRates rose again.");
    }

    #[test]
    fn test_prompt_ends_with_open_assistant_turn() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = driver(&dir, ClipConfig::default()).build_prompt("x");
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>system<|end_header_id|>"));
        assert!(prompt.contains("News Summary:\nx<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));

        let mut config = ClipConfig::default();
        config.model.chat_template = ChatTemplateKind::ChatMl;
        let prompt = driver(&dir, config).build_prompt("x");
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_payload_resolves_adapter_path() {
        let dir = tempfile::tempdir().unwrap();
        let payload = driver(&dir, ClipConfig::default()).payload("x");
        assert_eq!(payload.adapter_path, dir.path().join("llama_tiktok"));
        assert_eq!(payload.max_new_tokens, 385);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["bnb"]["bnb_4bit_quant_type"], "nf4");
        assert_eq!(json["hf_token_env"], "HF_TOKEN");
    }

    #[tokio::test]
    async fn test_empty_summary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = driver(&dir, ClipConfig::default())
            .generate("  \n")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Generation(_)));
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let err = driver(&dir, ClipConfig::default())
            .generate("news")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Adapter(_)));
    }

    #[tokio::test]
    async fn test_mismatched_adapter_refused() {
        let dir = tempfile::tempdir().unwrap();
        let adapter_dir = dir.path().join("llama_tiktok");
        std::fs::create_dir_all(&adapter_dir).unwrap();
        std::fs::write(adapter_dir.join(ADAPTER_CONFIG_FILE), "{}").unwrap();
        let mut quantization = QuantizationConfig::default();
        quantization.double_quant = true;
        AdapterArtifact::save_manifest(
            &adapter_dir,
            &AdapterManifest {
                run_id: "r".into(),
                base_model: "meta-llama/Llama-3.1-8B-Instruct".into(),
                quantization,
                lora: Default::default(),
                created_at: chrono::Utc::now(),
            },
        )
        .unwrap();

        let err = driver(&dir, ClipConfig::default())
            .generate("news")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Adapter(_)));
    }

    #[tokio::test]
    async fn test_worker_failure_surfaces_as_generation_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter_dir = dir.path().join("llama_tiktok");
        std::fs::create_dir_all(&adapter_dir).unwrap();
        std::fs::write(adapter_dir.join(ADAPTER_CONFIG_FILE), "{}").unwrap();

        let err = driver(&dir, ClipConfig::default())
            .generate("news")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Generation(_)));
    }
}
