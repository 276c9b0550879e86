//! LoRA adapter settings and the adapter artifact directory.
//!
//! The directory itself is written by `peft` and treated as opaque. Next to
//! it we keep a small manifest recording how the base model was loaded during
//! training, so generation can refuse a mismatched quantization.

use crate::error::MlError;
use chrono::{DateTime, Utc};
use clipscript_core::config::{LoraBias, LoraConfig, QuantizationConfig, TaskType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File `peft` writes into every adapter directory.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Our own record of the training run that produced the adapter.
pub const MANIFEST_FILE: &str = "clipscript-adapter.json";

/// `peft.LoraConfig` keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftLoraConfig {
    pub r: u32,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub bias: LoraBias,
    pub task_type: TaskType,
    pub target_modules: Vec<String>,
}

impl From<&LoraConfig> for PeftLoraConfig {
    fn from(config: &LoraConfig) -> Self {
        Self {
            r: config.rank,
            lora_alpha: config.alpha,
            lora_dropout: config.dropout,
            bias: config.bias,
            task_type: config.task_type,
            target_modules: config.target_modules.clone(),
        }
    }
}

/// Provenance stored alongside the adapter weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub run_id: String,
    pub base_model: String,
    pub quantization: QuantizationConfig,
    pub lora: LoraConfig,
    pub created_at: DateTime<Utc>,
}

/// A saved adapter directory.
#[derive(Debug, Clone)]
pub struct AdapterArtifact {
    path: PathBuf,
    manifest: Option<AdapterManifest>,
}

impl AdapterArtifact {
    /// Open an adapter directory written by a training run.
    pub fn open(path: &Path) -> Result<Self, MlError> {
        if !path.is_dir() {
            return Err(MlError::adapter(format!(
                "adapter directory not found: {}",
                path.display()
            )));
        }
        if !path.join(ADAPTER_CONFIG_FILE).is_file() {
            return Err(MlError::adapter(format!(
                "{} has no {ADAPTER_CONFIG_FILE}; not a saved adapter",
                path.display()
            )));
        }

        let manifest_path = path.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Some(serde_json::from_str(&content)?)
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// Record the manifest for a freshly saved adapter and reopen it.
    pub fn save_manifest(path: &Path, manifest: &AdapterManifest) -> Result<Self, MlError> {
        std::fs::create_dir_all(path)?;
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(path.join(MANIFEST_FILE), content)?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> Option<&AdapterManifest> {
        self.manifest.as_ref()
    }

    /// Fail when the adapter was trained against a different base model or
    /// quantization than the one about to be loaded. Adapters without a
    /// manifest are accepted as-is.
    pub fn ensure_compatible(
        &self,
        base_model: &str,
        quantization: &QuantizationConfig,
    ) -> Result<(), MlError> {
        let Some(manifest) = &self.manifest else {
            tracing::debug!(path = %self.path.display(), "Adapter has no manifest, skipping compatibility check");
            return Ok(());
        };

        if manifest.base_model != base_model {
            return Err(MlError::adapter(format!(
                "adapter was trained on '{}' but '{}' is configured",
                manifest.base_model, base_model
            )));
        }
        if &manifest.quantization != quantization {
            return Err(MlError::adapter(format!(
                "adapter was trained with quantization {} but {} is configured",
                super::quantize::BitsAndBytesConfig::from(&manifest.quantization),
                super::quantize::BitsAndBytesConfig::from(quantization),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> AdapterManifest {
        AdapterManifest {
            run_id: "run-1".into(),
            base_model: "meta-llama/Llama-3.1-8B-Instruct".into(),
            quantization: QuantizationConfig::default(),
            lora: LoraConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn fake_adapter_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ADAPTER_CONFIG_FILE), "{}").unwrap();
        dir
    }

    #[test]
    fn test_peft_wire_names() {
        let json = serde_json::to_value(PeftLoraConfig::from(&LoraConfig::default())).unwrap();
        assert_eq!(json["r"], 64);
        assert_eq!(json["lora_alpha"], 16.0);
        assert_eq!(json["bias"], "none");
        assert_eq!(json["task_type"], "causal_lm");
        assert_eq!(json["target_modules"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_open_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AdapterArtifact::open(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_open_dir_without_adapter_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = AdapterArtifact::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains(ADAPTER_CONFIG_FILE));
    }

    #[test]
    fn test_open_without_manifest_is_compatible_with_anything() {
        let dir = fake_adapter_dir();
        let adapter = AdapterArtifact::open(dir.path()).unwrap();
        assert!(adapter.manifest().is_none());
        let mut quant = QuantizationConfig::default();
        quant.double_quant = true;
        adapter.ensure_compatible("any/model", &quant).unwrap();
    }

    #[test]
    fn test_manifest_round_trip_and_mismatch() {
        let dir = fake_adapter_dir();
        let adapter = AdapterArtifact::save_manifest(dir.path(), &manifest()).unwrap();
        assert_eq!(adapter.manifest().unwrap().run_id, "run-1");

        adapter
            .ensure_compatible("meta-llama/Llama-3.1-8B-Instruct", &QuantizationConfig::default())
            .unwrap();

        let mut quant = QuantizationConfig::default();
        quant.double_quant = true;
        let err = adapter
            .ensure_compatible("meta-llama/Llama-3.1-8B-Instruct", &quant)
            .unwrap_err();
        assert!(err.to_string().contains("double_quant"));

        let err = adapter
            .ensure_compatible("other/model", &QuantizationConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("other/model"));
    }
}
