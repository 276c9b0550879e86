//! QLoRA fine-tuning and generation: quantization, adapters, chat templates.

pub mod adapter;
pub mod dataset_prep;
pub mod finetune;
pub mod generate;
pub mod quantize;
pub mod template;

pub use adapter::{AdapterArtifact, AdapterManifest};
pub use dataset_prep::{DatasetSplit, TrainingExample};
pub use finetune::{FineTuneDriver, FineTuneOutcome, PreparedRun, TrainingPlan};
pub use generate::{GenerationDriver, GenerationOutput};
pub use quantize::BitsAndBytesConfig;
pub use template::{ChatMessage, ChatTemplate, Role};
