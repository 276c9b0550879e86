//! # clipscript-ml
//!
//! Drivers for the model side of clipscript: the accelerator environment
//! check, QLoRA fine-tuning of the base model on collected scripts, and
//! script generation with the resulting adapter. Numerical work runs in the
//! Python ML stack through [`PythonRuntime`].

pub mod device;
pub mod error;
pub mod llm;
pub mod runtime;

pub use device::{EnvironmentReport, check_environment};
pub use error::MlError;
pub use llm::{FineTuneDriver, GenerationDriver};
pub use runtime::PythonRuntime;
