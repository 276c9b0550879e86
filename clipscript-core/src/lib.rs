//! # clipscript core
//!
//! Layered configuration, error types, and the research API transcript
//! collector that feeds the fine-tuning workflow.

pub mod collector;
pub mod config;
pub mod error;

pub use collector::{CollectionSummary, Collector, VideoRecord, append_records};
pub use config::{ClipConfig, load_config};
pub use error::{ClipError, CollectorError, ConfigError, Result};
