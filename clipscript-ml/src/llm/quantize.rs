//! 4-bit base model quantization settings.

use clipscript_core::config::{ComputeDtype, QuantType, QuantizationConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `BitsAndBytesConfig` keyword arguments as the workers pass them to
/// `transformers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitsAndBytesConfig {
    pub load_in_4bit: bool,
    pub bnb_4bit_quant_type: QuantType,
    pub bnb_4bit_use_double_quant: bool,
    /// A `torch` dtype attribute name.
    pub bnb_4bit_compute_dtype: ComputeDtype,
}

impl From<&QuantizationConfig> for BitsAndBytesConfig {
    fn from(config: &QuantizationConfig) -> Self {
        Self {
            load_in_4bit: config.load_in_4bit,
            bnb_4bit_quant_type: config.quant_type,
            bnb_4bit_use_double_quant: config.double_quant,
            bnb_4bit_compute_dtype: config.compute_dtype,
        }
    }
}

impl fmt::Display for BitsAndBytesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = if self.load_in_4bit { "4bit" } else { "full" };
        let quant = match self.bnb_4bit_quant_type {
            QuantType::Nf4 => "nf4",
            QuantType::Fp4 => "fp4",
        };
        let dtype = match self.bnb_4bit_compute_dtype {
            ComputeDtype::Bfloat16 => "bfloat16",
            ComputeDtype::Float16 => "float16",
            ComputeDtype::Float32 => "float32",
        };
        write!(f, "{bits}/{quant}/compute={dtype}")?;
        if self.bnb_4bit_use_double_quant {
            write!(f, "/double_quant")?;
        }
        Ok(())
    }
}
