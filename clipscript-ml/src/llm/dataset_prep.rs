//! Chat dataset preparation for fine-tuning.
//!
//! Reads raw scripts from a JSON array or JSON Lines file, wraps each one in
//! the chat template behind a constant instruction, and splits the result
//! into train and held-out partitions.

use crate::error::MlError;
use crate::llm::template::{ChatMessage, ChatTemplate, Role};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// One formatted training example, serialized as `{"text": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub text: String,
}

/// Train and held-out partitions.
#[derive(Debug, Clone)]
pub struct DatasetSplit<T> {
    pub train: Vec<T>,
    pub eval: Vec<T>,
}

/// Read the `text_field` string of every record in `path`.
///
/// A file whose first non-whitespace byte is `[` is read as one JSON array;
/// anything else as JSON Lines. A record without the field, or with a
/// non-string value, fails the whole load.
pub fn load_scripts(path: &Path, text_field: &str) -> Result<Vec<String>, MlError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MlError::dataset(format!("failed to read {}: {e}", path.display()))
    })?;

    let records: Vec<serde_json::Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .map_err(|e| MlError::dataset(format!("{}: invalid JSON array: {e}", path.display())))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    MlError::dataset(format!("{}:{}: invalid JSON: {e}", path.display(), i + 1))
                })
            })
            .collect::<Result<_, _>>()?
    };

    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            record
                .get(text_field)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    MlError::dataset(format!(
                        "record {i} in {} has no string field '{text_field}'",
                        path.display()
                    ))
                })
        })
        .collect()
}

/// Wrap every script as `user: instruction` / `assistant: script`.
pub fn format_examples(
    scripts: &[String],
    instruction: &str,
    template: &ChatTemplate,
) -> Vec<TrainingExample> {
    scripts
        .iter()
        .map(|script| TrainingExample {
            text: template.render(
                &[
                    ChatMessage::new(Role::User, instruction),
                    ChatMessage::new(Role::Assistant, script.as_str()),
                ],
                false,
            ),
        })
        .collect()
}

/// Shuffle and split off `ceil(n * eval_fraction)` items for evaluation.
///
/// Both partitions must end up non-empty. A `seed` makes the split
/// reproducible.
pub fn train_eval_split<T>(
    mut items: Vec<T>,
    eval_fraction: f64,
    seed: Option<u64>,
) -> Result<DatasetSplit<T>, MlError> {
    if !(eval_fraction > 0.0 && eval_fraction < 1.0) {
        return Err(MlError::dataset(format!(
            "eval fraction {eval_fraction} must be strictly between 0 and 1"
        )));
    }

    let total = items.len();
    let eval_len = (total as f64 * eval_fraction).ceil() as usize;
    let train_len = total.saturating_sub(eval_len);
    if eval_len == 0 || train_len == 0 {
        return Err(MlError::dataset(format!(
            "{total} records cannot be split with eval fraction {eval_fraction}"
        )));
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    items.shuffle(&mut rng);
    let eval = items.split_off(train_len);

    Ok(DatasetSplit { train: items, eval })
}

/// Export examples to a JSON Lines file. Returns the number written.
pub fn write_jsonl(path: &Path, examples: &[TrainingExample]) -> Result<usize, MlError> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for example in examples {
        serde_json::to_writer(&mut file, example)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(examples.len())
}
