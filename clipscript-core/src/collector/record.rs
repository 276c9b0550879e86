//! Shapes crossing the research API boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Video identifier. The API sends large integers, some proxies stringify them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoId {
    Number(u64),
    Text(String),
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoId::Number(n) => write!(f, "{n}"),
            VideoId::Text(s) => f.write_str(s),
        }
    }
}

/// One video as returned by the query endpoint. Every field may be absent,
/// and a field whose value has the wrong type is read as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<VideoId>,
    #[serde(default, deserialize_with = "lenient")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub video_description: Option<String>,
    /// Older API versions used this name for the caption.
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub like_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub view_count: Option<u64>,
    /// Platform-side speech-to-text transcript.
    #[serde(default, deserialize_with = "lenient")]
    pub voice_to_text: Option<String>,
}

/// Reads a field as `None` when its value does not fit `T`, so one odd
/// value (a `"1.2K"` count, a negative number) does not reject the record.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

impl VideoRecord {
    /// Caption text, preferring `video_description` unless it is empty.
    pub fn caption(&self) -> Option<&str> {
        self.video_description
            .as_deref()
            .filter(|d| !d.is_empty())
            .or(self.description.as_deref())
    }

    /// Cells in `CSV_COLUMNS` order; absent values become empty cells.
    pub fn csv_cells(&self) -> [String; 6] {
        [
            self.id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
            self.username.clone().unwrap_or_default(),
            self.caption().unwrap_or_default().to_string(),
            self.like_count.map(|n| n.to_string()).unwrap_or_default(),
            self.view_count.map(|n| n.to_string()).unwrap_or_default(),
            self.voice_to_text.clone().unwrap_or_default(),
        ]
    }
}

/// Short-lived bearer credential. Held in memory for one run only.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_type: None,
            expires_in: None,
            scope: None,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}
