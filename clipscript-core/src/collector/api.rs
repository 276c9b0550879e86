//! Wire formats for the research API token and video query endpoints.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::{AccessToken, VideoRecord, lenient};

/// Inclusive date range a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl QueryWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Serialize)]
pub struct VideoQueryRequest {
    pub query: QueryExpression,
    pub start_date: String,
    pub end_date: String,
    pub max_count: u32,
}

#[derive(Debug, Serialize)]
pub struct QueryExpression {
    pub and: Vec<QueryCondition>,
}

#[derive(Debug, Serialize)]
pub struct QueryCondition {
    pub operation: &'static str,
    pub field_name: &'static str,
    pub field_values: Vec<String>,
}

impl VideoQueryRequest {
    /// Exact match on `username`, optional `IN` on `region_code`.
    pub fn for_handle(
        handle: &str,
        region_codes: &[String],
        window: &QueryWindow,
        max_count: u32,
    ) -> Self {
        let mut and = vec![QueryCondition {
            operation: "EQ",
            field_name: "username",
            field_values: vec![handle.to_string()],
        }];
        if !region_codes.is_empty() {
            and.push(QueryCondition {
                operation: "IN",
                field_name: "region_code",
                field_values: region_codes.to_vec(),
            });
        }
        Self {
            query: QueryExpression { and },
            start_date: window.start.format("%Y%m%d").to_string(),
            end_date: window.end.format("%Y%m%d").to_string(),
            max_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct VideoQueryResponse {
    #[serde(default)]
    data: Option<VideoQueryData>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoQueryData {
    /// Kept untyped so each video is converted on its own.
    #[serde(default)]
    videos: Option<Vec<serde_json::Value>>,
    #[serde(default, deserialize_with = "lenient")]
    has_more: Option<bool>,
}

/// One page of query results.
#[derive(Debug, Default)]
pub struct VideoPage {
    pub videos: Vec<VideoRecord>,
    /// The API reports more results than fit on the page; they are not fetched.
    pub has_more: bool,
}

/// Parse a successful query response. Missing `data` or `data.videos`
/// yields an empty page. A list entry that is not an object is skipped
/// without affecting the rest of the page.
pub fn parse_video_page(body: &str) -> Result<VideoPage, serde_json::Error> {
    let response: VideoQueryResponse = serde_json::from_str(body)?;
    let data = response.data.unwrap_or_default();
    let videos = data
        .videos
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<VideoRecord>(value) {
            Ok(video) => Some(video),
            Err(e) => {
                warn!(index, error = %e, "Skipping unreadable video entry");
                None
            }
        })
        .collect();
    Ok(VideoPage {
        videos,
        has_more: data.has_more.unwrap_or(false),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Parse the client-credential token response; `None` when no access token
/// is present.
pub fn parse_token(body: &str) -> Result<Option<AccessToken>, serde_json::Error> {
    let response: TokenResponse = serde_json::from_str(body)?;
    Ok(response.access_token.map(|secret| {
        let mut token = AccessToken::new(secret);
        token.token_type = response.token_type;
        token.expires_in = response.expires_in;
        token.scope = response.scope;
        token
    }))
}

/// Render an error body for logs: pretty JSON when it parses, raw text otherwise.
pub fn describe_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|json| serde_json::to_string_pretty(&json))
        .unwrap_or_else(|_| body.trim().to_string())
}
