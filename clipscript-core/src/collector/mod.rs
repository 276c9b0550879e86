//! Research API transcript collector.
//!
//! Authenticates once with client credentials, queries one page of videos per
//! configured account handle over a fixed date window, and appends the results
//! to a CSV file. A failed query for one handle is logged and treated as zero
//! results so the rest of the batch still runs. Handles are throttled with a
//! fixed sleep; there is no backoff and no pagination.

pub mod api;
pub mod csv_sink;
pub mod record;

pub use api::{QueryWindow, VideoPage, VideoQueryRequest};
pub use csv_sink::{CSV_COLUMNS, append_records, csv_escape};
pub use record::{AccessToken, VideoId, VideoRecord};

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::{ClipError, CollectorError};

/// Outcome of one collector run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub handles_queried: usize,
    pub handles_failed: usize,
    pub records_written: usize,
}

/// Sequential client for the token and video query endpoints.
pub struct Collector {
    config: CollectorConfig,
    client: reqwest::Client,
}

impl Collector {
    /// Validate the collector settings and build the HTTP client.
    pub fn new(config: CollectorConfig) -> Result<Self, ClipError> {
        config.validate()?;
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().map_err(CollectorError::Http)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The configured query window.
    pub fn window(&self) -> QueryWindow {
        QueryWindow::new(self.config.start_date, self.config.end_date)
    }

    /// Exchange the client key and secret for a bearer token.
    ///
    /// Any non-success status is fatal; status and body are logged first.
    pub async fn authenticate(&self) -> Result<AccessToken, CollectorError> {
        let params = [
            ("client_key", self.config.client_key.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        debug!(url = %self.config.token_url, "Requesting access token");
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!(status = %status, body = %body, "Error getting token");
            return Err(CollectorError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let token = api::parse_token(&body)
            .map_err(|e| CollectorError::MalformedResponse {
                endpoint: self.config.token_url.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| CollectorError::MalformedResponse {
                endpoint: self.config.token_url.clone(),
                message: "no access_token in response".to_string(),
            })?;

        info!(expires_in = ?token.expires_in, "Access token obtained");
        Ok(token)
    }

    /// Query one page of videos for `handle`.
    ///
    /// Failures never propagate: they are logged and yield an empty list.
    pub async fn query_videos(
        &self,
        token: &AccessToken,
        handle: &str,
        window: &QueryWindow,
    ) -> Vec<VideoRecord> {
        match self.try_query_videos(token, handle, window).await {
            Ok(videos) => videos,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Video query failed, treating as zero results");
                Vec::new()
            }
        }
    }

    /// Query one page of videos for `handle`, surfacing failures.
    pub async fn try_query_videos(
        &self,
        token: &AccessToken,
        handle: &str,
        window: &QueryWindow,
    ) -> Result<Vec<VideoRecord>, CollectorError> {
        let request = VideoQueryRequest::for_handle(
            handle,
            &self.config.region_codes,
            window,
            self.config.max_count,
        );
        let fields = self.config.fields.join(",");

        let response = self
            .client
            .post(&self.config.query_url)
            .query(&[("fields", fields.as_str())])
            .bearer_auth(token.secret())
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(CollectorError::Query {
                handle: handle.to_string(),
                status: status.as_u16(),
                body: api::describe_body(&body),
            });
        }

        let page = api::parse_video_page(&body).map_err(|e| CollectorError::MalformedResponse {
            endpoint: self.config.query_url.clone(),
            message: e.to_string(),
        })?;

        info!(handle = %handle, count = page.videos.len(), "Retrieved videos");
        if page.has_more {
            debug!(handle = %handle, "More results available beyond the first page");
        }
        Ok(page.videos)
    }

    /// Authenticate once, then query and append for every configured handle.
    ///
    /// Only authentication and output-file failures abort the run.
    pub async fn run(&self) -> Result<CollectionSummary, ClipError> {
        let token = self.authenticate().await?;
        let window = self.window();
        let delay = Duration::from_secs(self.config.delay_secs);
        let mut summary = CollectionSummary::default();

        for handle in &self.config.handles {
            summary.handles_queried += 1;

            let videos = match self.try_query_videos(&token, handle, &window).await {
                Ok(videos) => videos,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Video query failed, treating as zero results");
                    summary.handles_failed += 1;
                    Vec::new()
                }
            };

            if !videos.is_empty() {
                summary.records_written += append_records(&videos, &self.config.output)?;
            }

            tokio::time::sleep(delay).await;
        }

        info!(
            output = %self.config.output.display(),
            handles = summary.handles_queried,
            failed = summary.handles_failed,
            rows = summary.records_written,
            "Captions and transcripts saved"
        );
        Ok(summary)
    }
}
