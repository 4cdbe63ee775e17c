//! History adapter for the backend's REST listing.
//!
//! `GET {base}/api/projects/{project}/sessions/{session}/messages?limit=&offset=`
//! Uses reqwest; the response body is either a bare array of records or
//! an object with a `messages` array.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use chat_core::ports::HistoryPort;
use chat_types::{config::HistoryConfig, session::HistoryRecord, ChatError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpHistoryClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpHistoryClient {
    pub fn new(config: &HistoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Config(e.to_string()))?;
        let base_url = reqwest::Url::parse(&config.base_url)
            .map_err(|e| ChatError::Config(format!("history base url {}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Config(format!(
                "history base url {} cannot carry a path",
                config.base_url
            )));
        }
        Ok(Self { client, base_url })
    }

    fn url(&self, project: &str, session_id: &str) -> Result<reqwest::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("history base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "projects", project, "sessions", session_id, "messages"]);
        Ok(url)
    }
}

#[async_trait(?Send)]
impl HistoryPort for HttpHistoryClient {
    async fn fetch(
        &self,
        project: &str,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let url = self.url(project, session_id)?;
        log::debug!("Fetching history {} (limit {}, offset {})", url, limit, offset);

        let response = self
            .client
            .get(url)
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::NotFound(format!("session {}", session_id)));
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ChatError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let body = response.text().await.map_err(request_error)?;
        parse_listing(&body)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Bare(Vec<HistoryRecord>),
    Wrapped { messages: Vec<HistoryRecord> },
}

/// Decode a listing body into records, oldest first
pub fn parse_listing(body: &str) -> Result<Vec<HistoryRecord>> {
    let listing: Listing = serde_json::from_str(body)
        .map_err(|e| ChatError::MalformedPayload(format!("history listing: {}", e)))?;
    Ok(match listing {
        Listing::Bare(records) => records,
        Listing::Wrapped { messages } => messages,
    })
}

fn request_error(e: reqwest::Error) -> ChatError {
    if e.is_connect() || e.is_timeout() {
        ChatError::Network(e.to_string())
    } else {
        ChatError::Http {
            status: e.status().map_or(0, |s| s.as_u16()),
            message: e.to_string(),
        }
    }
}
