//! Events API client.

use std::fmt;
use std::time::Duration;

use bmnotify_core::{EventRecord, Sink, SinkError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header carrying the auth token.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
/// Microversion header; the events endpoint needs at least 1.54.
pub const API_VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";
pub const DEFAULT_API_VERSION: &str = "1.54";

fn default_api_version() -> String { DEFAULT_API_VERSION.to_string() }
fn default_timeout_secs() -> u64 { 30 }

#[derive(Clone, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    /// Base URL of the service, e.g. `http://ironic.example:6385`.
    pub endpoint: String,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpSinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            api_version: default_api_version(),
            request_timeout_secs: default_timeout_secs(),
        }
    }

    pub fn events_url(&self) -> String {
        format!("{}/v1/events", self.endpoint.trim_end_matches('/'))
    }
}

impl fmt::Debug for HttpSinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSinkConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Serialize)]
struct EventsBody<'a> {
    events: &'a [EventRecord],
}

pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    cfg: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(cfg: HttpSinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Self { client, url: cfg.events_url(), cfg })
    }

    pub fn url(&self) -> &str { &self.url }
}

#[async_trait::async_trait]
impl Sink for HttpSink {
    async fn submit(&self, events: Vec<EventRecord>) -> Result<(), SinkError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(API_VERSION_HEADER, &self.cfg.api_version)
            .json(&EventsBody { events: &events });
        if let Some(token) = &self.cfg.auth_token {
            req = req.header(AUTH_TOKEN_HEADER, token);
        }
        let resp = req.send().await.map_err(|e| {
            counter!("bmnotify_http_errors_total", 1, "kind" => "transport");
            SinkError::Transport(e.to_string())
        })?;
        let status = resp.status();
        debug!(status = %status, count = events.len(), url = %self.url, "events API responded");
        if status.as_u16() == 401 || status.as_u16() == 403 {
            counter!("bmnotify_http_errors_total", 1, "kind" => "auth");
            return Err(SinkError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            counter!("bmnotify_http_errors_total", 1, "kind" => "status");
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status: status.as_u16(), body });
        }
        Ok(())
    }

    fn name(&self) -> &str { "http" }
}
