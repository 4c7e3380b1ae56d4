use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parley_storage::Turn;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const HISTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One page of older turns, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Turn>,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
}

/// Remote store of older turns reachable through the history endpoint.
pub trait HistorySource: Send + Sync {
    /// Fetches up to `limit` turns strictly older than `before`.
    fn fetch_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, HistoryResult<HistoryPage>>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryError {
    #[snafu(display("failed to build history client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("history request to {endpoint} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("history endpoint {endpoint} answered {status}"))]
    Status {
        stage: &'static str,
        endpoint: String,
        status: u16,
    },
    #[snafu(display("history response from {endpoint} was malformed: {source}"))]
    Decode {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("history source unavailable: {message}"))]
    Unavailable {
        stage: &'static str,
        message: String,
    },
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// `GET <endpoint>?before=<ISO-8601>&limit=<n>` returning `{messages, hasMore}`.
#[derive(Debug, Clone)]
pub struct HttpHistoryClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHistoryClient {
    pub fn new(endpoint: impl Into<String>) -> HistoryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HISTORY_REQUEST_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "build-history-client",
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim().to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, before: DateTime<Utc>, limit: u32) -> HistoryResult<HistoryPage> {
        let before = format_cursor(before);
        tracing::debug!(endpoint = %self.endpoint, before = %before, limit, "fetching history page");
        let limit = limit.to_string();

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("before", before.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .context(RequestSnafu {
                stage: "send-history-request",
                endpoint: self.endpoint.clone(),
            })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                stage: "check-history-status",
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            }
        );

        response.json::<HistoryPage>().await.context(DecodeSnafu {
            stage: "decode-history-page",
            endpoint: self.endpoint.clone(),
        })
    }
}

impl HistorySource for HttpHistoryClient {
    fn fetch_before(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, HistoryResult<HistoryPage>> {
        Box::pin(self.fetch(before, limit))
    }
}

/// Renders a cursor the way browsers print `Date.toISOString()`.
pub fn format_cursor(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
