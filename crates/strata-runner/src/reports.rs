//! Live-report streaming from the worker currently hosting a task.
//!
//! The worker-side surface is
//! `GET http://<host>:<port>/worker/v1/chat/<taskId>/liveReports`, where the
//! task ID is percent-encoded (spaces become `%20`). The [`ReportClient`]
//! trait keeps the HTTP transport pluggable; production uses
//! [`HttpReportClient`] over reqwest.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{Error, Result};
use crate::worker::TaskLocation;

/// A stream of live-report bytes from a worker.
pub type ReportStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Builds the live-report URL for a task at `location`.
///
/// Task IDs are arbitrary strings and may contain whitespace, so the ID is
/// percent-encoded into the path.
#[must_use]
pub fn live_reports_url(location: &TaskLocation, task_id: &str) -> String {
    let scheme = if location.tls { "https" } else { "http" };
    format!(
        "{scheme}://{}:{}/worker/v1/chat/{}/liveReports",
        location.host,
        location.port,
        urlencoding::encode(task_id)
    )
}

/// Transport for fetching live-report streams from workers.
#[async_trait]
pub trait ReportClient: Send + Sync + std::fmt::Debug {
    /// Opens a byte stream from `url`.
    ///
    /// # Errors
    ///
    /// Returns an HTTP error when the request fails or the worker responds
    /// with a non-success status.
    async fn stream(&self, url: &str) -> Result<ReportStream>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Reqwest-backed report client.
#[derive(Debug, Clone)]
pub struct HttpReportClient {
    client: reqwest::Client,
}

impl HttpReportClient {
    /// Creates a client with the runner's connect timeout.
    ///
    /// # Errors
    ///
    /// Returns an HTTP error when the underlying client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReportClient for HttpReportClient {
    async fn stream(&self, url: &str) -> Result<ReportStream> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::http(format!("live report request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::http(format!(
                "live report request returned status {status}"
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::http(format!("live report stream failed: {e}"))));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_percent_encodes_spaces() {
        let location = TaskLocation::new("dummy", 9000);
        assert_eq!(
            live_reports_url(&location, "task with spaces"),
            "http://dummy:9000/worker/v1/chat/task%20with%20spaces/liveReports"
        );
    }

    #[test]
    fn url_uses_https_for_tls_locations() {
        let location = TaskLocation {
            host: "dummy".into(),
            port: 9443,
            tls: true,
        };
        assert_eq!(
            live_reports_url(&location, "t1"),
            "https://dummy:9443/worker/v1/chat/t1/liveReports"
        );
    }

    #[test]
    fn plain_ids_pass_through_unchanged() {
        let location = TaskLocation::new("w1", 8100);
        assert_eq!(
            live_reports_url(&location, "compact-events-2026"),
            "http://w1:8100/worker/v1/chat/compact-events-2026/liveReports"
        );
    }
}
