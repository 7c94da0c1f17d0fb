//! HTTP ingestion sink: posts each record as JSON to a remote
//! endpoint. Retry and batching are the endpoint's concern; this
//! sink reports a failure per record and moves on.

use super::{ResultSink, SinkError};
use crate::domain::job::ResultEnvelope;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON POST sink.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(url: String, token: Option<String>) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        info!(%url, "http sink configured");
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl ResultSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write_record(&self, record: &ResultEnvelope) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.url).json(record);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
