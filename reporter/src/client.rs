use std::{future::Future, time::Duration};

use anyhow::Context;
use reqwest::Client;
use thiserror::Error;

use regulator_common::SampleReport;

#[derive(Debug, Error)]
#[error("POST {url} failed: {source}")]
pub struct TransportError {
    pub url: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonReply {
    pub status: u16,
    pub body: String,
}

impl DaemonReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait DaemonTransport {
    fn post_report(
        &self,
        report: &SampleReport,
    ) -> impl Future<Output = Result<DaemonReply, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpDaemonClient {
    client: Client,
    url: String,
}

impl HttpDaemonClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build daemon http client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(&self, source: reqwest::Error) -> TransportError {
        TransportError {
            url: self.url.clone(),
            source: Box::new(source),
        }
    }
}

impl DaemonTransport for HttpDaemonClient {
    async fn post_report(&self, report: &SampleReport) -> Result<DaemonReply, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;

        Ok(DaemonReply { status, body })
    }
}
