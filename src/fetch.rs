use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::entity::EntityId;
use crate::error::FetchError;

const USER_AGENT: &str = concat!("cvlac-harvester/", env!("CARGO_PKG_VERSION"));

/// Source of raw documents by entity ID.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, id: EntityId) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

pub fn document_url(template: &str, id: EntityId) -> String {
    template.replace("{id}", &id.to_string())
}

pub struct HttpFetcher {
    client: reqwest::Client,
    url_template: String,
}

impl HttpFetcher {
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self> {
        // the CV portal serves an incomplete certificate chain
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, id: EntityId) -> Result<Vec<u8>, FetchError> {
        let url = document_url(&self.url_template, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.bytes().await.map_err(|e| classify(&url, e))?;
        debug!(cvlac_id = %id, bytes = body.len(), "Fetched");
        Ok(body.to_vec())
    }
}

fn classify(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}
