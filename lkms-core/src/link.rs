//! HTTPS client pulling raw key octets from the QKD link endpoint
//!
//! The concrete QKD link protocol is outside this crate; the link endpoint
//! only has to answer `GET <url>?bytes=N` with up to N raw octets. The
//! feeder loop drives the client on its own task, hands octets to the
//! reactor through a [`KeyFeed`] and keeps the published [`LinkStatus`]
//! honest: failures degrade the link, an open circuit breaker marks it
//! unavailable.

use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::southbound::{KeyFeed, LinkStatus};
use crate::{Error, Result};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Configuration for the link client
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Base URL of the QKD link endpoint
    pub base_url: Url,
    /// Octets requested per pull
    pub chunk_size: usize,
    /// Request timeout
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub retry_policy: RetryPolicy,
}

impl LinkConfig {
    pub fn new(base_url: Url, chunk_size: usize) -> Self {
        Self {
            base_url,
            chunk_size,
            timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// HTTP client for the southbound key endpoint
pub struct KeyLinkClient {
    client: Client,
    config: LinkConfig,
}

impl KeyLinkClient {
    /// Create a new client with connection pooling
    pub fn new(config: LinkConfig) -> Result<Self> {
        let secure = config.base_url.scheme() == "https";
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .use_rustls_tls()
            .https_only(secure)
            .build()
            .map_err(Error::Network)?;
        Ok(Self { client, config })
    }

    /// Pull one chunk of raw key octets, retrying transient failures
    #[instrument(skip(self), fields(chunk_size = self.config.chunk_size))]
    pub async fn pull(&self) -> Result<Vec<u8>> {
        self.config.retry_policy.execute(|| self.pull_once()).await
    }

    async fn pull_once(&self) -> Result<Vec<u8>> {
        let url = self.request_url();
        debug!("pulling {} octets from {}", self.config.chunk_size, url);

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!("pull from {} failed: {}", url, e);
            Error::Network(e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("link endpoint returned HTTP {}: {}", status, body);
            return Err(Error::Source(format!("HTTP {status}")));
        }

        let octets = response.bytes().await.map_err(Error::Network)?.to_vec();
        if octets.len() > self.config.chunk_size {
            return Err(Error::Source(format!(
                "link returned {} octets, asked for {}",
                octets.len(),
                self.config.chunk_size
            )));
        }
        // A short or empty chunk is not an error: the link produces at an
        // uncontrolled rate and the next pull resumes.
        debug!("pulled {} octets", octets.len());
        Ok(octets)
    }

    fn request_url(&self) -> Url {
        let mut url = self.config.base_url.clone();
        url.query_pairs_mut()
            .append_pair("bytes", &self.config.chunk_size.to_string());
        url
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}

/// Feeder loop: pull from the link, hand off to the reactor
///
/// Runs until the reactor side of the feed is gone. Backpressure comes for
/// free: when the hand-off queue is full the send awaits, and no further
/// pulls happen until the reactor drains.
pub async fn feed_loop(
    client: KeyLinkClient,
    feed: KeyFeed,
    pull_interval: Duration,
    breaker: CircuitBreaker,
) {
    let mut ticker = interval(pull_interval);
    info!(
        "southbound feeder started, pulling every {:?}",
        pull_interval
    );

    loop {
        ticker.tick().await;

        if breaker.is_open() {
            feed.set_status(LinkStatus::Unavailable);
            continue;
        }

        match client.pull().await {
            Ok(octets) => {
                breaker.record_success();
                feed.set_status(LinkStatus::Available);
                if octets.is_empty() {
                    continue;
                }
                if feed.send(octets).await.is_err() {
                    info!("reactor gone, stopping southbound feeder");
                    return;
                }
            }
            Err(e) => {
                breaker.record_failure();
                let status = if breaker.is_open() {
                    LinkStatus::Unavailable
                } else {
                    LinkStatus::Degraded
                };
                feed.set_status(status);
                warn!("southbound pull failed ({}): {}", status, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url() {
        let config = LinkConfig::new(Url::parse("https://qkd.local/keys").unwrap(), 256);
        let client = KeyLinkClient::new(config).unwrap();
        assert!(client.request_url().to_string().contains("bytes=256"));
    }

    #[tokio::test]
    async fn test_pull_from_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/keys")
            .match_query(mockito::Matcher::UrlEncoded("bytes".into(), "4".into()))
            .with_status(200)
            .with_body([0xAA, 0xBB, 0xCC, 0xDD])
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/keys", server.url())).unwrap();
        let client = KeyLinkClient::new(LinkConfig::new(url, 4)).unwrap();
        let octets = client.pull().await.unwrap();

        assert_eq!(octets, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pull_rejects_oversized_reply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body([0u8; 16])
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/keys", server.url())).unwrap();
        let mut config = LinkConfig::new(url, 4);
        config.retry_policy.max_attempts = 1;
        let client = KeyLinkClient::new(config).unwrap();
        assert!(client.pull().await.is_err());
    }
}
