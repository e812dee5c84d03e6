use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderValue, ACCEPT, USER_AGENT};
use url::Url;

use common::error::{Error, Result};

use crate::config::ScrapeConfig;

const ACCEPT_HEADER: &str = "application/openmetrics-text;version=1.0.0,application/openmetrics-text;version=0.0.1;q=0.75,text/plain;version=0.0.4;q=0.5,*/*;q=0.1";
const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";
const USER_AGENT_VALUE: &str = concat!("scrape-agent/", env!("CARGO_PKG_VERSION"));

/// Fetches the raw metrics body of one target.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>>;
}

/// Builds the scraper shared by all loops of one job.
pub trait ScraperFactory: Send + Sync {
    fn build(&self, cfg: &ScrapeConfig) -> Result<Arc<dyn Scraper>>;
}

/// Scrapes over HTTP(S) with a connection-reusing client.
pub struct HttpScraper {
    client: reqwest::Client,
}

impl HttpScraper {
    pub fn new(cfg: &ScrapeConfig) -> Result<HttpScraper> {
        let client = reqwest::Client::builder()
            .timeout(cfg.scrape_timeout)
            .pool_idle_timeout(cfg.scrape_interval.saturating_mul(2))
            .pool_max_idle_per_host(1)
            .build()
            .map_err(Error::Client)?;
        Ok(HttpScraper { client })
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>> {
        debug!("scraping {}", url);
        let resp = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER))
            .header(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE))
            .header(SCRAPE_TIMEOUT_HEADER, timeout.as_secs_f64().to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status(status.as_u16()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;
        Ok(body.to_vec())
    }
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(timeout)
    } else {
        Error::Http(err)
    }
}

/// The default factory: one [`HttpScraper`] per job.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpClientFactory;

impl ScraperFactory for HttpClientFactory {
    fn build(&self, cfg: &ScrapeConfig) -> Result<Arc<dyn Scraper>> {
        Ok(Arc::new(HttpScraper::new(cfg)?))
    }
}
