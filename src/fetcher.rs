use crate::types::Result;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("newsreel/", env!("CARGO_PKG_VERSION"));

/// Outcome of a single conditional fetch. Retry policy is not in here: a
/// failed fetch counts against the feed's health and the scheduler decides
/// when to come back.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304: the feed has not changed since the cached etag/last-modified.
    NotModified,
    Fetched {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// 4xx. Publisher-side problem; parked, not counted as feed failure.
    ClientError { status: u16 },
    /// 5xx and other non-success statuses.
    ServerError { status: u16 },
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome> {
        debug!("Fetching feed: {}", url);

        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!("Feed not modified: {}", url);
            return Ok(FetchOutcome::NotModified);
        }
        if status.is_client_error() {
            return Ok(FetchOutcome::ClientError {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Ok(FetchOutcome::ServerError {
                status: status.as_u16(),
            });
        }

        let etag = header_string(&response, "etag");
        let last_modified = header_string(&response, "last-modified");
        let body = response.text().await?;
        debug!("Fetched {} ({} bytes)", url, body.len());

        Ok(FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
