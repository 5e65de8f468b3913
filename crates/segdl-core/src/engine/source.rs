//! Range source - the transport that serves byte ranges of a remote resource
//!
//! The engine only needs two things from the network: a ranged read that
//! yields a stream of bytes, and a probe that reports the declared size.
//! `HttpRangeSource` implements both over HTTP with reqwest.

use crate::error::SegdlError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use segdl_types::{ByteRange, EngineConfig, RemoteResource};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream of bytes for one ranged read
pub type ChunkStream = BoxStream<'static, Result<Bytes, SegdlError>>;

/// A transport able to serve byte ranges of a remote resource
pub trait RangeSource: Send + Sync {
    /// Issue a ranged read for `range` of `locator`
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        range: ByteRange,
        extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<ChunkStream, SegdlError>>;

    /// Discover the declared size and name of `locator`
    fn probe<'a>(
        &'a self,
        locator: &'a str,
        extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<RemoteResource, SegdlError>>;
}

/// HTTP implementation of [`RangeSource`]
#[derive(Clone, Debug)]
pub struct HttpRangeSource {
    client: Client,
}

impl HttpRangeSource {
    /// Create a source with the timeouts and user agent from `config`
    pub fn new(config: &EngineConfig) -> Result<Self, SegdlError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_range(
        &self,
        locator: &str,
        range: ByteRange,
        extra_params: &[(String, String)],
    ) -> Result<ChunkStream, SegdlError> {
        let url = parse_locator(locator)?;
        let header = range.header_value();
        debug!("Requesting {} {}", url, header);

        let response = self
            .client
            .get(url)
            .query(extra_params)
            .header(RANGE, header)
            .send()
            .await?;

        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        check_range_response(status, content_range.as_deref(), range)?;

        let start = range.start;
        let stream = response
            .bytes_stream()
            .map_err(move |e| SegdlError::SegmentTransport {
                offset: start,
                message: e.to_string(),
            });
        Ok(stream.boxed())
    }

    async fn probe_locator(
        &self,
        locator: &str,
        extra_params: &[(String, String)],
    ) -> Result<RemoteResource, SegdlError> {
        let url = parse_locator(locator)?;
        info!("Probing URL: {}", url);

        let response = self.client.head(url.clone()).query(extra_params).send().await?;
        if !response.status().is_success() {
            return Err(SegdlError::ServerError {
                status: response.status().as_u16(),
                message: format!("Probe of {} failed", url),
            });
        }

        let final_url = response.url().to_string();
        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| filename_from_url(response.url()));
        let resumable = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s == "bytes")
            .unwrap_or(false);
        let mut size: Option<u64> = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        // Some CDNs omit Content-Length on HEAD; a one-byte ranged GET reports the total
        if size.is_none() {
            info!("HEAD didn't return Content-Length, trying partial GET on {}", final_url);
            match self
                .client
                .get(final_url.as_str())
                .query(extra_params)
                .header(RANGE, "bytes=0-0")
                .send()
                .await
            {
                Ok(range_response) if range_response.status() == StatusCode::PARTIAL_CONTENT => {
                    size = range_response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_content_range(v).and_then(|(_, total)| total));
                }
                Ok(range_response) => {
                    warn!("Partial GET probe returned {}", range_response.status());
                }
                Err(e) => {
                    warn!("Partial GET probe failed: {}", e);
                }
            }
        }

        if !resumable {
            warn!("{} does not advertise byte ranges", final_url);
        }

        let size = size.ok_or_else(|| SegdlError::ServerError {
            status: 0,
            message: format!("Could not determine size of {}", final_url),
        })?;

        Ok(RemoteResource::new(locator, filename, final_url, size))
    }
}

impl RangeSource for HttpRangeSource {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        range: ByteRange,
        extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<ChunkStream, SegdlError>> {
        self.fetch_range(locator, range, extra_params).boxed()
    }

    fn probe<'a>(
        &'a self,
        locator: &'a str,
        extra_params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<RemoteResource, SegdlError>> {
        self.probe_locator(locator, extra_params).boxed()
    }
}

fn parse_locator(locator: &str) -> Result<url::Url, SegdlError> {
    url::Url::parse(locator).map_err(|_| SegdlError::InvalidUrl(locator.to_string()))
}

/// Verify that the server answered the ranged read with exactly the requested bytes
pub(crate) fn check_range_response(
    status: StatusCode,
    content_range: Option<&str>,
    range: ByteRange,
) -> Result<(), SegdlError> {
    if status == StatusCode::PARTIAL_CONTENT {
        if let Some((start, _)) = content_range.and_then(parse_content_range) {
            if start != range.start {
                return Err(SegdlError::RangeNotHonored {
                    status: status.as_u16(),
                });
            }
        }
        return Ok(());
    }

    // A full body is only acceptable when the whole resource was requested
    if status == StatusCode::OK {
        if range.start == 0 && range.is_open() {
            return Ok(());
        }
        return Err(SegdlError::RangeNotHonored {
            status: status.as_u16(),
        });
    }

    Err(SegdlError::ServerError {
        status: status.as_u16(),
        message: format!("Ranged read {} rejected", range.header_value()),
    })
}

/// Parse `bytes <start>-<end>/<total>`, returning the start and the total if known
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (span, total) = spec.split_once('/')?;
    let (start, _) = span.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split("filename=")
        .nth(1)
        .map(|s| s.split(';').next().unwrap_or(s).trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn filename_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}
