use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::io;
use std::time::Duration;

use super::ByteRangeSource;

/// A remote file served by a web server honoring `Range` requests.
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
    len: Option<u64>,
}

fn other<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn from_reqwest(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

/// Parse `bytes start-end/total` from a `Content-Range` header.
pub(crate) fn parse_content_range(v: &str) -> Option<(u64, u64, Option<u64>)> {
    let v = v.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = v.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };

    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

impl HttpSource {
    /// Create a source for `url`. The length comes from a one byte range request.
    pub async fn open(url: &str) -> io::Result<HttpSource> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(from_reqwest)?;

        HttpSource::with_client(url, client).await
    }

    pub async fn with_client(url: &str, client: reqwest::Client) -> io::Result<HttpSource> {
        let mut s = HttpSource {
            url: url.to_string(),
            client,
            len: None,
        };

        let r = s
            .client
            .get(&s.url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(from_reqwest)?;

        s.len = match r.status() {
            StatusCode::PARTIAL_CONTENT => r
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .and_then(|(_, _, total)| total),
            StatusCode::OK => r.content_length(),
            status => return Err(other(format!("{}: unexpected status {status}", s.url))),
        };

        log::debug!("{}: remote length: {:?}", s.url, s.len);

        Ok(s)
    }

    async fn fetch(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        let end = offset.saturating_add(length - 1);
        log::trace!("GET {} bytes={offset}-{end}", self.url);

        let r = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(from_reqwest)?;

        match r.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = r
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .map(|(start, _, _)| start);

                if let Some(start) = start {
                    if start != offset {
                        return Err(other(format!(
                            "{}: server returned range starting at {start}, requested {offset}",
                            self.url
                        )));
                    }
                }

                let b = r.bytes().await.map_err(from_reqwest)?;
                let n = usize::try_from(length).unwrap_or(usize::MAX);
                Ok(b.slice(..b.len().min(n)))
            }

            // Server ignored the range: take our slice of the full body.
            StatusCode::OK => {
                log::warn!("{}: server does not honor range requests", self.url);
                let b = r.bytes().await.map_err(from_reqwest)?;
                let len = b.len() as u64;
                let start = offset.min(len) as usize;
                let end = offset.saturating_add(length).min(len) as usize;
                Ok(b.slice(start..end))
            }

            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),

            status => Err(other(format!("{}: unexpected status {status}", self.url))),
        }
    }
}

impl ByteRangeSource for HttpSource {
    fn read(&self, offset: u64, length: u64) -> BoxFuture<'_, io::Result<Bytes>> {
        self.fetch(offset, length).boxed()
    }

    fn origin(&self) -> &str {
        &self.url
    }

    fn len(&self) -> Option<u64> {
        self.len
    }
}
