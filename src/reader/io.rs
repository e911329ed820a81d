use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::concurrency::ConcurrencyController;
use crate::error::{Error, Result};
use crate::source::ByteRangeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Attempts after the first one.
    pub max_retries: u32,

    /// Delay before the first retry, doubled for every following one.
    pub base_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

/// All range requests go through here: gated by the concurrency controller, retried with
/// backoff on recoverable errors and counted in the statistics.
pub struct Io {
    source: Arc<dyn ByteRangeSource>,
    ctl: Arc<ConcurrencyController>,
    retry: RetryOptions,
}

impl Io {
    pub fn new(
        source: Arc<dyn ByteRangeSource>,
        ctl: Arc<ConcurrencyController>,
        retry: RetryOptions,
    ) -> Io {
        Io { source, ctl, retry }
    }

    pub fn origin(&self) -> &str {
        self.source.origin()
    }

    pub fn len(&self) -> Option<u64> {
        self.source.len()
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.ctl
    }

    /// Read up to `length` bytes at `offset`. Fewer bytes are only returned when the origin
    /// ends early.
    pub async fn read_upto(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut attempt = 0;

        loop {
            let permit = self.ctl.acquire().await;
            let r = self.ctl.supervise(self.source.read(offset, length)).await;
            drop(permit);

            match r {
                Ok(b) => {
                    log::trace!(
                        "{}: read {} bytes at {:#x}",
                        self.source.origin(),
                        b.len(),
                        offset
                    );
                    self.ctl.completed(b.len() as u64);
                    return Ok(b);
                }
                Err(e) => {
                    self.ctl.failed();

                    let e = Error::from(e);
                    if !e.is_recoverable() || attempt >= self.retry.max_retries {
                        return Err(e);
                    }

                    let delay = Duration::from_millis(self.retry.base_delay_ms << attempt.min(16));
                    log::warn!(
                        "{}: read of {} bytes at {:#x} failed ({}), retrying in {:?}",
                        self.source.origin(),
                        length,
                        offset,
                        e,
                        delay
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Read exactly `length` bytes at `offset`.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let b = self.read_upto(offset, length).await?;

        if (b.len() as u64) < length {
            return Err(Error::Truncated {
                offset,
                wanted: length,
                got: b.len() as u64,
            });
        }

        Ok(b)
    }
}
