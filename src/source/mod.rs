//! Byte-range sources: the origin of all bytes the reader sees.
//!
//! A source only has to answer "give me `length` bytes starting at `offset`". It may return
//! fewer bytes than requested only when the origin ends before `offset + length` (a truncated or
//! still-growing file), never otherwise.
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use std::io;

mod file;
#[cfg(feature = "http")]
mod http;

pub use file::FileSource;
#[cfg(feature = "http")]
pub use http::HttpSource;

pub trait ByteRangeSource: Send + Sync + 'static {
    /// Read up to `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: u64) -> BoxFuture<'_, io::Result<Bytes>>;

    /// Identifies the origin, used as part of persistent cache keys.
    fn origin(&self) -> &str;

    /// Length of the origin if known up front.
    fn len(&self) -> Option<u64> {
        None
    }
}

/// A source backed by a buffer in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    bytes: Bytes,
}

impl MemorySource {
    pub fn new<B: Into<Bytes>>(name: &str, bytes: B) -> MemorySource {
        MemorySource {
            name: name.to_string(),
            bytes: bytes.into(),
        }
    }
}

impl ByteRangeSource for MemorySource {
    fn read(&self, offset: u64, length: u64) -> BoxFuture<'_, io::Result<Bytes>> {
        let len = self.bytes.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(length).min(len) as usize;

        future::ready(Ok(self.bytes.slice(start..end))).boxed()
    }

    fn origin(&self) -> &str {
        &self.name
    }

    fn len(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_clips_at_end() {
        let s = MemorySource::new("mem", vec![1u8, 2, 3, 4]);

        assert_eq!(&s.read(1, 2).await.unwrap()[..], &[2, 3]);
        assert_eq!(&s.read(2, 10).await.unwrap()[..], &[3, 4]);
        assert!(s.read(10, 10).await.unwrap().is_empty());
        assert_eq!(s.len(), Some(4));
    }
}
