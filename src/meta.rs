//! Metadata reads.
//!
//! At open the head of the file is fetched in one request (the metadata budget). Files laid out
//! for the cloud keep all their metadata there, so discovery is served from memory. Anything
//! past the head is fetched in fixed-size pages which are kept in an LRU cache, with at most one
//! request in flight per page.
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flight::SingleFlight;
use crate::format::Sizes;
use crate::reader::io::Io;

pub struct MetaReader {
    io: Arc<Io>,
    head: Bytes,
    sizes: Sizes,
    page_size: u64,
    pages: Arc<Mutex<LruCache<u64, Bytes>>>,
    flight: SingleFlight<u64, Bytes>,
}

impl MetaReader {
    pub fn new(
        io: Arc<Io>,
        head: Bytes,
        sizes: Sizes,
        page_size: u64,
        cache_pages: usize,
    ) -> MetaReader {
        MetaReader {
            io,
            head,
            sizes,
            page_size: page_size.max(512),
            pages: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_pages).unwrap_or(NonZeroUsize::MIN),
            ))),
            flight: SingleFlight::new(),
        }
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn io(&self) -> &Arc<Io> {
        &self.io
    }

    /// Number of pages currently cached.
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn page(&self, n: u64) -> Result<Bytes> {
        let cached = self
            .pages
            .lock()
            .map_err(|_| Error::Invalid("page cache poisoned".into()))?
            .get(&n)
            .cloned();

        if let Some(p) = cached {
            return Ok(p);
        }

        let io = Arc::clone(&self.io);
        let pages = Arc::clone(&self.pages);
        let sz = self.page_size;

        self.flight
            .run(n, async move {
                let b = io.read_upto(n * sz, sz).await?;
                if let Ok(mut pages) = pages.lock() {
                    pages.put(n, b.clone());
                }
                Ok(b)
            })
            .await
    }

    /// Read up to `len` bytes at `addr`, fewer only if the file ends before.
    pub async fn read_upto(&self, addr: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }

        let end = addr
            .checked_add(len)
            .ok_or_else(|| Error::format(addr, format!("structure of {len} bytes overflows")))?;
        let head = self.head.len() as u64;

        if end <= head {
            return Ok(self.head.slice(addr as usize..end as usize));
        }

        // Large structures (big B-tree nodes, fixed array pages) bypass the page cache.
        if len > 4 * self.page_size {
            return self.io.read_upto(addr, len).await;
        }

        let first = addr / self.page_size;
        let last = (end - 1) / self.page_size;

        let mut out = BytesMut::with_capacity(len as usize);
        for n in first..=last {
            let page = self.page(n).await?;
            let page_start = n * self.page_size;

            let from = addr.max(page_start) - page_start;
            let to = end.min(page_start + self.page_size) - page_start;

            if from >= page.len() as u64 {
                break;
            }

            let to = to.min(page.len() as u64);
            out.extend_from_slice(&page[from as usize..to as usize]);

            if (page.len() as u64) < self.page_size {
                // End of file.
                break;
            }
        }

        Ok(out.freeze())
    }

    /// Read exactly `len` bytes at `addr`.
    pub async fn read(&self, addr: u64, len: u64) -> Result<Bytes> {
        let b = self.read_upto(addr, len).await?;

        if (b.len() as u64) < len {
            log::warn!(
                "{}: metadata at {:#x} extends past the end of the file",
                self.io.origin(),
                addr
            );
            return Err(Error::Truncated {
                offset: addr,
                wanted: len,
                got: b.len() as u64,
            });
        }

        Ok(b)
    }
}
