//! The reader: open a file behind a byte-range source, discover its datasets and read chunks
//! and regions of them.
//!
//! ```no_run
//! # async fn run() -> h5range::Result<()> {
//! use h5range::prelude::*;
//!
//! let r = Reader::open_path("tests/data/grid.h5", ReaderOptions::default()).await?;
//!
//! for ds in r.list_datasets().await? {
//!     println!("{}: {:?} {}", ds.path, ds.shape, ds.dtype);
//! }
//!
//! let values = r.read_region("/science/grid", 0, 0, 100, 100).await?;
//! println!("{} values, stats: {:?}", values.len(), r.streaming_stats());
//! # Ok(())
//! # }
//! ```
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub mod cache;
pub mod chunk;
pub mod concurrency;
pub mod io;
#[cfg(feature = "persistent")]
pub mod persist;
pub mod region;

use crate::error::{Error, Result};
use crate::extent::Extents;
use crate::format::layout::Layout;
use crate::format::messages::TypeMessage;
use crate::format::superblock::{self, Superblock};
use crate::format::UNDEF;
use crate::group::{self, Attribute, Discovery, GroupWalker, Value};
use crate::idx::{ChunkIndex, ChunkIndexResolver, DatasetDescriptor, Datatype, Element, IndexState, TypedArray};
use crate::meta::MetaReader;
use crate::source::{ByteRangeSource, FileSource};
use cache::ChunkCache;
use chunk::ChunkFetcher;
use concurrency::{ConcurrencyController, ConcurrencyOptions, StreamingStats};
use io::{Io, RetryOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Bytes fetched from the start of the file at open. Files laid out for the cloud keep all
    /// their metadata here.
    pub metadata_budget: u64,

    /// Size of the pages metadata beyond the head is fetched in.
    pub metadata_page_size: u64,
    pub metadata_cache_pages: usize,

    /// Decoded chunks kept in memory.
    pub chunk_cache_entries: usize,

    /// Directory of a persistent chunk cache.
    pub persistent_cache: Option<PathBuf>,

    /// Largest dataset, in stored bytes, that `read_small_dataset` reads.
    pub small_dataset_limit: u64,

    /// Largest region, in bytes of decoded output, that one read assembles.
    pub region_limit: u64,

    pub concurrency: ConcurrencyOptions,
    pub retry: RetryOptions,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            metadata_budget: 1024 * 1024,
            metadata_page_size: 64 * 1024,
            metadata_cache_pages: 64,
            chunk_cache_entries: 256,
            persistent_cache: None,
            small_dataset_limit: 16 * 1024 * 1024,
            region_limit: 1024 * 1024 * 1024,
            concurrency: ConcurrencyOptions::default(),
            retry: RetryOptions::default(),
        }
    }
}

/// A region read that carries on past failed chunks.
#[derive(Debug, Clone)]
pub struct RegionRead {
    pub data: TypedArray,
    pub shape: Vec<u64>,

    /// Chunks that could not be read. Their part of `data` holds the sentinel.
    pub gaps: Vec<(Vec<u64>, Error)>,
}

struct Inner {
    opts: ReaderOptions,
    superblock: Superblock,
    io: Arc<Io>,
    groups: GroupWalker,
    resolver: ChunkIndexResolver,
    fetcher: ChunkFetcher,
    datasets: Mutex<HashMap<String, Arc<DatasetDescriptor>>>,
}

/// A lazily read HDF5 file. Cloning is cheap and clones share caches.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<Inner>,
}

impl Reader {
    /// Open a file: fetch the head (metadata budget) and parse the superblock. Nothing else is
    /// read until asked for.
    pub async fn open(source: Arc<dyn ByteRangeSource>, opts: ReaderOptions) -> Result<Reader> {
        let ctl = Arc::new(ConcurrencyController::new(opts.concurrency));
        let io = Arc::new(Io::new(source, ctl, opts.retry));

        let budget = opts.metadata_budget.max(superblock::MAX_SIZE as u64);
        let head = io.read_upto(0, budget).await?;
        let sb = Superblock::parse(&head)?;

        log::debug!(
            "{}: superblock v{}, root at {:#x}, {} bytes prefetched",
            io.origin(),
            sb.version,
            sb.root_addr,
            head.len()
        );

        if let Some(len) = io.len() {
            if sb.eof_addr != UNDEF && len < sb.eof_addr {
                log::warn!(
                    "{}: {} bytes, but the superblock ends the file at {}: truncated or still being written",
                    io.origin(),
                    len,
                    sb.eof_addr
                );
            }
        }

        let meta = Arc::new(MetaReader::new(
            Arc::clone(&io),
            head,
            sb.sizes,
            opts.metadata_page_size,
            opts.metadata_cache_pages,
        ));

        let cache = ChunkCache::new(io.origin(), opts.chunk_cache_entries);

        #[cfg(feature = "persistent")]
        let cache = match &opts.persistent_cache {
            Some(dir) => match persist::PersistentCache::open_async(dir.clone()).await {
                Ok(p) => cache.with_persistent(p),
                Err(e) => {
                    log::warn!("{}: persistent cache disabled: {}", dir.display(), e);
                    cache
                }
            },
            None => cache,
        };

        #[cfg(not(feature = "persistent"))]
        if opts.persistent_cache.is_some() {
            log::warn!("built without the persistent feature, persistent cache ignored");
        }

        Ok(Reader {
            inner: Arc::new(Inner {
                groups: GroupWalker::new(Arc::clone(&meta), sb.root_addr),
                resolver: ChunkIndexResolver::new(meta),
                fetcher: ChunkFetcher::new(Arc::clone(&io), Arc::new(cache)),
                datasets: Mutex::new(HashMap::new()),
                superblock: sb,
                io,
                opts,
            }),
        })
    }

    pub async fn open_path<P: AsRef<Path>>(path: P, opts: ReaderOptions) -> Result<Reader> {
        Reader::open(Arc::new(FileSource::open(path)?), opts).await
    }

    #[cfg(feature = "http")]
    pub async fn open_url(url: &str, opts: ReaderOptions) -> Result<Reader> {
        let s = crate::source::HttpSource::open(url).await?;
        Reader::open(Arc::new(s), opts).await
    }

    pub fn superblock(&self) -> &Superblock {
        &self.inner.superblock
    }

    pub fn origin(&self) -> &str {
        self.inner.io.origin()
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.inner.opts
    }

    fn remember(&self, ds: DatasetDescriptor) -> Arc<DatasetDescriptor> {
        let ds = Arc::new(ds);
        if let Ok(mut m) = self.inner.datasets.lock() {
            m.entry(ds.path.clone()).or_insert_with(|| Arc::clone(&ds));
        }
        ds
    }

    /// Walk all groups. Failures are reported per path.
    pub async fn discover(&self) -> Result<Discovery> {
        let d = self.inner.groups.discover().await?;
        for ds in &d.datasets {
            self.remember(ds.clone());
        }
        Ok(d)
    }

    /// All datasets that could be decoded, sorted by path.
    pub async fn list_datasets(&self) -> Result<Vec<Arc<DatasetDescriptor>>> {
        let d = self.discover().await?;
        for (path, e) in &d.failures {
            log::warn!("{path}: skipped: {e}");
        }
        Ok(d.datasets.into_iter().map(Arc::new).collect())
    }

    /// Resolve one dataset without listing the file.
    pub async fn dataset(&self, path: &str) -> Result<Arc<DatasetDescriptor>> {
        let path = group::normalize(path);

        if let Some(ds) = self.inner.datasets.lock().ok().and_then(|m| m.get(&path).cloned()) {
            return Ok(ds);
        }

        let ds = self.inner.groups.describe(&path).await?;
        Ok(self.remember(ds))
    }

    /// The chunk index of a dataset, built on first access.
    pub async fn chunk_index(&self, path: &str) -> Result<Arc<ChunkIndex>> {
        let ds = self.dataset(path).await?;
        self.inner.resolver.resolve(&ds).await
    }

    pub fn index_state(&self, path: &str) -> IndexState {
        self.inner.resolver.state(&group::normalize(path))
    }

    /// The chunk at `coord` in the chunk grid, `None` if it was never written.
    pub async fn read_chunk_at(&self, path: &str, coord: &[u64]) -> Result<Option<Arc<TypedArray>>> {
        let ds = self.dataset(path).await?;
        let index = self.inner.resolver.resolve(&ds).await?;
        self.inner.fetcher.fetch(&ds, &index, coord).await
    }

    /// A chunk of a 2-D dataset.
    pub async fn read_chunk(
        &self,
        path: &str,
        chunk_row: u64,
        chunk_col: u64,
    ) -> Result<Option<Arc<TypedArray>>> {
        let ds = self.dataset(path).await?;
        if ds.rank() != 2 {
            return Err(Error::Invalid(format!(
                "{}: read_chunk on dataset of rank {}",
                ds.path,
                ds.rank()
            )));
        }
        self.read_chunk_at(path, &[chunk_row, chunk_col]).await
    }

    /// Elements in a region of `count`, checked against the region limit.
    fn region_len(&self, ds: &DatasetDescriptor, count: &[u64]) -> Result<usize> {
        let limit = self.inner.opts.region_limit;

        count
            .iter()
            .try_fold(1u64, |n, c| n.checked_mul(*c))
            .filter(|n| {
                n.checked_mul(ds.element_size as u64)
                    .is_some_and(|b| b <= limit)
            })
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "{}: region of {:?} exceeds the region limit of {} bytes",
                    ds.path, count, limit
                ))
            })
    }

    async fn assemble(&self, path: &str, extents: Extents, strict: bool) -> Result<RegionRead> {
        let ds = self.dataset(path).await?;

        if !ds.dtype.is_numeric() {
            return Err(Error::Unsupported(format!(
                "{}: region reads of {} datasets",
                ds.path, ds.dtype
            )));
        }

        let (start, count) = extents.resolve(&ds.shape)?;
        let n = self.region_len(&ds, &count)?;
        let mut data = ds.sentinel(n)?;
        let mut gaps = Vec::new();

        let coords = ds.chunks_in(&start, &count);
        if !coords.is_empty() {
            let index = self.inner.resolver.resolve(&ds).await?;
            let fetcher = &self.inner.fetcher;
            let width = self.inner.io.controller().options().max;

            let mut chunks = stream::iter(coords)
                .map(|c| {
                    let (ds, index) = (&ds, &index);
                    async move {
                        let r = fetcher.fetch(ds, index, &c).await;
                        (c, r)
                    }
                })
                .buffer_unordered(width);

            while let Some((c, r)) = chunks.next().await {
                match r {
                    Ok(Some(chunk)) => region::copy_typed(&ds, &c, &chunk, &start, &count, &mut data)?,
                    Ok(None) => (),
                    Err(e) if strict => return Err(e),
                    Err(e) => {
                        log::warn!("{}: chunk {:?}: {}", ds.path, c, e);
                        gaps.push((c, e));
                    }
                }
            }
        }

        Ok(RegionRead {
            data,
            shape: count,
            gaps,
        })
    }

    /// Read a box of an N-d dataset. Cells outside the dataset or in unwritten chunks hold the
    /// fill value, or NaN (floats) or zero (integers) when none is defined. Fails on the first
    /// chunk that can not be read.
    pub async fn read_slice<E: Into<Extents>>(&self, path: &str, extents: E) -> Result<TypedArray> {
        Ok(self.assemble(path, extents.into(), true).await?.data)
    }

    /// As [`Reader::read_slice`], but chunks that fail are reported instead.
    pub async fn read_slice_with_gaps<E: Into<Extents>>(
        &self,
        path: &str,
        extents: E,
    ) -> Result<RegionRead> {
        self.assemble(path, extents.into(), false).await
    }

    /// `height` x `width` values of a 2-D dataset starting at (`row`, `col`), row-major.
    pub async fn read_region(
        &self,
        path: &str,
        row: u64,
        col: u64,
        height: u64,
        width: u64,
    ) -> Result<TypedArray> {
        let ds = self.dataset(path).await?;
        if ds.rank() != 2 {
            return Err(Error::Invalid(format!(
                "{}: read_region on dataset of rank {}",
                ds.path,
                ds.rank()
            )));
        }

        self.read_slice(path, [(row, height), (col, width)]).await
    }

    /// Read a box into an array of element type `T`, which must match the dataset.
    pub async fn read_ndarray<T: Element, E: Into<Extents>>(
        &self,
        path: &str,
        extents: E,
    ) -> Result<ndarray::ArrayD<T>> {
        let r = self.assemble(path, extents.into(), true).await?;
        let dtype = r.data.dtype();

        let v = r.data.into_vec::<T>().ok_or_else(|| {
            Error::Invalid(format!("{path}: {dtype} dataset read as {}", T::DTYPE))
        })?;

        let shape = r.shape.iter().map(|d| *d as usize).collect::<Vec<_>>();
        ndarray::ArrayD::from_shape_vec(shape, v).map_err(|e| Error::Invalid(e.to_string()))
    }

    /// Read a whole dataset of at most `small_dataset_limit` bytes, including string datasets.
    pub async fn read_small_dataset(&self, path: &str) -> Result<Value> {
        let ds = self.dataset(path).await?;
        let bytes = ds.size() * ds.element_size as u64;

        if bytes > self.inner.opts.small_dataset_limit {
            return Err(Error::Invalid(format!(
                "{}: {} bytes exceeds the small dataset limit of {}",
                ds.path, bytes, self.inner.opts.small_dataset_limit
            )));
        }

        let t = match (ds.dtype, ds.padding) {
            (Datatype::FixedString(size), Some(padding)) => TypeMessage::FixedString { size, padding },
            (Datatype::VarString, Some(padding)) => TypeMessage::VarString { padding },
            _ => return Ok(Value::Numeric(self.read_slice(path, ..).await?)),
        };

        let raw = match &ds.layout {
            Layout::Compact { data } => data.clone(),
            Layout::Contiguous { addr, .. } if *addr != UNDEF => {
                self.inner.io.read(*addr, bytes).await?
            }
            Layout::Contiguous { .. } => bytes::Bytes::new(),
            Layout::Chunked { .. } => {
                return Err(Error::Unsupported(format!("{}: chunked string dataset", ds.path)));
            }
        };

        group::decode_value(self.inner.groups.meta(), &t, &raw, ds.size()).await
    }

    /// Attributes of the object at `path`.
    pub async fn attributes(&self, path: &str) -> Result<Vec<Attribute>> {
        self.inner.groups.attributes(path).await
    }

    pub fn streaming_stats(&self) -> StreamingStats {
        self.inner.io.controller().stats()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<StreamingStats> {
        self.inner.io.controller().subscribe()
    }

    /// Drop cached chunks and indices and reset the statistics. The reader can still be used
    /// afterwards; everything is fetched again.
    pub fn close(&self) {
        self.inner.fetcher.cache().clear();
        self.inner.resolver.clear();
        self.inner.io.controller().reset();
        log::debug!("{}: closed", self.origin());
    }
}
