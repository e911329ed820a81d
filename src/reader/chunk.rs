//! Fetching, unfiltering and decoding single chunks.
use bytes::Bytes;
use std::sync::Arc;

use super::cache::ChunkCache;
use super::io::Io;
use crate::error::{Error, Result};
use crate::filters;
use crate::flight::SingleFlight;
use crate::format::layout::Layout;
use crate::idx::{ChunkDescriptor, ChunkIndex, DatasetDescriptor, TypedArray};

/// Undo the filters of a stored chunk and decode it to the type of the dataset.
pub fn decode_chunk(ds: &DatasetDescriptor, c: &ChunkDescriptor, raw: Bytes) -> Result<TypedArray> {
    let expected = ds.chunk_bytes() as usize;

    let data = if ds.filters.is_empty() {
        raw
    } else {
        filters::unfilter(
            &ds.filters,
            c.filter_mask,
            raw,
            expected,
            ds.element_size as usize,
            c.addr,
        )?
    };

    if data.len() < expected {
        return Err(Error::format(
            c.addr,
            format!(
                "{}: chunk {:?} of {} bytes, expected {}",
                ds.path,
                c.coord,
                data.len(),
                expected
            ),
        ));
    }

    TypedArray::decode(ds.dtype, ds.order, &data[..expected])
}

/// Read the stored bytes of a chunk and decode them.
pub async fn read_chunk(io: &Io, ds: &DatasetDescriptor, c: &ChunkDescriptor) -> Result<TypedArray> {
    let raw = match &ds.layout {
        Layout::Compact { data } => data.clone(),
        _ => io.read(c.addr, c.size).await?,
    };

    decode_chunk(ds, c, raw)
}

/// Fetches chunks through the cache, with at most one fetch in flight per chunk. A fetch runs
/// as its own task and fills the cache even when the caller stops waiting for it.
pub struct ChunkFetcher {
    io: Arc<Io>,
    cache: Arc<ChunkCache>,
    flight: SingleFlight<(String, Vec<u64>), Arc<TypedArray>>,
}

impl ChunkFetcher {
    pub fn new(io: Arc<Io>, cache: Arc<ChunkCache>) -> ChunkFetcher {
        ChunkFetcher {
            io,
            cache,
            flight: SingleFlight::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flight.in_flight()
    }

    /// The chunk at `coord`, `None` if it was never written.
    pub async fn fetch(
        &self,
        ds: &Arc<DatasetDescriptor>,
        index: &ChunkIndex,
        coord: &[u64],
    ) -> Result<Option<Arc<TypedArray>>> {
        if !ds.valid_coord(coord) {
            return Err(Error::Invalid(format!(
                "{}: chunk {:?} outside chunk grid {:?}",
                ds.path,
                coord,
                ds.grid()
            )));
        }

        if let Some(a) = self.cache.get_memory(&ds.path, coord) {
            return Ok(Some(a));
        }

        let Some(c) = index.get(coord).cloned() else {
            return Ok(None);
        };

        let io = Arc::clone(&self.io);
        let cache = Arc::clone(&self.cache);
        let d = Arc::clone(ds);

        self.flight
            .run((ds.path.clone(), coord.to_vec()), async move {
                // Filled by a fetch that finished after the lookup above, or on disk.
                if let Some(a) = cache.get(&d.path, &c.coord).await {
                    return Ok(a);
                }

                let a = Arc::new(read_chunk(&io, &d, &c).await?);
                cache.insert(&d.path, &c.coord, Arc::clone(&a)).await;
                Ok(a)
            })
            .await
            .map(Some)
    }
}
