//! Building chunk indices on first access, once per dataset.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ChunkDescriptor, ChunkIndex, DatasetDescriptor, IndexState};
use crate::error::{Error, Result};
use crate::filters;
use crate::flight::SingleFlight;
use crate::format::layout::{IndexKind, Layout};
use crate::format::{btree_v1, btree_v2, fixed_array, UNDEF};
use crate::meta::MetaReader;

/// Decode the chunk index of a dataset.
pub async fn build(meta: &MetaReader, ds: &DatasetDescriptor) -> Result<ChunkIndex> {
    filters::check_supported(&ds.filters)?;

    let grid = ds.grid();
    let zero = vec![0; ds.rank()];

    let (chunks, addr) = match &ds.layout {
        Layout::Compact { data } => (
            vec![ChunkDescriptor::new(zero, &ds.chunk_dims, UNDEF, data.len() as u64, 0)],
            ds.addr,
        ),
        Layout::Contiguous { addr, .. } if *addr == UNDEF => (Vec::new(), ds.addr),
        Layout::Contiguous { addr, size } => (
            vec![ChunkDescriptor::new(
                zero,
                &ds.chunk_dims,
                *addr,
                size.unwrap_or(ds.size() * ds.element_size as u64),
                0,
            )],
            *addr,
        ),
        Layout::Chunked { index_addr, .. } if *index_addr == UNDEF => (Vec::new(), ds.addr),
        Layout::Chunked {
            chunk_dims,
            element_size,
            index,
            index_addr,
        } => {
            let addr = *index_addr;

            let chunks = match index {
                IndexKind::BTreeV1 => btree_v1::chunks(meta, addr, chunk_dims).await?,
                IndexKind::BTreeV2 { .. } => {
                    btree_v2::chunks(meta, addr, chunk_dims, *element_size).await?
                }
                IndexKind::FixedArray { .. } => {
                    let n = ds.index_grid().iter().product();
                    let entries = fixed_array::entries(meta, addr, n, ds.chunk_bytes()).await?;

                    ds.all_chunks()
                        .into_iter()
                        .filter_map(|c| {
                            let e = entries.get(ds.chunk_linear(&c) as usize).copied().flatten()?;
                            Some(ChunkDescriptor::new(c, chunk_dims, e.addr, e.size, e.filter_mask))
                        })
                        .collect()
                }
                IndexKind::SingleChunk { filtered } => {
                    let (size, mask) = filtered.unwrap_or((ds.chunk_bytes(), 0));
                    vec![ChunkDescriptor::new(zero, chunk_dims, addr, size, mask)]
                }
                IndexKind::Implicit => {
                    let bytes = ds.chunk_bytes();

                    ds.all_chunks()
                        .into_iter()
                        .map(|c| {
                            let caddr = ds
                                .chunk_linear(&c)
                                .checked_mul(bytes)
                                .and_then(|o| o.checked_add(addr))
                                .ok_or_else(|| {
                                    Error::format(addr, format!("chunk {c:?} past the address space"))
                                })?;
                            Ok(ChunkDescriptor::new(c, chunk_dims, caddr, bytes, 0))
                        })
                        .collect::<Result<Vec<_>>>()?
                }
                IndexKind::ExtensibleArray => {
                    return Err(Error::Unsupported(format!(
                        "{}: extensible array chunk index",
                        ds.path
                    )));
                }
            };

            (chunks, addr)
        }
    };

    let index = ChunkIndex::new(chunks, &grid, addr)?;

    log::debug!(
        "{}: {} of {} chunks allocated ({} bytes stored)",
        ds.path,
        index.len(),
        ds.num_chunks(),
        index.stored_bytes()
    );

    Ok(index)
}

/// Memoized, single-flight chunk index resolution.
///
/// An index that fails to build with `Unsupported` is remembered as such. Other failures are not
/// remembered, so the next access tries again.
pub struct ChunkIndexResolver {
    meta: Arc<MetaReader>,
    loaded: Mutex<HashMap<String, std::result::Result<Arc<ChunkIndex>, Error>>>,
    flight: SingleFlight<String, Arc<ChunkIndex>>,
}

impl ChunkIndexResolver {
    pub fn new(meta: Arc<MetaReader>) -> ChunkIndexResolver {
        ChunkIndexResolver {
            meta,
            loaded: Mutex::new(HashMap::new()),
            flight: SingleFlight::new(),
        }
    }

    fn memoized(&self, path: &str) -> Option<Result<Arc<ChunkIndex>>> {
        self.loaded.lock().ok()?.get(path).cloned()
    }

    pub async fn resolve(&self, ds: &Arc<DatasetDescriptor>) -> Result<Arc<ChunkIndex>> {
        if let Some(r) = self.memoized(&ds.path) {
            return r;
        }

        let meta = Arc::clone(&self.meta);
        let d = Arc::clone(ds);

        let r = self
            .flight
            .run(ds.path.clone(), async move {
                build(&meta, &d).await.map(Arc::new)
            })
            .await;

        match &r {
            Ok(_) => {
                if let Ok(mut l) = self.loaded.lock() {
                    l.insert(ds.path.clone(), r.clone());
                }
            }
            Err(e) if e.is_unsupported() => {
                log::warn!("{}: {}", ds.path, e);
                if let Ok(mut l) = self.loaded.lock() {
                    l.insert(ds.path.clone(), r.clone());
                }
            }
            Err(e) => log::warn!("{}: could not resolve chunk index: {}", ds.path, e),
        }

        r
    }

    pub fn state(&self, path: &str) -> IndexState {
        match self.memoized(path) {
            Some(Ok(_)) => IndexState::Loaded,
            Some(Err(_)) => IndexState::Unsupported,
            None if self.flight.is_pending(&path.to_string()) => IndexState::Loading,
            None => IndexState::NotLoaded,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut l) = self.loaded.lock() {
            l.clear();
        }
    }
}
