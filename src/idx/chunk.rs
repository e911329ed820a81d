use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// A stored chunk of a dataset. A chunk is read and decoded in its entirety since it is
/// usually compressed.
///
/// [HDF5 chunking](https://support.hdfgroup.org/HDF5/doc/Advanced/Chunking/index.html).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Position in the chunk grid, one entry per dataset dimension.
    pub coord: Vec<u64>,

    /// Element offset of the first element of the chunk.
    pub offset: Vec<u64>,

    /// File address.
    pub addr: u64,

    /// Stored size in bytes.
    pub size: u64,

    /// Filters with their bit set were not applied to this chunk.
    pub filter_mask: u32,
}

impl ChunkDescriptor {
    pub fn new(
        coord: Vec<u64>,
        chunk_dims: &[u64],
        addr: u64,
        size: u64,
        filter_mask: u32,
    ) -> ChunkDescriptor {
        let offset = coord.iter().zip(chunk_dims).map(|(c, d)| c * d).collect();

        ChunkDescriptor {
            coord,
            offset,
            addr,
            size,
            filter_mask,
        }
    }

    /// From the element offsets stored in version 1 B-tree keys. Offsets must be aligned to the
    /// chunk shape.
    pub fn from_offsets(
        offsets: &[u64],
        chunk_dims: &[u64],
        addr: u64,
        size: u64,
        filter_mask: u32,
    ) -> Result<ChunkDescriptor> {
        if offsets.len() != chunk_dims.len() {
            return Err(Error::format(
                addr,
                format!(
                    "chunk offset of rank {} for chunks of rank {}",
                    offsets.len(),
                    chunk_dims.len()
                ),
            ));
        }

        let coord = offsets
            .iter()
            .zip(chunk_dims)
            .map(|(o, d)| {
                if *d == 0 || o % d != 0 {
                    Err(Error::format(
                        addr,
                        format!("chunk offset {offsets:?} not aligned to {chunk_dims:?}"),
                    ))
                } else {
                    Ok(o / d)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChunkDescriptor {
            coord,
            offset: offsets.to_vec(),
            addr,
            size,
            filter_mask,
        })
    }
}

impl Ord for ChunkDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.coord
            .cmp(&other.coord)
            .then_with(|| self.addr.cmp(&other.addr))
    }
}

impl PartialOrd for ChunkDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
