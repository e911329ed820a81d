use serde::{Deserialize, Serialize};

use super::ChunkDescriptor;
use crate::error::{Error, Result};

/// Resolution state of the chunk index of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    NotLoaded,
    Loading,
    Loaded,
    Unsupported,
}

/// Map from chunk coordinate to chunk descriptor for one dataset. Chunks that were never
/// written are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkIndex {
    /// Sorted by coordinate.
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkIndex {
    /// Build an index from decoded chunks. Every coordinate must lie inside `grid` and appear
    /// only once. `addr` is the address of the index structure, used in errors.
    pub fn new(mut chunks: Vec<ChunkDescriptor>, grid: &[u64], addr: u64) -> Result<ChunkIndex> {
        chunks.sort();

        for c in &chunks {
            if c.coord.len() != grid.len() || c.coord.iter().zip(grid).any(|(c, g)| c >= g) {
                return Err(Error::format(
                    addr,
                    format!("chunk {:?} outside chunk grid {:?}", c.coord, grid),
                ));
            }
        }

        if let Some(w) = chunks.windows(2).find(|w| w[0].coord == w[1].coord) {
            return Err(Error::format(
                addr,
                format!("chunk {:?} indexed twice", w[0].coord),
            ));
        }

        Ok(ChunkIndex { chunks })
    }

    pub fn get(&self, coord: &[u64]) -> Option<&ChunkDescriptor> {
        self.chunks
            .binary_search_by(|c| c.coord.as_slice().cmp(coord))
            .ok()
            .map(|i| &self.chunks[i])
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks ordered by coordinate.
    pub fn iter(&self) -> impl Iterator<Item = &ChunkDescriptor> {
        self.chunks.iter()
    }

    /// Total stored size of all chunks.
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}
