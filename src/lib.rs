//! # h5range
//!
//! A lazy and concurrent reader for HDF5 (and NetCDF 4) files over HTTP byte ranges or local
//! files.
//!
//! Opening a file fetches its head (the metadata budget) and parses the superblock, nothing
//! more. Group trees, dataset headers and chunk indices are read on first access and cached.
//! Chunks are fetched concurrently, with the number of requests in flight adapted to the
//! measured throughput, and at most one fetch in flight per chunk.
//!
//! There are no bindings to the official HDF5 library: the file format is decoded directly,
//! which covers superblocks v0 to v3, v1 and v2 object headers, symbol table, compact and dense
//! groups, and chunk indices stored as v1 or v2 B-trees, fixed arrays, single chunks or implicit
//! indices. Chunks may be compressed with deflate, shuffled, and carry a Fletcher-32 checksum.
//!
//! ## Usage
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> h5range::Result<()> {
//! use h5range::prelude::*;
//!
//! let r = Reader::open_url(
//!     "https://example.com/NISAR_L2_GCOV.h5",
//!     ReaderOptions::default(),
//! )
//! .await?;
//!
//! let hh = "/science/LSAR/GCOV/grids/frequencyA/HHHH";
//! let ds = r.dataset(hh).await?;
//! println!("{}: {:?} in chunks of {:?}", ds.path, ds.shape, ds.chunk_dims);
//!
//! let values = r.read_region(hh, 4000, 2000, 100, 100).await?;
//! println!("{:?}", values.as_slice::<f32>());
//! # Ok(())
//! # }
//! ```
pub mod error;
pub mod extent;
pub mod filters;
pub mod flight;
pub mod format;
pub mod group;
pub mod idx;
pub mod meta;
pub mod reader;
pub mod source;

pub use error::{Error, Result};
pub use extent::{Extent, Extents};
pub use group::{Attribute, Value};
pub use idx::{ChunkIndex, DatasetDescriptor, Datatype, TypedArray};
pub use reader::{Reader, ReaderOptions, RegionRead};

pub mod prelude {
    pub use crate::extent::{Extent, Extents};
    pub use crate::group::Value;
    pub use crate::idx::{DatasetDescriptor, Datatype, TypedArray};
    pub use crate::reader::concurrency::StreamingStats;
    pub use crate::reader::{Reader, ReaderOptions};
    pub use crate::source::ByteRangeSource;
}
