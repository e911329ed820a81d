//! Datasets and their chunk indices.
mod chunk;
mod dataset;
mod index;
pub mod resolve;

pub use chunk::ChunkDescriptor;
pub use dataset::{trim_string, DatasetDescriptor, Datatype, Element, TypedArray};
pub(crate) use dataset::with_values;
pub use index::{ChunkIndex, IndexState};
pub use resolve::ChunkIndexResolver;

#[cfg(test)]
pub(crate) use dataset::tests::test_dataset;
