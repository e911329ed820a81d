//! Data layout message: how the raw data of a dataset is stored.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::object_header::Message;
use super::{Parser, Sizes, UNDEF};
use crate::error::{Error, Result};

/// Index structure mapping chunk coordinates to chunk addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Version 1 B-tree (node type 1), layout message versions 1 to 3.
    BTreeV1,

    /// The dataset has exactly one chunk. `filtered` carries the stored size and filter mask.
    SingleChunk { filtered: Option<(u64, u32)> },

    /// Unfiltered chunks stored back to back in row-major order of the chunk grid.
    Implicit,

    FixedArray { page_bits: u8 },

    ExtensibleArray,

    /// Version 2 B-tree with chunk records (types 10 and 11).
    BTreeV2 { node_size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Compact {
        data: Bytes,
    },
    Contiguous {
        addr: u64,

        /// Size in bytes, not stored by layout messages before version 3.
        size: Option<u64>,
    },
    Chunked {
        /// Chunk shape, one entry per dataset dimension.
        chunk_dims: Vec<u64>,
        element_size: u32,
        index: IndexKind,

        /// Address of the index structure, `UNDEF` when no chunk is allocated.
        index_addr: u64,
    },
}

impl Layout {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<Layout> {
        let mut p = m.parser(sizes);
        let version = p.u8()?;

        match version {
            1 | 2 => Layout::parse_v1(&mut p),
            3 | 4 => Layout::parse_v3(&mut p, version),
            v => Err(p.error(format!("data layout version {v}"))),
        }
    }

    fn split_dims(p: &Parser, dims: Vec<u64>) -> Result<(Vec<u64>, u32)> {
        match dims.split_last() {
            Some((esz, chunk)) if !chunk.is_empty() => Ok((chunk.to_vec(), *esz as u32)),
            _ => Err(p.error("chunked layout without dimensions")),
        }
    }

    fn parse_v1(p: &mut Parser) -> Result<Layout> {
        let ndims = p.u8()? as usize;
        let class = p.u8()?;
        p.skip(5)?;

        let addr = if class != 0 { p.offset()? } else { UNDEF };
        let dims = (0..ndims)
            .map(|_| p.u32().map(|d| d as u64))
            .collect::<Result<Vec<_>>>()?;

        match class {
            0 => {
                let size = p.u32()? as usize;
                Ok(Layout::Compact {
                    data: Bytes::copy_from_slice(p.bytes(size)?),
                })
            }
            1 => Ok(Layout::Contiguous { addr, size: None }),
            2 => {
                let (chunk_dims, _) = Layout::split_dims(p, dims)?;
                let element_size = p.u32()?;
                Ok(Layout::Chunked {
                    chunk_dims,
                    element_size,
                    index: IndexKind::BTreeV1,
                    index_addr: addr,
                })
            }
            c => Err(p.error(format!("layout class {c}"))),
        }
    }

    fn parse_v3(p: &mut Parser, version: u8) -> Result<Layout> {
        let class = p.u8()?;

        match class {
            0 => {
                let size = p.u16()? as usize;
                Ok(Layout::Compact {
                    data: Bytes::copy_from_slice(p.bytes(size)?),
                })
            }
            1 => Ok(Layout::Contiguous {
                addr: p.offset()?,
                size: Some(p.length()?),
            }),
            2 if version == 3 => {
                let ndims = p.u8()? as usize;
                let addr = p.offset()?;
                let dims = (0..ndims)
                    .map(|_| p.u32().map(|d| d as u64))
                    .collect::<Result<Vec<_>>>()?;
                let (chunk_dims, element_size) = Layout::split_dims(p, dims)?;

                Ok(Layout::Chunked {
                    chunk_dims,
                    element_size,
                    index: IndexKind::BTreeV1,
                    index_addr: addr,
                })
            }
            2 => {
                let flags = p.u8()?;
                let ndims = p.u8()? as usize;
                let enc = p.u8()? as usize;
                let dims = (0..ndims)
                    .map(|_| p.uint(enc))
                    .collect::<Result<Vec<_>>>()?;
                let (chunk_dims, element_size) = Layout::split_dims(p, dims)?;

                let index = match p.u8()? {
                    1 => {
                        let filtered = if flags & 0x02 != 0 {
                            Some((p.length()?, p.u32()?))
                        } else {
                            None
                        };
                        IndexKind::SingleChunk { filtered }
                    }
                    2 => IndexKind::Implicit,
                    3 => IndexKind::FixedArray {
                        page_bits: p.u8()?,
                    },
                    4 => {
                        p.skip(5)?;
                        IndexKind::ExtensibleArray
                    }
                    5 => {
                        let node_size = p.u32()?;
                        let _split = p.u8()?;
                        let _merge = p.u8()?;
                        IndexKind::BTreeV2 { node_size }
                    }
                    k => return Err(p.error(format!("chunk index type {k}"))),
                };

                Ok(Layout::Chunked {
                    chunk_dims,
                    element_size,
                    index,
                    index_addr: p.offset()?,
                })
            }
            3 => Err(Error::Unsupported("virtual dataset layout".into())),
            c => Err(p.error(format!("layout class {c}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: Vec<u8>) -> Message {
        Message {
            kind: super::super::object_header::MSG_LAYOUT,
            flags: 0,
            addr: 0,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn chunked_v3() {
        let mut d = vec![3, 2, 3];
        d.extend_from_slice(&0x800u64.to_le_bytes());
        for v in [512u32, 512, 4] {
            d.extend_from_slice(&v.to_le_bytes());
        }

        assert_eq!(
            Layout::parse(&msg(d), Sizes::default()).unwrap(),
            Layout::Chunked {
                chunk_dims: vec![512, 512],
                element_size: 4,
                index: IndexKind::BTreeV1,
                index_addr: 0x800
            }
        );
    }

    #[test]
    fn chunked_v4_btree_v2() {
        let mut d = vec![4, 2, 0, 3, 2];
        for v in [100u16, 200, 8] {
            d.extend_from_slice(&v.to_le_bytes());
        }
        d.push(5);
        d.extend_from_slice(&512u32.to_le_bytes());
        d.extend_from_slice(&[100, 40]);
        d.extend_from_slice(&0x1000u64.to_le_bytes());

        assert_eq!(
            Layout::parse(&msg(d), Sizes::default()).unwrap(),
            Layout::Chunked {
                chunk_dims: vec![100, 200],
                element_size: 8,
                index: IndexKind::BTreeV2 { node_size: 512 },
                index_addr: 0x1000
            }
        );
    }

    #[test]
    fn contiguous_and_compact() {
        let mut d = vec![3, 1];
        d.extend_from_slice(&0x400u64.to_le_bytes());
        d.extend_from_slice(&64u64.to_le_bytes());
        assert_eq!(
            Layout::parse(&msg(d), Sizes::default()).unwrap(),
            Layout::Contiguous {
                addr: 0x400,
                size: Some(64)
            }
        );

        let d = vec![3, 0, 2, 0, 7, 8];
        assert_eq!(
            Layout::parse(&msg(d), Sizes::default()).unwrap(),
            Layout::Compact {
                data: Bytes::from_static(&[7, 8])
            }
        );
    }
}
