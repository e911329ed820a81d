//! Version 1 B-trees (`TREE`): group nodes (type 0) index symbol table nodes by name, chunk
//! nodes (type 1) index raw data chunks by their offset in the dataset.
use std::collections::{HashSet, VecDeque};

use super::{Parser, Sizes, UNDEF};
use crate::error::{Error, Result};
use crate::idx::ChunkDescriptor;
use crate::meta::MetaReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Offset into the group's local heap of the largest name in the child.
    Group(u64),
    Chunk {
        size: u32,
        filter_mask: u32,

        /// Element offset of the chunk, one per dimension plus the trailing element size
        /// dimension.
        offsets: Vec<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub addr: u64,
    pub kind: u8,
    pub level: u8,

    /// `entries + 1` keys.
    pub keys: Vec<Key>,

    /// `entries` children.
    pub children: Vec<u64>,
}

fn key_size(kind: u8, rank: usize, sizes: Sizes) -> u64 {
    match kind {
        0 => sizes.length as u64,
        _ => 4 + 4 + 8 * (rank as u64 + 1),
    }
}

/// Size of the node header: signature, type, level, entries, siblings.
fn header_size(sizes: Sizes) -> u64 {
    8 + 2 * sizes.offset as u64
}

fn parse_key(p: &mut Parser, kind: u8, rank: usize) -> Result<Key> {
    match kind {
        0 => Ok(Key::Group(p.length()?)),
        _ => {
            let size = p.u32()?;
            let filter_mask = p.u32()?;
            let offsets = (0..=rank).map(|_| p.u64()).collect::<Result<Vec<_>>>()?;
            Ok(Key::Chunk {
                size,
                filter_mask,
                offsets,
            })
        }
    }
}

/// Read one node. `rank` is the rank of the dataset for chunk nodes and ignored for group
/// nodes. It must come from the dataspace of the dataset: the entry size depends on it.
pub async fn read_node(meta: &MetaReader, addr: u64, expect: u8, rank: usize) -> Result<Node> {
    let sizes = meta.sizes();
    let hdr = meta.read(addr, header_size(sizes)).await?;

    let mut p = Parser::new(&hdr, addr, sizes);
    p.signature(b"TREE")?;
    let kind = p.u8()?;
    let level = p.u8()?;
    let entries = p.u16()? as u64;

    if kind != expect {
        return Err(p.error(format!("B-tree node type {kind}, expected {expect}")));
    }

    let ksz = key_size(kind, rank, sizes);
    let len = entries * (ksz + sizes.offset as u64) + ksz;
    let body_addr = addr + header_size(sizes);
    let body = meta.read(body_addr, len).await?;

    let mut p = Parser::new(&body, body_addr, sizes);
    let mut keys = Vec::with_capacity(entries as usize + 1);
    let mut children = Vec::with_capacity(entries as usize);

    for _ in 0..entries {
        keys.push(parse_key(&mut p, kind, rank)?);
        children.push(p.offset()?);
    }
    keys.push(parse_key(&mut p, kind, rank)?);

    Ok(Node {
        addr,
        kind,
        level,
        keys,
        children,
    })
}

/// Walk a chunk B-tree and return the descriptors of all allocated chunks.
///
/// Nodes are visited breadth first from an explicit worklist; a node address is never visited
/// twice.
pub async fn chunks(
    meta: &MetaReader,
    root: u64,
    chunk_dims: &[u64],
) -> Result<Vec<ChunkDescriptor>> {
    let rank = chunk_dims.len();
    let mut out = Vec::new();

    if root == UNDEF {
        return Ok(out);
    }

    let mut visited = HashSet::new();
    let mut pending = VecDeque::from([(root, None::<u8>)]);

    while let Some((addr, parent_level)) = pending.pop_front() {
        if !visited.insert(addr) {
            return Err(Error::format(addr, "B-tree node visited twice"));
        }

        let node = read_node(meta, addr, 1, rank).await?;

        if let Some(parent) = parent_level {
            if node.level.checked_add(1) != Some(parent) {
                return Err(Error::format(
                    addr,
                    format!("B-tree node level {} below level {}", node.level, parent),
                ));
            }
        }

        if node.level > 0 {
            pending.extend(node.children.iter().map(|c| (*c, Some(node.level))));
            continue;
        }

        for (key, child) in node.keys.iter().zip(&node.children) {
            if let Key::Chunk {
                size,
                filter_mask,
                offsets,
            } = key
            {
                out.push(ChunkDescriptor::from_offsets(
                    &offsets[..rank],
                    chunk_dims,
                    *child,
                    *size as u64,
                    *filter_mask,
                )?);
            }
        }
    }

    log::debug!(
        "B-tree v1 at {:#x}: {} nodes, {} chunks",
        root,
        visited.len(),
        out.len()
    );

    Ok(out)
}
