//! Version 2 B-trees (`BTHD`, `BTIN`, `BTLF`).
//!
//! Internal nodes store, per child, the child address, the number of records in the child and
//! (below the top two levels) the total number of records under the child. The widths of those
//! counts are not stored: they follow from the node size, record size and depth.
use bytes::Bytes;
use std::collections::HashSet;

use super::{enc_size, Parser, Sizes, UNDEF};
use crate::error::{Error, Result};
use crate::idx::ChunkDescriptor;
use crate::meta::MetaReader;

/// Signature, version, type and checksum.
const PREFIX: u64 = 4 + 1 + 1 + 4;

pub const TYPE_LINK_NAME: u8 = 5;
pub const TYPE_CHUNK: u8 = 10;
pub const TYPE_CHUNK_FILTERED: u8 = 11;

#[derive(Debug, Clone)]
pub struct Header {
    pub addr: u64,
    pub kind: u8,
    pub node_size: u32,
    pub record_size: u16,
    pub depth: u16,
    pub root_addr: u64,
    pub root_records: u16,
    pub total_records: u64,

    /// Per depth: maximum records in a node, and bytes needed for the total record count
    /// below a node.
    max_records: Vec<u64>,
    total_records_size: Vec<usize>,
    count_size: usize,
}

impl Header {
    pub async fn read(meta: &MetaReader, addr: u64) -> Result<Header> {
        let sizes = meta.sizes();
        let len = 4 + 1 + 1 + 4 + 2 + 2 + 1 + 1 + sizes.offset as u64 + 2 + sizes.length as u64 + 4;
        let data = meta.read(addr, len).await?;

        let mut p = Parser::new(&data, addr, sizes);
        p.signature(b"BTHD")?;
        let version = p.u8()?;
        if version != 0 {
            return Err(p.error(format!("B-tree v2 header version {version}")));
        }

        let kind = p.u8()?;
        let node_size = p.u32()?;
        let record_size = p.u16()?;
        let depth = p.u16()?;
        let _split = p.u8()?;
        let _merge = p.u8()?;
        let root_addr = p.offset()?;
        let root_records = p.u16()?;
        let total_records = p.length()?;
        p.checksum()?;

        Header::new(
            addr,
            kind,
            node_size,
            record_size,
            depth,
            root_addr,
            root_records,
            total_records,
            sizes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        addr: u64,
        kind: u8,
        node_size: u32,
        record_size: u16,
        depth: u16,
        root_addr: u64,
        root_records: u16,
        total_records: u64,
        sizes: Sizes,
    ) -> Result<Header> {
        if record_size == 0 || (node_size as u64) <= PREFIX + record_size as u64 {
            return Err(Error::format(
                addr,
                format!("B-tree v2 node size {node_size} for records of {record_size} bytes"),
            ));
        }

        let rec = record_size as u64;
        let leaf_max = (node_size as u64 - PREFIX) / rec;
        let count_size = enc_size(leaf_max);

        let mut max_records = vec![leaf_max];
        let mut cum_max = vec![leaf_max];
        let mut total_records_size = vec![0];

        for d in 1..=depth as usize {
            let ptr = Header::pointer_size(sizes, count_size, &total_records_size, d) as u64;
            let avail = (node_size as u64).saturating_sub(PREFIX + ptr);
            let max = avail / (rec + ptr);

            if max == 0 {
                return Err(Error::format(addr, "B-tree v2 nodes too small for depth"));
            }

            let cum = (max + 1).saturating_mul(cum_max[d - 1]).saturating_add(max);

            max_records.push(max);
            cum_max.push(cum);
            total_records_size.push(enc_size(cum));
        }

        Ok(Header {
            addr,
            kind,
            node_size,
            record_size,
            depth,
            root_addr,
            root_records,
            total_records,
            max_records,
            total_records_size,
            count_size,
        })
    }

    fn pointer_size(sizes: Sizes, count_size: usize, total_size: &[usize], depth: usize) -> usize {
        sizes.offset as usize
            + count_size
            + if depth > 1 {
                total_size[depth - 1]
            } else {
                0
            }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChildPointer {
    addr: u64,
    records: u64,
}

/// A node with its records, and children if it is internal.
#[derive(Debug)]
struct Node {
    records: Vec<Bytes>,
    children: Vec<ChildPointer>,
}

async fn read_node(
    meta: &MetaReader,
    hdr: &Header,
    addr: u64,
    records: u64,
    depth: u16,
) -> Result<Node> {
    let sizes = meta.sizes();
    let internal = depth > 0;

    if records > hdr.max_records[depth as usize] {
        return Err(Error::format(
            addr,
            format!("B-tree v2 node with {records} records"),
        ));
    }

    let ptr = if internal {
        Header::pointer_size(sizes, hdr.count_size, &hdr.total_records_size, depth as usize)
            as u64
    } else {
        0
    };

    let children = if internal { records + 1 } else { 0 };
    let len = 6 + records * hdr.record_size as u64 + children * ptr + 4;
    let data = meta.read(addr, len).await?;

    let mut p = Parser::new(&data, addr, sizes);
    p.signature(if internal { b"BTIN" } else { b"BTLF" })?;
    let version = p.u8()?;
    let kind = p.u8()?;
    if version != 0 || kind != hdr.kind {
        return Err(p.error(format!(
            "B-tree v2 node version {version} type {kind} in tree of type {}",
            hdr.kind
        )));
    }

    let recs = (0..records)
        .map(|_| {
            p.bytes(hdr.record_size as usize)
                .map(Bytes::copy_from_slice)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut ptrs = Vec::with_capacity(children as usize);
    for _ in 0..children {
        let caddr = p.offset()?;
        let nrec = p.uint(hdr.count_size)?;
        if depth > 1 {
            let _total = p.uint(hdr.total_records_size[depth as usize - 1])?;
        }
        ptrs.push(ChildPointer {
            addr: caddr,
            records: nrec,
        });
    }

    p.checksum()?;

    Ok(Node {
        records: recs,
        children: ptrs,
    })
}

/// Visit records, descending into a child only if `wanted` says its key range may match.
///
/// `wanted(lower, upper)` receives the records bounding the child on each side.
pub async fn search<F>(meta: &MetaReader, hdr: &Header, mut wanted: F) -> Result<Vec<Bytes>>
where
    F: FnMut(Option<&[u8]>, Option<&[u8]>) -> bool,
{
    let mut out = Vec::new();

    if hdr.root_addr == UNDEF || hdr.root_records == 0 {
        return Ok(out);
    }

    let mut visited = HashSet::new();
    let mut stack = vec![(hdr.root_addr, hdr.root_records as u64, hdr.depth)];

    while let Some((addr, records, depth)) = stack.pop() {
        if !visited.insert(addr) {
            return Err(Error::format(addr, "B-tree v2 node visited twice"));
        }

        let node = read_node(meta, hdr, addr, records, depth).await?;

        for (i, c) in node.children.iter().enumerate() {
            let lower = i.checked_sub(1).map(|j| &node.records[j][..]);
            let upper = node.records.get(i).map(|r| &r[..]);

            if wanted(lower, upper) {
                stack.push((c.addr, c.records, depth - 1));
            }
        }

        out.extend(node.records);
    }

    Ok(out)
}

/// All records in the tree.
pub async fn records(meta: &MetaReader, hdr: &Header) -> Result<Vec<Bytes>> {
    search(meta, hdr, |_, _| true).await
}

/// Decode the chunk records of a chunk index tree.
pub async fn chunks(
    meta: &MetaReader,
    addr: u64,
    chunk_dims: &[u64],
    element_size: u32,
) -> Result<Vec<ChunkDescriptor>> {
    let sizes = meta.sizes();
    let hdr = Header::read(meta, addr).await?;
    let rank = chunk_dims.len();

    let chunk_bytes = chunk_dims.iter().product::<u64>() * element_size as u64;

    let size_width = match hdr.kind {
        TYPE_CHUNK => 0,
        TYPE_CHUNK_FILTERED => (hdr.record_size as usize)
            .checked_sub(sizes.offset as usize + 4 + 8 * rank)
            .filter(|w| (1..=8).contains(w))
            .ok_or_else(|| {
                Error::format(addr, format!("record size {} for rank {rank}", hdr.record_size))
            })?,
        k => {
            return Err(Error::format(
                addr,
                format!("B-tree v2 of type {k} used as chunk index"),
            ))
        }
    };

    let records = records(meta, &hdr).await?;
    let mut out = Vec::with_capacity(records.len());

    for r in records {
        let mut p = Parser::new(&r, addr, sizes);
        let caddr = p.offset()?;

        let (size, mask) = if hdr.kind == TYPE_CHUNK_FILTERED {
            (p.uint(size_width)?, p.u32()?)
        } else {
            (chunk_bytes, 0)
        };

        let coord = (0..rank).map(|_| p.u64()).collect::<Result<Vec<_>>>()?;

        if caddr != UNDEF {
            out.push(ChunkDescriptor::new(coord, chunk_dims, caddr, size, mask));
        }
    }

    log::debug!(
        "B-tree v2 at {:#x}: depth {}, {} chunks",
        addr,
        hdr.depth,
        out.len()
    );

    Ok(out)
}

/// A link name record: hash of the name and the heap id of the link in the fractal heap.
pub fn link_name_record(r: &[u8]) -> Result<(u32, &[u8])> {
    if r.len() < 4 + 7 {
        return Err(Error::format(0, "short link name record"));
    }
    Ok((u32::from_le_bytes([r[0], r[1], r[2], r[3]]), &r[4..11]))
}
