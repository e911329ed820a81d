//! Local heaps (names of old style groups), symbol table nodes and global heap collections
//! (variable length data).
use bytes::Bytes;

use super::{Parser, Sizes};
use crate::error::{Error, Result};
use crate::meta::MetaReader;

/// The data segment of a local heap.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub data: Bytes,
}

impl LocalHeap {
    pub async fn read(meta: &MetaReader, addr: u64) -> Result<LocalHeap> {
        let sizes = meta.sizes();
        let len = 4 + 4 + 2 * sizes.length as u64 + sizes.offset as u64;
        let hdr = meta.read(addr, len).await?;

        let mut p = Parser::new(&hdr, addr, sizes);
        p.signature(b"HEAP")?;
        let version = p.u8()?;
        if version != 0 {
            return Err(p.error(format!("local heap version {version}")));
        }
        p.skip(3)?;
        let size = p.length()?;
        let _free_list = p.length()?;
        let data_addr = p.offset()?;

        Ok(LocalHeap {
            data: meta.read(data_addr, size).await?,
        })
    }

    /// The NUL terminated string at `offset` in the data segment.
    pub fn name(&self, offset: u64) -> Result<&[u8]> {
        super::cstring_at(&self.data, offset as usize)
            .ok_or_else(|| Error::format(offset, "name offset outside local heap"))
    }
}

/// One entry of a symbol table node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name_offset: u64,
    pub header_addr: u64,
}

pub fn symbol_entry_size(sizes: Sizes) -> u64 {
    2 * sizes.offset as u64 + 24
}

/// Read a symbol table node (`SNOD`), the leaves of an old style group's B-tree.
pub async fn read_symbol_node(meta: &MetaReader, addr: u64) -> Result<Vec<SymbolEntry>> {
    let sizes = meta.sizes();
    let hdr = meta.read(addr, 8).await?;

    let mut p = Parser::new(&hdr, addr, sizes);
    p.signature(b"SNOD")?;
    let version = p.u8()?;
    if version != 1 {
        return Err(p.error(format!("symbol table node version {version}")));
    }
    p.skip(1)?;
    let n = p.u16()? as u64;

    let data = meta.read(addr + 8, n * symbol_entry_size(sizes)).await?;
    let mut p = Parser::new(&data, addr + 8, sizes);

    (0..n)
        .map(|_| {
            let name_offset = p.offset()?;
            let header_addr = p.offset()?;
            p.skip(24)?;
            Ok(SymbolEntry {
                name_offset,
                header_addr,
            })
        })
        .collect()
}

/// Reference to an object in a global heap collection, as stored in variable length elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHeapId {
    pub collection: u64,
    pub index: u32,
}

impl GlobalHeapId {
    /// Decode a variable length element: sequence length, collection address, object index.
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<(u32, GlobalHeapId)> {
        let mut p = Parser::new(data, 0, sizes);
        let len = p.u32()?;
        let collection = p.offset()?;
        let index = p.u32()?;
        Ok((len, GlobalHeapId { collection, index }))
    }
}

/// Read one object from a global heap collection.
pub async fn read_global(meta: &MetaReader, id: GlobalHeapId) -> Result<Bytes> {
    let sizes = meta.sizes();
    let hdr = meta.read(id.collection, 8 + sizes.length as u64).await?;

    let mut p = Parser::new(&hdr, id.collection, sizes);
    p.signature(b"GCOL")?;
    let version = p.u8()?;
    if version != 1 {
        return Err(p.error(format!("global heap version {version}")));
    }
    p.skip(3)?;
    let size = p.length()?;

    let data = meta.read(id.collection, size).await?;
    let mut p = Parser::new(&data, id.collection, sizes);
    p.skip(8 + sizes.length as usize)?;

    while p.remaining() >= 8 + sizes.length as usize {
        let index = p.u16()?;
        let _refcount = p.u16()?;
        p.skip(4)?;
        let len = p.length()?;

        if index == 0 {
            // Free space, the rest of the collection.
            break;
        }

        if index as u32 == id.index {
            return Ok(Bytes::copy_from_slice(p.bytes(len as usize)?));
        }

        p.skip(((len + 7) & !7) as usize)?;
    }

    Err(Error::NotFound(format!(
        "global heap object {} in collection {:#x}",
        id.index, id.collection
    )))
}
