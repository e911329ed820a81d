//! Fractal heaps (`FRHP`, `FHDB`, `FHIB`): storage for dense links.
//!
//! Only managed and tiny objects are supported. Huge objects and heaps with I/O filters are
//! rejected as unsupported.
use bytes::Bytes;

use super::checksum::lookup3;
use super::{log2, Parser, UNDEF};
use crate::error::{Error, Result};
use crate::meta::MetaReader;

#[derive(Debug, Clone)]
pub struct FractalHeap {
    pub addr: u64,
    pub id_len: u16,
    pub max_managed: u32,
    pub table_width: u16,
    pub start_block: u64,
    pub max_direct: u64,
    pub max_heap_bits: u16,
    pub root_addr: u64,

    /// Rows in the root indirect block, 0 if the root is a direct block.
    pub root_rows: u16,

    checksum_direct: bool,
    off_size: usize,
    len_size: usize,
}

impl FractalHeap {
    pub async fn read(meta: &MetaReader, addr: u64) -> Result<FractalHeap> {
        let sizes = meta.sizes();
        let (o, l) = (sizes.offset as u64, sizes.length as u64);
        let len = 4 + 1 + 2 + 2 + 1 + 4 + 3 * o + 12 * l + 4 * 2 + 4;
        let data = meta.read(addr, len).await?;

        let mut p = Parser::new(&data, addr, sizes);
        p.signature(b"FRHP")?;
        let version = p.u8()?;
        if version != 0 {
            return Err(p.error(format!("fractal heap version {version}")));
        }

        let id_len = p.u16()?;
        let filter_len = p.u16()?;
        let flags = p.u8()?;
        let max_managed = p.u32()?;
        let _next_huge = p.length()?;
        let _huge_btree = p.offset()?;
        let _free = p.length()?;
        let _free_manager = p.offset()?;
        let _managed = p.length()?;
        let _allocated = p.length()?;
        let _iter = p.length()?;
        let _managed_count = p.length()?;
        let _huge_size = p.length()?;
        let _huge_count = p.length()?;
        let _tiny_size = p.length()?;
        let _tiny_count = p.length()?;
        let table_width = p.u16()?;
        let start_block = p.length()?;
        let max_direct = p.length()?;
        let max_heap_bits = p.u16()?;
        let _start_rows = p.u16()?;
        let root_addr = p.offset()?;
        let root_rows = p.u16()?;

        if filter_len > 0 {
            return Err(Error::Unsupported(format!(
                "fractal heap at {addr:#x} with I/O filters"
            )));
        }

        p.checksum()?;

        if table_width == 0
            || !start_block.is_power_of_two()
            || !max_direct.is_power_of_two()
            || max_direct < start_block
            || max_heap_bits == 0
            || max_heap_bits > 64
        {
            return Err(Error::format(addr, "inconsistent fractal heap table"));
        }

        let off_size = (max_heap_bits as usize).div_ceil(8);
        let len_size = (log2(max_direct) as usize)
            .div_ceil(8)
            .min(super::enc_size(max_managed as u64));

        Ok(FractalHeap {
            addr,
            id_len,
            max_managed,
            table_width,
            start_block,
            max_direct,
            max_heap_bits,
            root_addr,
            root_rows,
            checksum_direct: flags & 0x02 != 0,
            off_size,
            len_size,
        })
    }

    /// Size of the blocks in `row`.
    fn row_size(&self, row: u32) -> u64 {
        match row {
            0 | 1 => self.start_block,
            r => self.start_block << (r - 1),
        }
    }

    /// Number of rows of direct blocks an indirect block may have.
    fn max_direct_rows(&self) -> u32 {
        log2(self.max_direct) - log2(self.start_block) + 2
    }

    /// Rows in an indirect block of `size` bytes (as stored in an indirect block row).
    fn indirect_rows(&self, size: u64) -> u32 {
        log2(size) - log2(self.start_block * self.table_width as u64) + 1
    }

    fn direct_header_size(&self, sizes: super::Sizes) -> u64 {
        4 + 1 + sizes.offset as u64 + self.off_size as u64 + if self.checksum_direct { 4 } else { 0 }
    }

    /// Read the object identified by the heap id `id`.
    pub async fn object(&self, meta: &MetaReader, id: &[u8]) -> Result<Bytes> {
        let first = *id
            .first()
            .ok_or_else(|| Error::format(self.addr, "empty fractal heap id"))?;

        if first >> 6 != 0 {
            return Err(Error::format(self.addr, "fractal heap id version"));
        }

        match (first >> 4) & 0x03 {
            0 => {
                let mut p = Parser::new(&id[1..], self.addr, meta.sizes());
                let offset = p.uint(self.off_size)?;
                let len = p.uint(self.len_size)?;
                self.managed(meta, offset, len).await
            }
            1 => Err(Error::Unsupported("huge fractal heap objects".into())),
            2 => {
                let (len, start) = if self.id_len > 18 {
                    let hi = (first & 0x0f) as usize;
                    let lo = *id.get(1).unwrap_or(&0) as usize;
                    (((hi << 8) | lo) + 1, 2)
                } else {
                    ((first & 0x0f) as usize + 1, 1)
                };

                id.get(start..start + len)
                    .map(Bytes::copy_from_slice)
                    .ok_or_else(|| Error::format(self.addr, "tiny object exceeds heap id"))
            }
            t => Err(Error::format(self.addr, format!("fractal heap id type {t}"))),
        }
    }

    async fn managed(&self, meta: &MetaReader, offset: u64, len: u64) -> Result<Bytes> {
        if self.root_addr == UNDEF {
            return Err(Error::format(self.addr, "object in empty fractal heap"));
        }

        if len == 0 || len > self.max_managed as u64 {
            return Err(Error::format(
                self.addr,
                format!("managed object of {len} bytes"),
            ));
        }

        let (block, block_offset, size) = if self.root_rows == 0 {
            (self.root_addr, 0, self.start_block)
        } else {
            self.locate(meta, offset).await?
        };

        let data = self.direct_block(meta, block, block_offset, size).await?;

        let start = (offset - block_offset) as usize;
        let end = start + len as usize;

        if start < self.direct_header_size(meta.sizes()) as usize || end > data.len() {
            return Err(Error::format(
                block,
                format!("object at heap offset {offset} outside its direct block"),
            ));
        }

        Ok(data.slice(start..end))
    }

    /// Descend the indirect blocks from the root to the direct block holding `offset`.
    ///
    /// Returns the address, heap offset and size of the direct block.
    async fn locate(&self, meta: &MetaReader, offset: u64) -> Result<(u64, u64, u64)> {
        let sizes = meta.sizes();
        let width = self.table_width as u64;
        let max_direct_rows = self.max_direct_rows();

        let mut addr = self.root_addr;
        let mut rows = self.root_rows as u32;
        let mut block_offset = 0u64;

        for _ in 0..64 {
            let direct_rows = rows.min(max_direct_rows);
            let entries = rows as u64 * width;

            let len = 4 + 1 + sizes.offset as u64 + self.off_size as u64
                + entries * sizes.offset as u64
                + 4;
            let data = meta.read(addr, len).await?;

            let mut p = Parser::new(&data, addr, sizes);
            p.signature(b"FHIB")?;
            let version = p.u8()?;
            if version != 0 {
                return Err(p.error(format!("indirect block version {version}")));
            }
            let _heap = p.offset()?;
            let stored_offset = p.uint(self.off_size)?;
            if stored_offset != block_offset {
                return Err(p.error(format!(
                    "indirect block at heap offset {stored_offset}, expected {block_offset}"
                )));
            }

            let children = (0..entries)
                .map(|_| p.offset())
                .collect::<Result<Vec<_>>>()?;
            p.checksum()?;

            // Find the row and column holding the offset.
            let rel = offset - block_offset;
            let mut row_start = 0;
            let mut found = None;

            for row in 0..rows {
                let bsize = self.row_size(row);
                let span = bsize * width;

                if rel < row_start + span {
                    let col = (rel - row_start) / bsize;
                    found = Some((row, col, block_offset + row_start + col * bsize, bsize));
                    break;
                }
                row_start += span;
            }

            let (row, col, child_offset, bsize) = found.ok_or_else(|| {
                Error::format(addr, format!("heap offset {offset} beyond indirect block"))
            })?;

            let child = children[(row as u64 * width + col) as usize];
            if child == UNDEF {
                return Err(Error::format(
                    addr,
                    format!("heap offset {offset} in unallocated block"),
                ));
            }

            if row < direct_rows {
                return Ok((child, child_offset, bsize));
            }

            addr = child;
            rows = self.indirect_rows(bsize);
            block_offset = child_offset;
        }

        Err(Error::format(self.addr, "fractal heap nested too deep"))
    }

    async fn direct_block(
        &self,
        meta: &MetaReader,
        addr: u64,
        block_offset: u64,
        size: u64,
    ) -> Result<Bytes> {
        let sizes = meta.sizes();
        let data = meta.read(addr, size).await?;

        let mut p = Parser::new(&data, addr, sizes);
        p.signature(b"FHDB")?;
        let version = p.u8()?;
        if version != 0 {
            return Err(p.error(format!("direct block version {version}")));
        }
        let _heap = p.offset()?;
        let stored_offset = p.uint(self.off_size)?;
        if stored_offset != block_offset {
            return Err(p.error(format!(
                "direct block at heap offset {stored_offset}, expected {block_offset}"
            )));
        }

        if self.checksum_direct {
            let at = p.pos();
            let stored = p.u32()?;

            let mut block = data.to_vec();
            block[at..at + 4].fill(0);
            let computed = lookup3(&block, 0);

            if stored != computed {
                return Err(Error::format(addr, "direct block checksum mismatch"));
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::Sizes;
    use crate::reader::concurrency::{ConcurrencyController, ConcurrencyOptions};
    use crate::reader::io::{Io, RetryOptions};
    use crate::source::MemorySource;
    use std::sync::Arc;

    fn meta(data: Vec<u8>) -> MetaReader {
        let io = Arc::new(Io::new(
            Arc::new(MemorySource::new("m", data)),
            Arc::new(ConcurrencyController::new(ConcurrencyOptions::default())),
            RetryOptions::default(),
        ));
        MetaReader::new(io, Bytes::new(), Sizes::default(), 4096, 16)
    }

    /// A heap header with 8 byte heap ids, 256 byte starting blocks and 16 bit heap offsets.
    pub(crate) fn header(root: u64, root_rows: u16, checksum_direct: bool) -> Vec<u8> {
        let mut b = b"FRHP".to_vec();
        b.push(0);
        b.extend_from_slice(&8u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.push(if checksum_direct { 0x02 } else { 0 });
        b.extend_from_slice(&4096u32.to_le_bytes());

        // Huge object id, huge object tree, free space, free space manager.
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&u64::MAX.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&u64::MAX.to_le_bytes());

        // Space and object counters.
        for _ in 0..8 {
            b.extend_from_slice(&0u64.to_le_bytes());
        }

        b.extend_from_slice(&4u16.to_le_bytes());
        b.extend_from_slice(&256u64.to_le_bytes());
        b.extend_from_slice(&1024u64.to_le_bytes());
        b.extend_from_slice(&16u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&root.to_le_bytes());
        b.extend_from_slice(&root_rows.to_le_bytes());
        let sum = lookup3(&b, 0);
        b.extend_from_slice(&sum.to_le_bytes());
        b
    }

    /// A direct block of `size` bytes with `objects` placed at their heap offsets.
    pub(crate) fn direct(
        block_offset: u64,
        size: usize,
        checksum: bool,
        objects: &[(u64, &[u8])],
    ) -> Vec<u8> {
        let mut b = b"FHDB".to_vec();
        b.push(0);
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&(block_offset as u16).to_le_bytes());
        let at = b.len();
        if checksum {
            b.extend_from_slice(&[0; 4]);
        }
        b.resize(size, 0);

        for (off, obj) in objects {
            let s = (off - block_offset) as usize;
            b[s..s + obj.len()].copy_from_slice(obj);
        }

        if checksum {
            let sum = lookup3(&b, 0);
            b[at..at + 4].copy_from_slice(&sum.to_le_bytes());
        }
        b
    }

    pub(crate) fn managed_id(offset: u64, len: u64) -> Vec<u8> {
        let mut id = vec![0u8];
        id.extend_from_slice(&(offset as u16).to_le_bytes());
        // 1024 byte direct blocks need 2 bytes of length.
        id.extend_from_slice(&(len as u16).to_le_bytes());
        id.resize(8, 0);
        id
    }

    #[tokio::test]
    async fn root_direct_block() {
        let mut f = header(256, 0, true);
        f.resize(256, 0);
        f.extend(direct(0, 256, true, &[(40, b"frequencyA")]));

        let m = meta(f);
        let h = FractalHeap::read(&m, 0).await.unwrap();
        assert_eq!(h.off_size, 2);
        assert_eq!(h.len_size, 2);
        assert_eq!(h.max_direct_rows(), 4);

        let obj = h.object(&m, &managed_id(40, 10)).await.unwrap();
        assert_eq!(&obj[..], b"frequencyA");

        // Inside the block header.
        assert!(h.object(&m, &managed_id(2, 4)).await.is_err());
    }

    #[tokio::test]
    async fn indirect_root() {
        // Root indirect block with one row of four 256 byte direct blocks.
        let root_at = 512u64;
        let blocks_at = 1024u64;

        let mut ib = b"FHIB".to_vec();
        ib.push(0);
        ib.extend_from_slice(&0u64.to_le_bytes());
        ib.extend_from_slice(&0u16.to_le_bytes());
        for i in 0..4u64 {
            let a = if i < 2 { blocks_at + 256 * i } else { u64::MAX };
            ib.extend_from_slice(&a.to_le_bytes());
        }
        let sum = lookup3(&ib, 0);
        ib.extend_from_slice(&sum.to_le_bytes());

        let mut f = header(root_at, 1, false);
        f.resize(root_at as usize, 0);
        f.extend(ib);
        f.resize(blocks_at as usize, 0);
        f.extend(direct(0, 256, false, &[(20, b"GCOV")]));
        f.extend(direct(256, 256, false, &[(300, b"grids")]));

        let m = meta(f);
        let h = FractalHeap::read(&m, 0).await.unwrap();

        assert_eq!(&h.object(&m, &managed_id(20, 4)).await.unwrap()[..], b"GCOV");
        assert_eq!(&h.object(&m, &managed_id(300, 5)).await.unwrap()[..], b"grids");

        // Third block is not allocated.
        assert!(h.object(&m, &managed_id(600, 4)).await.is_err());
    }

    #[tokio::test]
    async fn tiny_and_huge_ids() {
        let mut f = header(UNDEF, 0, false);
        f.resize(256, 0);
        let m = meta(f);
        let h = FractalHeap::read(&m, 0).await.unwrap();

        let tiny = [0x20 | 2, b'a', b'b', b'c', 0, 0, 0, 0];
        assert_eq!(&h.object(&m, &tiny).await.unwrap()[..], b"abc");

        let huge = [0x10, 0, 0, 0, 0, 0, 0, 0];
        assert!(h.object(&m, &huge).await.unwrap_err().is_unsupported());
    }
}
