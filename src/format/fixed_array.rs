//! Fixed array chunk index (`FAHD`, `FADB`), used for datasets with fixed maximum dimensions.
use super::{Parser, UNDEF};
use crate::error::{Error, Result};
use crate::meta::MetaReader;

/// Client ids of the data block elements.
const CLIENT_CHUNK: u8 = 0;
const CLIENT_CHUNK_FILTERED: u8 = 1;

#[derive(Debug, Clone)]
struct Header {
    client: u8,
    entry_size: u8,
    page_bits: u8,
    entries: u64,
    data_addr: u64,
}

async fn read_header(meta: &MetaReader, addr: u64) -> Result<Header> {
    let sizes = meta.sizes();
    let len = 4 + 1 + 1 + 1 + 1 + sizes.length as u64 + sizes.offset as u64 + 4;
    let data = meta.read(addr, len).await?;

    let mut p = Parser::new(&data, addr, sizes);
    p.signature(b"FAHD")?;
    let version = p.u8()?;
    if version != 0 {
        return Err(p.error(format!("fixed array header version {version}")));
    }

    let hdr = Header {
        client: p.u8()?,
        entry_size: p.u8()?,
        page_bits: p.u8()?,
        entries: p.length()?,
        data_addr: p.offset()?,
    };
    p.checksum()?;

    Ok(hdr)
}

/// One element of a fixed array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub addr: u64,
    pub size: u64,
    pub filter_mask: u32,
}

/// Decode the first `n` elements of a fixed array index. Element `i` is the chunk at linear
/// position `i` of the chunk grid of the maximum dimensions; `None` where no chunk is allocated.
/// Unfiltered chunks are `chunk_bytes` long.
pub async fn entries(
    meta: &MetaReader,
    addr: u64,
    n: u64,
    chunk_bytes: u64,
) -> Result<Vec<Option<Entry>>> {
    let sizes = meta.sizes();
    let hdr = read_header(meta, addr).await?;

    let filtered = match hdr.client {
        CLIENT_CHUNK => false,
        CLIENT_CHUNK_FILTERED => true,
        c => return Err(Error::format(addr, format!("fixed array client {c}"))),
    };

    let esz = hdr.entry_size as usize;
    let size_width = if filtered {
        esz.checked_sub(sizes.offset as usize + 4)
            .filter(|w| (1..=8).contains(w))
            .ok_or_else(|| Error::format(addr, format!("fixed array entry of {esz} bytes")))?
    } else if esz == sizes.offset as usize {
        0
    } else {
        return Err(Error::format(addr, format!("fixed array entry of {esz} bytes")));
    };

    if hdr.entries < n {
        return Err(Error::format(
            addr,
            format!("fixed array of {} entries for {n} chunks", hdr.entries),
        ));
    }

    if hdr.data_addr == UNDEF {
        return Ok(Vec::new());
    }

    let too_large = || Error::format(addr, format!("fixed array of {} entries", hdr.entries));

    let prefix = 4 + 1 + 1 + sizes.offset as u64;
    let page_len = 1u64.checked_shl(hdr.page_bits as u32).ok_or_else(too_large)?;
    let page_bytes = page_len.checked_mul(esz as u64).ok_or_else(too_large)?;
    let paged = hdr.entries > page_len;

    // Grown as blocks are read, which bounds it by the file.
    let mut raw = Vec::new();

    if paged {
        let pages = hdr.entries.div_ceil(page_len);
        let bitmap_len = pages.div_ceil(8);

        let head = meta.read(hdr.data_addr, prefix + bitmap_len + 4).await?;
        let mut p = Parser::new(&head, hdr.data_addr, sizes);
        check_block_prefix(&mut p, &hdr, addr)?;
        let bitmap = p.bytes(bitmap_len as usize)?;
        p.checksum()?;

        let mut page_addr = hdr.data_addr + prefix + bitmap_len + 4;

        // Only the pages holding the first `n` elements are needed.
        for page in 0..n.div_ceil(page_len) {
            let len = page_len.min(hdr.entries - page * page_len) * esz as u64;

            if bitmap[(page / 8) as usize] & (0x80 >> (page % 8)) != 0 {
                let data = meta.read(page_addr, len + 4).await?;
                let mut p = Parser::new(&data, page_addr, sizes);
                raw.extend_from_slice(p.bytes(len as usize)?);
                p.checksum()?;
            } else {
                raw.extend(std::iter::repeat(0xff).take(len as usize));
            }

            // Pages are laid out at full size, the last one included.
            page_addr = page_addr
                .checked_add(page_bytes + 4)
                .ok_or_else(too_large)?;
        }
    } else {
        let len = hdr.entries.checked_mul(esz as u64).ok_or_else(too_large)?;
        let block = len.checked_add(prefix + 4).ok_or_else(too_large)?;
        let data = meta.read(hdr.data_addr, block).await?;
        let mut p = Parser::new(&data, hdr.data_addr, sizes);
        check_block_prefix(&mut p, &hdr, addr)?;
        raw.extend_from_slice(p.bytes(len as usize)?);
        p.checksum()?;
    }

    let out = raw
        .chunks_exact(esz)
        .take(n as usize)
        .map(|e| {
            let mut p = Parser::new(e, hdr.data_addr, sizes);
            let caddr = p.offset()?;

            let (size, filter_mask) = if filtered {
                (p.uint(size_width)?, p.u32()?)
            } else {
                (chunk_bytes, 0)
            };

            Ok((caddr != UNDEF).then_some(Entry {
                addr: caddr,
                size,
                filter_mask,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    log::debug!(
        "fixed array at {:#x}: {} entries ({}), {} allocated",
        addr,
        hdr.entries,
        if paged { "paged" } else { "unpaged" },
        out.iter().flatten().count()
    );

    Ok(out)
}

fn check_block_prefix(p: &mut Parser, hdr: &Header, header_addr: u64) -> Result<()> {
    p.signature(b"FADB")?;
    let version = p.u8()?;
    let client = p.u8()?;
    let owner = p.offset()?;

    if version != 0 || client != hdr.client || owner != header_addr {
        return Err(p.error("fixed array data block does not belong to its header"));
    }

    Ok(())
}
