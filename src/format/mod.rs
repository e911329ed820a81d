//! Decoding of the on-disk HDF5 structures.
//!
//! Everything in here is synchronous and works on byte slices that have already been fetched.
//! Fetching is driven by [`crate::meta`] and [`crate::group`].
use byteorder::{LittleEndian as LE, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

pub mod btree_v1;
pub mod btree_v2;
pub mod checksum;
pub mod fixed_array;
pub mod fractal_heap;
pub mod heap;
pub mod layout;
pub mod messages;
pub mod object_header;
pub mod superblock;

pub use superblock::Superblock;

/// The undefined address, all bits set.
pub const UNDEF: u64 = u64::MAX;

pub const SIGNATURE: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0d, 0x0a, 0x1a, 0x0a];

/// Width in bytes of addresses ("offsets") and lengths in this file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    pub offset: u8,
    pub length: u8,
}

impl Default for Sizes {
    fn default() -> Self {
        Sizes {
            offset: 8,
            length: 8,
        }
    }
}

/// Number of bytes needed to encode `n`.
pub(crate) fn enc_size(n: u64) -> usize {
    (log2(n) / 8 + 1) as usize
}

/// floor(log2(n)), 0 for 0.
pub(crate) fn log2(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        63 - n.leading_zeros()
    }
}

/// A little-endian reader over one structure that knows where in the file it came from, so
/// that errors can name an address.
pub(crate) struct Parser<'a> {
    cur: Cursor<&'a [u8]>,
    addr: u64,
    sizes: Sizes,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8], addr: u64, sizes: Sizes) -> Parser<'a> {
        Parser {
            cur: Cursor::new(data),
            addr,
            sizes,
        }
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn set_sizes(&mut self, sizes: Sizes) {
        self.sizes = sizes;
    }

    pub fn pos(&self) -> usize {
        self.cur.position() as usize
    }

    /// File address of the current position.
    pub fn here(&self) -> u64 {
        self.addr + self.cur.position()
    }

    pub fn remaining(&self) -> usize {
        self.cur.get_ref().len().saturating_sub(self.pos())
    }

    pub fn error<S: Into<String>>(&self, msg: S) -> Error {
        Error::format(self.here(), msg)
    }

    fn eof(&self) -> Error {
        self.error("unexpected end of structure")
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.cur.read_u8().map_err(|_| self.eof())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.cur.read_u16::<LE>().map_err(|_| self.eof())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<LE>().map_err(|_| self.eof())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.cur.read_u64::<LE>().map_err(|_| self.eof())
    }

    /// Unsigned integer of `n` bytes (0 to 8).
    pub fn uint(&mut self, n: usize) -> Result<u64> {
        match n {
            0 => Ok(0),
            1..=8 => self.cur.read_uint::<LE>(n).map_err(|_| self.eof()),
            n => Err(self.error(format!("integer field of {n} bytes"))),
        }
    }

    /// An address, `UNDEF` if all bits are set.
    pub fn offset(&mut self) -> Result<u64> {
        let n = self.sizes.offset as usize;
        let v = self.uint(n)?;

        if n < 8 && v == (1u64 << (n * 8)) - 1 || v == u64::MAX {
            Ok(UNDEF)
        } else {
            Ok(v)
        }
    }

    pub fn length(&mut self) -> Result<u64> {
        self.uint(self.sizes.length as usize)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(self.eof());
        }
        self.cur.set_position(self.cur.position() + n as u64);
        Ok(())
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.cur.get_ref().len() {
            return Err(self.eof());
        }
        self.cur.set_position(pos as u64);
        Ok(())
    }

    /// Skip forward to the next multiple of `n` (relative to the start of the structure).
    pub fn align(&mut self, n: usize) -> Result<()> {
        let pos = self.pos();
        let pad = (n - pos % n) % n;
        self.skip(pad.min(self.remaining()))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let data: &'a [u8] = self.cur.get_ref();
        let pos = self.pos();

        if n > self.remaining() {
            return Err(self.eof());
        }

        self.cur.set_position((pos + n) as u64);
        Ok(&data[pos..pos + n])
    }

    /// Everything up to the current position.
    pub fn consumed(&self) -> &'a [u8] {
        let data: &'a [u8] = self.cur.get_ref();
        &data[..self.pos()]
    }

    pub fn signature(&mut self, sig: &[u8; 4]) -> Result<()> {
        let at = self.here();
        let found = self.bytes(4)?;

        if found != sig {
            return Err(Error::format(
                at,
                format!(
                    "expected signature {:?}, found {:?}",
                    String::from_utf8_lossy(sig),
                    String::from_utf8_lossy(found)
                ),
            ));
        }

        Ok(())
    }

    /// Verify the lookup3 checksum stored at the current position over everything before it.
    pub fn checksum(&mut self) -> Result<()> {
        let computed = checksum::lookup3(self.consumed(), 0);
        let stored = self.u32()?;

        if computed != stored {
            return Err(self.error(format!(
                "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            )));
        }

        Ok(())
    }

    /// A NUL-terminated string.
    pub fn cstring(&mut self) -> Result<String> {
        let data: &'a [u8] = self.cur.get_ref();
        let pos = self.pos();

        let len = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("unterminated string"))?;

        let s = String::from_utf8_lossy(&data[pos..pos + len]).into_owned();
        self.cur.set_position((pos + len + 1) as u64);

        Ok(s)
    }
}

/// Read a NUL-terminated (or slice-terminated) string starting at `pos` in `data`.
pub(crate) fn cstring_at(data: &[u8], pos: usize) -> Option<&[u8]> {
    let tail = data.get(pos..)?;
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Some(&tail[..len])
}
