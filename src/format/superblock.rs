use super::{Parser, Sizes, SIGNATURE, UNDEF};
use crate::error::{Error, Result};

/// The file header. Names the width of addresses and lengths in the file and where the root
/// group is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u8,
    pub sizes: Sizes,

    /// Object header address of the root group.
    pub root_addr: u64,

    /// End of file address as the writer last left it.
    pub eof_addr: u64,

    /// Superblock extension (versions 2 and 3), `None` when absent.
    pub extension_addr: Option<u64>,

    /// Symbol table (B-tree, local heap) of the root group cached in the root symbol table
    /// entry (versions 0 and 1).
    pub root_symbol_table: Option<(u64, u64)>,
}

/// Enough bytes for every superblock version with 8 byte addresses.
pub const MAX_SIZE: usize = 100;

impl Superblock {
    /// Parse the superblock at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Superblock> {
        if data.len() < SIGNATURE.len() || data[..SIGNATURE.len()] != SIGNATURE {
            return Err(Error::format(0, "missing HDF5 signature"));
        }

        let mut p = Parser::new(data, 0, Sizes::default());
        p.skip(SIGNATURE.len())?;

        let version = p.u8()?;
        match version {
            0 | 1 => Superblock::parse_v0(p, version),
            2 | 3 => Superblock::parse_v2(p, version),
            v => Err(Error::Unsupported(format!("superblock version {v}"))),
        }
    }

    fn check_sizes(p: &Parser, sizes: Sizes) -> Result<()> {
        for s in [sizes.offset, sizes.length] {
            if !matches!(s, 2 | 4 | 8) {
                return Err(p.error(format!("invalid address or length width: {s}")));
            }
        }
        Ok(())
    }

    fn check_base(base: u64) -> Result<()> {
        if base != 0 && base != UNDEF {
            return Err(Error::Unsupported(format!(
                "non-zero base address ({base:#x})"
            )));
        }
        Ok(())
    }

    fn parse_v0(mut p: Parser, version: u8) -> Result<Superblock> {
        let _free_space_version = p.u8()?;
        let _root_symtab_version = p.u8()?;
        p.skip(1)?;
        let _shared_header_version = p.u8()?;

        let sizes = Sizes {
            offset: p.u8()?,
            length: p.u8()?,
        };
        Superblock::check_sizes(&p, sizes)?;
        p.skip(1)?;

        let _group_leaf_k = p.u16()?;
        let _group_internal_k = p.u16()?;
        let _flags = p.u32()?;

        if version == 1 {
            let _indexed_storage_k = p.u16()?;
            p.skip(2)?;
        }

        p.set_sizes(sizes);

        let base = p.offset()?;
        Superblock::check_base(base)?;
        let _free_space = p.offset()?;
        let eof_addr = p.offset()?;
        let _driver = p.offset()?;

        // Root group symbol table entry.
        let _name_offset = p.offset()?;
        let root_addr = p.offset()?;
        let cache_type = p.u32()?;
        p.skip(4)?;

        let root_symbol_table = if cache_type == 1 {
            Some((p.offset()?, p.offset()?))
        } else {
            None
        };

        if root_addr == UNDEF {
            return Err(p.error("root group has no object header"));
        }

        Ok(Superblock {
            version,
            sizes,
            root_addr,
            eof_addr,
            extension_addr: None,
            root_symbol_table,
        })
    }

    fn parse_v2(mut p: Parser, version: u8) -> Result<Superblock> {
        let sizes = Sizes {
            offset: p.u8()?,
            length: p.u8()?,
        };
        Superblock::check_sizes(&p, sizes)?;
        let _flags = p.u8()?;

        p.set_sizes(sizes);

        let base = p.offset()?;
        Superblock::check_base(base)?;
        let extension = p.offset()?;
        let eof_addr = p.offset()?;
        let root_addr = p.offset()?;
        p.checksum()?;

        Ok(Superblock {
            version,
            sizes,
            root_addr,
            eof_addr,
            extension_addr: (extension != UNDEF).then_some(extension),
            root_symbol_table: None,
        })
    }
}
