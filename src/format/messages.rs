//! Decoders for the object header messages this reader interprets.
use bytes::Bytes;

use super::object_header::Message;
use super::{Parser, Sizes, UNDEF};
use crate::error::{Error, Result};
use crate::filters::byteorder::Order;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dataspace {
    Scalar,
    Null,
    Simple {
        dims: Vec<u64>,
        max_dims: Option<Vec<u64>>,
    },
}

impl Dataspace {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<Dataspace> {
        Dataspace::parse_bytes(&m.data, m.addr, sizes)
    }

    pub fn parse_bytes(data: &[u8], addr: u64, sizes: Sizes) -> Result<Dataspace> {
        let mut p = Parser::new(data, addr, sizes);
        let version = p.u8()?;
        let rank = p.u8()? as usize;
        let flags = p.u8()?;

        let kind = match version {
            1 => {
                p.skip(5)?;
                if rank == 0 {
                    0
                } else {
                    1
                }
            }
            2 => p.u8()?,
            v => return Err(p.error(format!("dataspace version {v}"))),
        };

        match kind {
            0 => Ok(Dataspace::Scalar),
            2 => Ok(Dataspace::Null),
            1 => {
                let dims = (0..rank).map(|_| p.length()).collect::<Result<Vec<_>>>()?;
                let max_dims = if flags & 0x01 != 0 {
                    Some((0..rank).map(|_| p.length()).collect::<Result<Vec<_>>>()?)
                } else {
                    None
                };

                Ok(Dataspace::Simple { dims, max_dims })
            }
            k => Err(p.error(format!("dataspace type {k}"))),
        }
    }

    /// Dimensions, empty for scalar and null spaces.
    pub fn dims(&self) -> &[u64] {
        match self {
            Dataspace::Simple { dims, .. } => dims,
            _ => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    /// Number of elements.
    pub fn size(&self) -> u64 {
        match self {
            Dataspace::Null => 0,
            s => s.dims().iter().product(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminated,
    NullPadded,
    SpacePadded,
}

/// Datatype message as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeMessage {
    Integer {
        size: u32,
        signed: bool,
        order: Order,
    },
    Float {
        size: u32,
        order: Order,
    },
    FixedString {
        size: u32,
        padding: StringPadding,
    },
    VarString {
        padding: StringPadding,
    },
    /// Any other class (compound, enum, reference, ...), kept for its size.
    Other {
        class: u8,
        size: u32,
    },
}

fn padding(bits: u8) -> StringPadding {
    match bits & 0x0f {
        0 => StringPadding::NullTerminated,
        1 => StringPadding::NullPadded,
        _ => StringPadding::SpacePadded,
    }
}

impl TypeMessage {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<TypeMessage> {
        let mut p = m.parser(sizes);
        TypeMessage::parse_from(&mut p)
    }

    pub fn parse_bytes(data: &[u8], addr: u64, sizes: Sizes) -> Result<TypeMessage> {
        let mut p = Parser::new(data, addr, sizes);
        TypeMessage::parse_from(&mut p)
    }

    pub(crate) fn parse_from(p: &mut Parser) -> Result<TypeMessage> {
        let class_version = p.u8()?;
        let class = class_version & 0x0f;
        let bits = [p.u8()?, p.u8()?, p.u8()?];
        let size = p.u32()?;

        let order = if bits[0] & 0x01 != 0 {
            Order::BE
        } else {
            Order::LE
        };

        Ok(match class {
            0 => {
                let _offset = p.u16()?;
                let _precision = p.u16()?;
                TypeMessage::Integer {
                    size,
                    signed: bits[0] & 0x08 != 0,
                    order,
                }
            }
            1 => {
                if bits[0] & 0x40 != 0 {
                    return Err(Error::Unsupported("VAX floating point order".into()));
                }
                p.skip(12)?;
                TypeMessage::Float { size, order }
            }
            3 => TypeMessage::FixedString {
                size,
                padding: padding(bits[0]),
            },
            9 if bits[0] & 0x0f == 1 => {
                let _base = TypeMessage::parse_from(p)?;
                TypeMessage::VarString {
                    padding: padding(bits[0] >> 4),
                }
            }
            class => TypeMessage::Other { class, size },
        })
    }

    /// Size in bytes of one stored element.
    pub fn size(&self, sizes: Sizes) -> u32 {
        match self {
            TypeMessage::Integer { size, .. }
            | TypeMessage::Float { size, .. }
            | TypeMessage::FixedString { size, .. }
            | TypeMessage::Other { size, .. } => *size,
            // Sequence length, global heap collection address and object index.
            TypeMessage::VarString { .. } => 4 + sizes.offset as u32 + 4,
        }
    }
}

/// Fill value messages (old and new). `None` when no fill value is defined.
pub fn fill_value(m: &Message, sizes: Sizes) -> Result<Option<Bytes>> {
    let mut p = m.parser(sizes);

    let defined = if m.kind == super::object_header::MSG_FILL_VALUE_OLD {
        true
    } else {
        let version = p.u8()?;
        match version {
            1 | 2 => {
                let _alloc_time = p.u8()?;
                let _write_time = p.u8()?;
                let defined = p.u8()? != 0;
                version == 1 || defined
            }
            3 => {
                let flags = p.u8()?;
                flags & 0x20 != 0
            }
            v => return Err(p.error(format!("fill value version {v}"))),
        }
    };

    if !defined {
        return Ok(None);
    }

    let size = p.u32()? as usize;
    if size == 0 {
        return Ok(None);
    }

    Ok(Some(Bytes::copy_from_slice(p.bytes(size)?)))
}

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    pub name: Option<String>,

    /// Bit 0: the filter is optional.
    pub flags: u16,
    pub values: Vec<u32>,
}

/// Filter pipeline message.
pub fn filter_pipeline(m: &Message, sizes: Sizes) -> Result<Vec<Filter>> {
    let mut p = m.parser(sizes);
    let version = p.u8()?;
    let n = p.u8()?;

    if version == 1 {
        p.skip(6)?;
    } else if version != 2 {
        return Err(p.error(format!("filter pipeline version {version}")));
    }

    let mut filters = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let id = p.u16()?;
        let name_len = if version == 1 || id >= 256 {
            p.u16()?
        } else {
            0
        };
        let flags = p.u16()?;
        let nvalues = p.u16()?;

        let name = if name_len > 0 {
            let raw = p.bytes(name_len as usize)?;
            if version == 1 {
                p.align(8)?;
            }
            super::cstring_at(raw, 0).map(|s| String::from_utf8_lossy(s).into_owned())
        } else {
            None
        };

        let values = (0..nvalues).map(|_| p.u32()).collect::<Result<Vec<_>>>()?;
        if version == 1 && nvalues % 2 == 1 {
            p.skip(4)?;
        }

        filters.push(Filter {
            id,
            name,
            flags,
            values,
        });
    }

    Ok(filters)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    External { file: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
    pub creation_order: Option<u64>,
}

impl Link {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<Link> {
        Link::parse_bytes(&m.data, m.addr, sizes)
    }

    /// Parse an encoded link message (also the format of links in dense storage).
    pub fn parse_bytes(data: &[u8], addr: u64, sizes: Sizes) -> Result<Link> {
        let mut p = Parser::new(data, addr, sizes);
        let version = p.u8()?;
        if version != 1 {
            return Err(p.error(format!("link version {version}")));
        }

        let flags = p.u8()?;
        let kind = if flags & 0x08 != 0 { p.u8()? } else { 0 };
        let creation_order = if flags & 0x04 != 0 {
            Some(p.u64()?)
        } else {
            None
        };
        if flags & 0x10 != 0 {
            let _charset = p.u8()?;
        }

        let name_len = p.uint(1 << (flags & 0x03))? as usize;
        let name = String::from_utf8_lossy(p.bytes(name_len)?).into_owned();

        let target = match kind {
            0 => LinkTarget::Hard(p.offset()?),
            1 => {
                let n = p.u16()? as usize;
                LinkTarget::Soft(String::from_utf8_lossy(p.bytes(n)?).into_owned())
            }
            64 => {
                let n = p.u16()? as usize;
                let raw = p.bytes(n)?;
                // Flags byte, then file name and object path, both NUL terminated.
                let file = super::cstring_at(raw, 1).unwrap_or_default();
                let path = super::cstring_at(raw, 1 + file.len() + 1).unwrap_or_default();
                LinkTarget::External {
                    file: String::from_utf8_lossy(file).into_owned(),
                    path: String::from_utf8_lossy(path).into_owned(),
                }
            }
            k => return Err(p.error(format!("link type {k}"))),
        };

        Ok(Link {
            name,
            target,
            creation_order,
        })
    }
}

/// Link info message: where the dense link storage of a group is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub heap_addr: u64,
    pub name_index_addr: u64,
    pub order_index_addr: Option<u64>,
}

impl LinkInfo {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<LinkInfo> {
        let mut p = m.parser(sizes);
        let version = p.u8()?;
        if version != 0 {
            return Err(p.error(format!("link info version {version}")));
        }

        let flags = p.u8()?;
        if flags & 0x01 != 0 {
            let _max_creation_index = p.u64()?;
        }

        let heap_addr = p.offset()?;
        let name_index_addr = p.offset()?;
        let order_index_addr = if flags & 0x02 != 0 {
            Some(p.offset()?).filter(|a| *a != UNDEF)
        } else {
            None
        };

        Ok(LinkInfo {
            heap_addr,
            name_index_addr,
            order_index_addr,
        })
    }

    /// Links are stored densely (otherwise they are link messages in the header).
    pub fn is_dense(&self) -> bool {
        self.heap_addr != UNDEF
    }
}

/// Symbol table message of an old style group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTable {
    pub btree_addr: u64,
    pub heap_addr: u64,
}

impl SymbolTable {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<SymbolTable> {
        let mut p = m.parser(sizes);
        Ok(SymbolTable {
            btree_addr: p.offset()?,
            heap_addr: p.offset()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AttributeMessage {
    pub name: String,
    pub dtype: TypeMessage,
    pub space: Dataspace,
    pub data: Bytes,
}

impl AttributeMessage {
    pub fn parse(m: &Message, sizes: Sizes) -> Result<AttributeMessage> {
        let mut p = m.parser(sizes);
        let version = p.u8()?;
        let flags = p.u8()?;
        let name_len = p.u16()? as usize;
        let dtype_len = p.u16()? as usize;
        let space_len = p.u16()? as usize;

        if version >= 2 && flags & 0x03 != 0 {
            return Err(Error::Unsupported("attribute with shared datatype or dataspace".into()));
        }

        match version {
            1 | 2 => (),
            3 => {
                let _charset = p.u8()?;
            }
            v => return Err(p.error(format!("attribute version {v}"))),
        }

        let pad = |n: usize| if version == 1 { (n + 7) & !7 } else { n };

        let raw_name = p.bytes(pad(name_len))?;
        let name = super::cstring_at(&raw_name[..name_len.min(raw_name.len())], 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();

        let at = p.here();
        let dtype = TypeMessage::parse_bytes(p.bytes(pad(dtype_len))?, at, sizes)?;

        let at = p.here();
        let space = Dataspace::parse_bytes(p.bytes(pad(space_len))?, at, sizes)?;

        let len = (space.size() * dtype.size(sizes) as u64) as usize;
        let data = Bytes::copy_from_slice(p.bytes(len.min(p.remaining()))?);

        Ok(AttributeMessage {
            name,
            dtype,
            space,
            data,
        })
    }
}
