//! Object headers: the list of messages describing a group or dataset.
//!
//! A header may be spread over several blocks linked by continuation messages. They are
//! followed with an explicit worklist and presented as one message list.
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};

use super::{Parser, Sizes, UNDEF};
use crate::error::{Error, Result};
use crate::meta::MetaReader;

pub const MSG_NIL: u16 = 0x00;
pub const MSG_DATASPACE: u16 = 0x01;
pub const MSG_LINK_INFO: u16 = 0x02;
pub const MSG_DATATYPE: u16 = 0x03;
pub const MSG_FILL_VALUE_OLD: u16 = 0x04;
pub const MSG_FILL_VALUE: u16 = 0x05;
pub const MSG_LINK: u16 = 0x06;
pub const MSG_LAYOUT: u16 = 0x08;
pub const MSG_GROUP_INFO: u16 = 0x0a;
pub const MSG_FILTER_PIPELINE: u16 = 0x0b;
pub const MSG_ATTRIBUTE: u16 = 0x0c;
pub const MSG_CONTINUATION: u16 = 0x10;
pub const MSG_SYMBOL_TABLE: u16 = 0x11;
pub const MSG_ATTRIBUTE_INFO: u16 = 0x15;

/// Message flag: the message body refers to a shared message stored elsewhere.
pub const FLAG_SHARED: u8 = 0x02;

/// Upper bound on the size of a version 2 prefix.
const V2_PREFIX_MAX: u64 = 4 + 1 + 1 + 16 + 4 + 8;

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: u16,
    pub flags: u8,

    /// File address of the message body.
    pub addr: u64,
    pub data: Bytes,
}

impl Message {
    pub fn is_shared(&self) -> bool {
        self.flags & FLAG_SHARED != 0
    }

    pub fn parser(&self, sizes: Sizes) -> Parser<'_> {
        Parser::new(&self.data, self.addr, sizes)
    }
}

#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub addr: u64,
    pub version: u8,
    pub messages: Vec<Message>,
}

impl ObjectHeader {
    /// First message of `kind`.
    pub fn find(&self, kind: u16) -> Option<&Message> {
        self.messages.iter().find(|m| m.kind == kind)
    }

    pub fn all(&self, kind: u16) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.kind == kind)
    }

    pub fn has(&self, kind: u16) -> bool {
        self.find(kind).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    /// Version 1 message block, no framing.
    V1,
    /// The first version 2 block: prefix and messages up to the checksum.
    V2First { prefix: usize },
    /// `OCHK` continuation block.
    V2Continuation,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    addr: u64,
    len: u64,
    kind: BlockKind,
}

/// Parsed version 2 prefix.
#[derive(Debug)]
struct PrefixV2 {
    prefix_len: usize,
    chunk0: u64,
    order_tracked: bool,
}

fn parse_prefix_v2(data: &[u8], addr: u64, sizes: Sizes) -> Result<PrefixV2> {
    let mut p = Parser::new(data, addr, sizes);
    p.signature(b"OHDR")?;

    let version = p.u8()?;
    if version != 2 {
        return Err(p.error(format!("object header version {version}")));
    }

    let flags = p.u8()?;

    if flags & 0x20 != 0 {
        // Access, modification, change and birth times.
        p.skip(16)?;
    }

    if flags & 0x10 != 0 {
        // Max compact and min dense attribute counts.
        p.skip(4)?;
    }

    let chunk0 = p.uint(1 << (flags & 0x03))?;

    Ok(PrefixV2 {
        prefix_len: p.pos(),
        chunk0,
        order_tracked: flags & 0x04 != 0,
    })
}

/// Parse the messages in one block, pushing continuations onto `pending`.
#[allow(clippy::too_many_arguments)]
fn parse_messages(
    data: &[u8],
    addr: u64,
    sizes: Sizes,
    version: u8,
    order_tracked: bool,
    index: &mut usize,
    out: &mut Vec<Message>,
    pending: &mut VecDeque<Block>,
) -> Result<()> {
    let mut p = Parser::new(data, addr, sizes);
    let header_len = match (version, order_tracked) {
        (1, _) => 8,
        (_, true) => 6,
        (_, false) => 4,
    };

    while p.remaining() >= header_len {
        let at = p.here();

        let (kind, size, flags) = if version == 1 {
            let kind = p.u16()?;
            let size = p.u16()?;
            let flags = p.u8()?;
            p.skip(3)?;
            (kind, size, flags)
        } else {
            let kind = p.u8()? as u16;
            let size = p.u16()?;
            let flags = p.u8()?;
            if order_tracked {
                p.skip(2)?;
            }
            (kind, size, flags)
        };

        if size as usize > p.remaining() {
            return Err(Error::format(
                at,
                format!(
                    "message {} (type {:#x}) of {} bytes overruns its block",
                    *index,
                    kind,
                    size
                ),
            ));
        }

        let body_addr = p.here();
        let body = p.bytes(size as usize)?;
        *index += 1;

        match kind {
            MSG_NIL => (),
            MSG_CONTINUATION => {
                let mut c = Parser::new(body, body_addr, sizes);
                let caddr = c.offset()?;
                let clen = c.length()?;

                if caddr != UNDEF && clen > 0 {
                    pending.push_back(Block {
                        addr: caddr,
                        len: clen,
                        kind: if version == 1 {
                            BlockKind::V1
                        } else {
                            BlockKind::V2Continuation
                        },
                    });
                }
            }
            _ => out.push(Message {
                kind,
                flags,
                addr: body_addr,
                data: Bytes::copy_from_slice(body),
            }),
        }
    }

    Ok(())
}

fn verify_checksum(data: &[u8], addr: u64, sizes: Sizes) -> Result<()> {
    if data.len() < 4 {
        return Err(Error::format(addr, "block too short for checksum"));
    }
    let mut p = Parser::new(data, addr, sizes);
    p.skip(data.len() - 4)?;
    p.checksum()
}

/// Read the object header at `addr`, following continuation blocks.
pub async fn read(meta: &MetaReader, addr: u64) -> Result<ObjectHeader> {
    let sizes = meta.sizes();
    let first = meta.read_upto(addr, V2_PREFIX_MAX).await?;

    if first.is_empty() {
        return Err(Error::Truncated {
            offset: addr,
            wanted: V2_PREFIX_MAX,
            got: 0,
        });
    }

    let mut pending = VecDeque::new();
    let mut order_tracked = false;

    let version = if first.starts_with(b"OHDR") {
        let prefix = parse_prefix_v2(&first, addr, sizes)?;
        order_tracked = prefix.order_tracked;

        pending.push_back(Block {
            addr,
            len: prefix.prefix_len as u64 + prefix.chunk0 + 4,
            kind: BlockKind::V2First {
                prefix: prefix.prefix_len,
            },
        });
        2
    } else if first[0] == 1 {
        let mut p = Parser::new(&first, addr, sizes);
        p.skip(2)?;
        let _nmessages = p.u16()?;
        let _refcount = p.u32()?;
        let size = p.u32()?;

        pending.push_back(Block {
            addr: addr + 16,
            len: size as u64,
            kind: BlockKind::V1,
        });
        1
    } else {
        return Err(Error::format(addr, "not an object header"));
    };

    let mut messages = Vec::new();
    let mut visited = HashSet::new();
    let mut index = 0;

    while let Some(block) = pending.pop_front() {
        if !visited.insert(block.addr) {
            return Err(Error::format(block.addr, "continuation loop in object header"));
        }

        let data = meta.read(block.addr, block.len).await?;

        match block.kind {
            BlockKind::V1 => parse_messages(
                &data,
                block.addr,
                sizes,
                version,
                order_tracked,
                &mut index,
                &mut messages,
                &mut pending,
            )?,
            BlockKind::V2First { prefix } => {
                verify_checksum(&data, block.addr, sizes)?;
                let end = data.len() - 4;
                parse_messages(
                    &data[prefix..end],
                    block.addr + prefix as u64,
                    sizes,
                    version,
                    order_tracked,
                    &mut index,
                    &mut messages,
                    &mut pending,
                )?
            }
            BlockKind::V2Continuation => {
                let mut p = Parser::new(&data, block.addr, sizes);
                p.signature(b"OCHK")?;
                verify_checksum(&data, block.addr, sizes)?;
                let end = data.len() - 4;
                parse_messages(
                    &data[4..end],
                    block.addr + 4,
                    sizes,
                    version,
                    order_tracked,
                    &mut index,
                    &mut messages,
                    &mut pending,
                )?
            }
        }
    }

    log::trace!(
        "object header at {:#x}: version {}, {} messages",
        addr,
        version,
        messages.len()
    );

    Ok(ObjectHeader {
        addr,
        version,
        messages,
    })
}

/// Parse a shared message body and return the address of the object header holding the
/// actual message.
pub fn shared_address(m: &Message, sizes: Sizes) -> Result<u64> {
    let mut p = m.parser(sizes);
    let version = p.u8()?;
    let kind = p.u8()?;

    match version {
        1 => {
            p.skip(6)?;
            p.offset()
        }
        2 => p.offset(),
        3 if kind == 2 => p.offset(),
        3 => Err(Error::Unsupported(
            "messages shared through the shared object header message heap".into(),
        )),
        v => Err(p.error(format!("shared message version {v}"))),
    }
}
