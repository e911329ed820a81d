//! A small HDF5 writer for building test files.
//!
//! Files get a version 0 superblock, version 1 object headers, symbol table groups (`TREE`
//! type 0, `SNOD`, `HEAP`) and chunked datasets indexed by one `TREE` type 1 leaf. All metadata
//! is placed in a reserved area at the start of the file with the raw data after it, the layout
//! of files written for the cloud.
//!
//! `write_latest` gives a version 3 superblock, version 2 object headers, groups of link
//! messages and chunked datasets indexed by a fixed array, or by a version 2 B-tree when a
//! maximum dimension is unlimited.
#![allow(dead_code)]

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use h5range::format::checksum::lookup3;
use h5range::source::{ByteRangeSource, MemorySource};

pub const UNDEF: u64 = u64::MAX;

const FIXED_ARRAY_PAGE_BITS: u8 = 10;
const BTREE_V2_NODE: u32 = 4096;

/// Default size of the metadata area.
pub const META_RESERVE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dtype {
    F32,
    F64,
    I16,
    I32,
    U8,
    /// Null padded strings of this many bytes.
    FixedString(u32),
    VarString,
}

impl Dtype {
    pub fn size(&self) -> u32 {
        match self {
            Dtype::U8 => 1,
            Dtype::I16 => 2,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 => 8,
            Dtype::FixedString(n) => *n,
            Dtype::VarString => 16,
        }
    }

    fn encode(&self, v: f64) -> Vec<u8> {
        match self {
            Dtype::F32 => (v as f32).to_le_bytes().to_vec(),
            Dtype::F64 => v.to_le_bytes().to_vec(),
            Dtype::I16 => (v as i16).to_le_bytes().to_vec(),
            Dtype::I32 => (v as i32).to_le_bytes().to_vec(),
            Dtype::U8 => vec![v as u8],
            Dtype::FixedString(_) | Dtype::VarString => panic!("not a numeric type"),
        }
    }

    fn message(&self) -> Vec<u8> {
        let mut b = Vec::new();
        let float = |b: &mut Vec<u8>, size: u32, exp: (u8, u8), mant: u8, bias: u32| {
            b.extend([0x11, 0x20, (size * 8 - 1) as u8, 0]);
            b.extend(size.to_le_bytes());
            b.extend(0u16.to_le_bytes());
            b.extend((size as u16 * 8).to_le_bytes());
            b.extend([exp.0, exp.1, 0, mant]);
            b.extend(bias.to_le_bytes());
        };
        let int = |b: &mut Vec<u8>, size: u32, signed: bool| {
            b.extend([0x10, if signed { 0x08 } else { 0 }, 0, 0]);
            b.extend(size.to_le_bytes());
            b.extend(0u16.to_le_bytes());
            b.extend((size as u16 * 8).to_le_bytes());
        };

        match *self {
            Dtype::F32 => float(&mut b, 4, (23, 8), 23, 127),
            Dtype::F64 => float(&mut b, 8, (52, 11), 52, 1023),
            Dtype::I16 => int(&mut b, 2, true),
            Dtype::I32 => int(&mut b, 4, true),
            Dtype::U8 => int(&mut b, 1, false),
            Dtype::FixedString(n) => {
                b.extend([0x13, 0x01, 0, 0]);
                b.extend(n.to_le_bytes());
            }
            Dtype::VarString => {
                b.extend([0x19, 0x01, 0, 0]);
                b.extend(16u32.to_le_bytes());
                b.extend([0x13, 0, 0, 0]);
                b.extend(1u32.to_le_bytes());
            }
        }
        b
    }
}

pub enum Storage {
    Compact,
    Contiguous,
    Chunked {
        chunk: Vec<u64>,
        deflate: Option<u32>,
        shuffle: bool,
        /// Chunks written, all when `None`.
        allocated: Option<Vec<Vec<u64>>>,
    },
}

pub enum Values {
    Numeric(Box<dyn Fn(&[u64]) -> f64>),
    Strings(Vec<String>),
}

pub struct Dataset {
    pub shape: Vec<u64>,

    /// `UNDEF` for unlimited dimensions.
    pub max_shape: Option<Vec<u64>>,
    pub dtype: Dtype,
    pub storage: Storage,
    pub fill_value: Option<f64>,
    pub values: Values,
    pub attributes: Vec<(String, Attr)>,

    /// Write a header that does not parse.
    pub malformed: bool,
}

pub enum Attr {
    F64(Vec<f64>),
    Str(String),
}

impl Dataset {
    /// A contiguous numeric dataset with the value at each index given by `f`.
    pub fn numeric(dtype: Dtype, shape: &[u64], f: impl Fn(&[u64]) -> f64 + 'static) -> Dataset {
        Dataset {
            max_shape: None,
            shape: shape.to_vec(),
            dtype,
            storage: Storage::Contiguous,
            fill_value: None,
            values: Values::Numeric(Box::new(f)),
            attributes: Vec::new(),
            malformed: false,
        }
    }

    /// A contiguous one dimensional string dataset.
    pub fn strings(dtype: Dtype, values: &[&str]) -> Dataset {
        Dataset {
            max_shape: None,
            shape: vec![values.len() as u64],
            dtype,
            storage: Storage::Contiguous,
            fill_value: None,
            values: Values::Strings(values.iter().map(|s| s.to_string()).collect()),
            attributes: Vec::new(),
            malformed: false,
        }
    }

    pub fn chunked(mut self, chunk: &[u64]) -> Dataset {
        self.storage = Storage::Chunked {
            chunk: chunk.to_vec(),
            deflate: None,
            shuffle: false,
            allocated: None,
        };
        self
    }

    pub fn compact(mut self) -> Dataset {
        self.storage = Storage::Compact;
        self
    }

    pub fn deflate(mut self, level: u32) -> Dataset {
        if let Storage::Chunked { deflate, .. } = &mut self.storage {
            *deflate = Some(level);
        }
        self
    }

    pub fn shuffle(mut self) -> Dataset {
        if let Storage::Chunked { shuffle, .. } = &mut self.storage {
            *shuffle = true;
        }
        self
    }

    /// Only write these chunks.
    pub fn allocate(mut self, coords: &[&[u64]]) -> Dataset {
        if let Storage::Chunked { allocated, .. } = &mut self.storage {
            *allocated = Some(coords.iter().map(|c| c.to_vec()).collect());
        }
        self
    }

    pub fn fill(mut self, v: f64) -> Dataset {
        self.fill_value = Some(v);
        self
    }

    pub fn max_shape(mut self, max: &[u64]) -> Dataset {
        self.max_shape = Some(max.to_vec());
        self
    }

    pub fn malformed(mut self) -> Dataset {
        self.malformed = true;
        self
    }

    pub fn attr(mut self, name: &str, a: Attr) -> Dataset {
        self.attributes.push((name.to_string(), a));
        self
    }
}

pub enum Node {
    Group(Group),
    Dataset(Dataset),
}

#[derive(Default)]
pub struct Group {
    pub children: Vec<(String, Node)>,
}

impl Group {
    pub fn new() -> Group {
        Group::default()
    }

    /// Add a dataset at `path`, creating intermediate groups.
    pub fn insert(mut self, path: &str, d: Dataset) -> Group {
        let segments = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        self.insert_at(&segments, d);
        self
    }

    fn insert_at(&mut self, segments: &[&str], d: Dataset) {
        match segments {
            [] => panic!("empty path"),
            [name] => self.children.push((name.to_string(), Node::Dataset(d))),
            [name, rest @ ..] => {
                let i = match self.children.iter().position(|(n, _)| n == name) {
                    Some(i) => i,
                    None => {
                        self.children
                            .push((name.to_string(), Node::Group(Group::new())));
                        self.children.len() - 1
                    }
                };
                match &mut self.children[i].1 {
                    Node::Group(g) => g.insert_at(rest, d),
                    Node::Dataset(_) => panic!("{name} is a dataset"),
                }
            }
        }
    }
}

/// Visit every index of `shape` in row-major order.
pub fn for_each_index(shape: &[u64], mut f: impl FnMut(&[u64])) {
    if shape.iter().any(|d| *d == 0) {
        return;
    }

    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx);

        let mut d = shape.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

fn shuffle(src: &[u8], wsz: usize) -> Vec<u8> {
    let n = src.len() / wsz;
    let mut out = vec![0; src.len()];
    for i in 0..n {
        for j in 0..wsz {
            out[j * n + i] = src[i * wsz + j];
        }
    }
    out
}

fn deflate(data: &[u8], level: u32) -> Vec<u8> {
    let lvl = libdeflater::CompressionLvl::new(level as i32)
        .unwrap_or_else(|_| libdeflater::CompressionLvl::default());
    let mut c = libdeflater::Compressor::new(lvl);
    let mut out = vec![0; c.zlib_compress_bound(data.len())];
    let n = c.zlib_compress(data, &mut out).expect("compress");
    out.truncate(n);
    out
}

fn pad8(b: &mut Vec<u8>) {
    b.resize((b.len() + 7) & !7, 0);
}

fn seal(b: &mut Vec<u8>) {
    let sum = lookup3(b, 0);
    b.extend(sum.to_le_bytes());
}

struct Writer {
    meta: Vec<u8>,
    data: Vec<u8>,
    reserve: usize,

    /// Write the newer structures of `write_latest`.
    latest: bool,
}

impl Writer {
    fn meta(&mut self, b: &[u8]) -> u64 {
        pad8(&mut self.meta);
        let a = self.meta.len() as u64;
        self.meta.extend_from_slice(b);
        a
    }

    fn data(&mut self, b: &[u8]) -> u64 {
        pad8(&mut self.data);
        let a = (self.reserve + self.data.len()) as u64;
        self.data.extend_from_slice(b);
        a
    }

    fn header(&mut self, msgs: &[(u16, Vec<u8>)]) -> u64 {
        if self.latest {
            return self.header_v2(msgs);
        }

        let mut body = Vec::new();
        for (kind, data) in msgs {
            let size = (data.len() + 7) & !7;
            body.extend(kind.to_le_bytes());
            body.extend((size as u16).to_le_bytes());
            body.extend([0; 4]);
            body.extend(data);
            body.resize(body.len() + size - data.len(), 0);
        }

        let mut h = vec![1, 0];
        h.extend((msgs.len() as u16).to_le_bytes());
        h.extend(1u32.to_le_bytes());
        h.extend((body.len() as u32).to_le_bytes());
        h.extend([0; 4]);
        h.extend(body);
        self.meta(&h)
    }

    fn header_v2(&mut self, msgs: &[(u16, Vec<u8>)]) -> u64 {
        let mut body = Vec::new();
        for (kind, data) in msgs {
            body.push(*kind as u8);
            body.extend((data.len() as u16).to_le_bytes());
            body.push(0);
            body.extend(data);
        }

        // Four byte size of the first chunk.
        let mut h = b"OHDR".to_vec();
        h.extend([2, 0x02]);
        h.extend((body.len() as u32).to_le_bytes());
        h.extend(body);
        seal(&mut h);
        self.meta(&h)
    }

    fn dataspace(shape: &[u64], max: Option<&[u64]>) -> Vec<u8> {
        let flags = max.is_some() as u8;
        let mut b = vec![1, shape.len() as u8, flags, 0, 0, 0, 0, 0];
        for d in shape.iter().chain(max.unwrap_or_default()) {
            b.extend(d.to_le_bytes());
        }
        b
    }

    /// A global heap collection holding `objects`, indexed from 1.
    fn global_heap(&mut self, objects: &[&[u8]]) -> u64 {
        let mut body = Vec::new();
        for (i, o) in objects.iter().enumerate() {
            body.extend((i as u16 + 1).to_le_bytes());
            body.extend(1u16.to_le_bytes());
            body.extend([0; 4]);
            body.extend((o.len() as u64).to_le_bytes());
            body.extend(*o);
            pad8(&mut body);
        }

        let mut b = b"GCOL\x01\0\0\0".to_vec();
        b.extend(((16 + body.len()) as u64).to_le_bytes());
        b.extend(body);
        self.meta(&b)
    }

    fn string_elements(&mut self, dtype: Dtype, values: &[String]) -> Vec<u8> {
        match dtype {
            Dtype::FixedString(n) => {
                let mut b = Vec::new();
                for s in values {
                    let mut e = s.as_bytes().to_vec();
                    e.resize(n as usize, 0);
                    b.extend(e);
                }
                b
            }
            Dtype::VarString => {
                let objects = values.iter().map(|s| s.as_bytes()).collect::<Vec<_>>();
                let collection = self.global_heap(&objects);
                let mut b = Vec::new();
                for (i, s) in values.iter().enumerate() {
                    b.extend((s.len() as u32).to_le_bytes());
                    b.extend(collection.to_le_bytes());
                    b.extend((i as u32 + 1).to_le_bytes());
                }
                b
            }
            _ => panic!("not a string type"),
        }
    }

    fn attribute(&mut self, name: &str, a: &Attr) -> Vec<u8> {
        let (dtype, shape, data) = match a {
            Attr::F64(v) => (
                Dtype::F64,
                vec![v.len() as u64],
                v.iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<_>>(),
            ),
            Attr::Str(s) => {
                let t = Dtype::FixedString(s.len().max(1) as u32);
                (t, vec![1], self.string_elements(t, &[s.clone()]))
            }
        };

        let mut n = name.as_bytes().to_vec();
        n.push(0);
        let t = dtype.message();
        let s = Writer::dataspace(&shape, None);

        let mut b = vec![1, 0];
        b.extend((n.len() as u16).to_le_bytes());
        b.extend((t.len() as u16).to_le_bytes());
        b.extend((s.len() as u16).to_le_bytes());
        for part in [n, t, s] {
            b.extend(&part);
            pad8(&mut b);
        }
        b.extend(data);
        b
    }

    fn elements(&mut self, d: &Dataset) -> Vec<u8> {
        match &d.values {
            Values::Numeric(f) => {
                let mut b = Vec::new();
                for_each_index(&d.shape, |i| b.extend(d.dtype.encode(f(i))));
                b
            }
            Values::Strings(s) => self.string_elements(d.dtype, s),
        }
    }

    fn chunk(&self, d: &Dataset, coord: &[u64], chunk: &[u64]) -> Vec<u8> {
        let Values::Numeric(f) = &d.values else {
            panic!("chunked string datasets are not written");
        };

        let mut b = Vec::new();
        for_each_index(chunk, |i| {
            let idx = i
                .iter()
                .zip(coord)
                .zip(chunk)
                .map(|((i, c), z)| c * z + i)
                .collect::<Vec<_>>();

            let inside = idx.iter().zip(&d.shape).all(|(i, s)| i < s);
            let v = if inside { f(&idx) } else { d.fill_value.unwrap_or(0.) };
            b.extend(d.dtype.encode(v));
        });
        b
    }

    fn dataset(&mut self, d: &Dataset) -> u64 {
        if d.malformed {
            return self.meta(&[7; 32]);
        }

        let esz = d.dtype.size();
        let mut msgs = vec![
            (0x01, Writer::dataspace(&d.shape, d.max_shape.as_deref())),
            (0x03, d.dtype.message()),
        ];

        let mut fill = vec![2, 2, 2];
        match d.fill_value {
            Some(v) => {
                fill.push(1);
                fill.extend(esz.to_le_bytes());
                fill.extend(d.dtype.encode(v));
            }
            None => fill.push(0),
        }
        msgs.push((0x05, fill));

        match &d.storage {
            Storage::Compact => {
                let data = self.elements(d);
                let mut l = vec![3, 0];
                l.extend((data.len() as u16).to_le_bytes());
                l.extend(data);
                msgs.push((0x08, l));
            }
            Storage::Contiguous => {
                let data = self.elements(d);
                let addr = self.data(&data);
                let mut l = vec![3, 1];
                l.extend(addr.to_le_bytes());
                l.extend((data.len() as u64).to_le_bytes());
                msgs.push((0x08, l));
            }
            Storage::Chunked {
                chunk,
                deflate: level,
                shuffle: shuffled,
                allocated,
            } => {
                let grid = d
                    .shape
                    .iter()
                    .zip(chunk)
                    .map(|(s, c)| s.div_ceil(*c))
                    .collect::<Vec<_>>();

                let coords = match allocated {
                    Some(c) => c.clone(),
                    None => {
                        let mut all = Vec::new();
                        for_each_index(&grid, |c| all.push(c.to_vec()));
                        all
                    }
                };

                let mut entries = Vec::new();
                for c in coords {
                    let mut raw = self.chunk(d, &c, chunk);
                    if *shuffled {
                        raw = shuffle(&raw, esz as usize);
                    }
                    if let Some(level) = level {
                        raw = deflate(&raw, *level);
                    }
                    let addr = self.data(&raw);
                    entries.push((c, addr, raw.len() as u32));
                }
                entries.sort();

                let filtered = *shuffled || level.is_some();
                let layout = if self.latest {
                    self.chunk_index_v4(d, chunk, esz, filtered, &entries)
                } else {
                    self.chunk_index_v1(&grid, chunk, esz, &entries)
                };
                msgs.push((0x08, layout));

                let mut filters = Vec::new();
                if *shuffled {
                    filters.push((2u16, esz));
                }
                if let Some(level) = level {
                    filters.push((1u16, *level));
                }
                if !filters.is_empty() {
                    let mut p = vec![1, filters.len() as u8, 0, 0, 0, 0, 0, 0];
                    for (id, value) in filters {
                        p.extend(id.to_le_bytes());
                        p.extend(0u16.to_le_bytes());
                        p.extend(0u16.to_le_bytes());
                        p.extend(1u16.to_le_bytes());
                        p.extend(value.to_le_bytes());
                        p.extend([0; 4]);
                    }
                    msgs.push((0x0b, p));
                }
            }
        }

        for (name, a) in &d.attributes {
            let m = self.attribute(name, a);
            msgs.push((0x0c, m));
        }

        self.header(&msgs)
    }

    /// A `TREE` type 1 leaf over `entries` and the version 3 layout message pointing at it.
    fn chunk_index_v1(
        &mut self,
        grid: &[u64],
        chunk: &[u64],
        esz: u32,
        entries: &[(Vec<u64>, u64, u32)],
    ) -> Vec<u8> {
        let btree = if entries.is_empty() {
            UNDEF
        } else {
            let mut t = b"TREE\x01\x00".to_vec();
            t.extend((entries.len() as u16).to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            for (c, addr, size) in entries {
                t.extend(size.to_le_bytes());
                t.extend(0u32.to_le_bytes());
                for (c, z) in c.iter().zip(chunk) {
                    t.extend((c * z).to_le_bytes());
                }
                t.extend(0u64.to_le_bytes());
                t.extend(addr.to_le_bytes());
            }
            t.extend(0u32.to_le_bytes());
            t.extend(0u32.to_le_bytes());
            for (g, z) in grid.iter().zip(chunk) {
                t.extend((g * z).to_le_bytes());
            }
            t.extend(0u64.to_le_bytes());
            self.meta(&t)
        };

        let mut l = vec![3, 2, chunk.len() as u8 + 1];
        l.extend(btree.to_le_bytes());
        for z in chunk {
            l.extend((*z as u32).to_le_bytes());
        }
        l.extend(esz.to_le_bytes());
        l
    }

    /// A fixed array or version 2 B-tree over `entries` and the version 4 layout message
    /// pointing at it.
    fn chunk_index_v4(
        &mut self,
        d: &Dataset,
        chunk: &[u64],
        esz: u32,
        filtered: bool,
        entries: &[(Vec<u64>, u64, u32)],
    ) -> Vec<u8> {
        let mut l = vec![4, 2, 0, chunk.len() as u8 + 1, 4];
        for z in chunk {
            l.extend((*z as u32).to_le_bytes());
        }
        l.extend(esz.to_le_bytes());

        let max = d.max_shape.as_deref().unwrap_or(&d.shape);
        if max.contains(&UNDEF) {
            let addr = self.btree_v2(chunk.len(), filtered, entries);
            l.push(5);
            l.extend(BTREE_V2_NODE.to_le_bytes());
            l.extend([100, 40]);
            l.extend(addr.to_le_bytes());
        } else {
            let grid = max
                .iter()
                .zip(chunk)
                .map(|(s, c)| s.div_ceil(*c))
                .collect::<Vec<_>>();
            let addr = self.fixed_array(&grid, filtered, entries);
            l.extend([3, FIXED_ARRAY_PAGE_BITS]);
            l.extend(addr.to_le_bytes());
        }
        l
    }

    /// An unpaged fixed array with one element per chunk of `grid`, returning the header
    /// address. Filtered elements carry a four byte size.
    fn fixed_array(&mut self, grid: &[u64], filtered: bool, entries: &[(Vec<u64>, u64, u32)]) -> u64 {
        let n = grid.iter().product::<u64>();
        assert!(n <= 1 << FIXED_ARRAY_PAGE_BITS, "fixed array of {n} elements is paged");

        let mut slots = vec![None; n as usize];
        for (c, addr, size) in entries {
            let i = c.iter().zip(grid).fold(0, |i, (c, g)| i * g + c);
            slots[i as usize] = Some((*addr, *size));
        }

        let client = filtered as u8;
        let esz = if filtered { 8 + 4 + 4 } else { 8 };

        // The header seals to 32 bytes, the data block follows it.
        let header_at = (self.meta.len() as u64 + 7) & !7;
        let block_at = header_at + 32;

        let mut h = b"FAHD".to_vec();
        h.extend([0, client, esz, FIXED_ARRAY_PAGE_BITS]);
        h.extend(n.to_le_bytes());
        h.extend(block_at.to_le_bytes());
        seal(&mut h);
        assert_eq!(self.meta(&h), header_at);

        let mut b = b"FADB".to_vec();
        b.extend([0, client]);
        b.extend(header_at.to_le_bytes());
        for slot in slots {
            let (addr, size) = slot.unwrap_or((UNDEF, 0));
            b.extend(addr.to_le_bytes());
            if filtered {
                b.extend(size.to_le_bytes());
                b.extend(0u32.to_le_bytes());
            }
        }
        seal(&mut b);
        assert_eq!(self.meta(&b), block_at);

        header_at
    }

    /// A version 2 B-tree of chunk records in one leaf, returning the header address.
    fn btree_v2(&mut self, rank: usize, filtered: bool, entries: &[(Vec<u64>, u64, u32)]) -> u64 {
        let kind = if filtered { 11 } else { 10 };
        let record = 8 + if filtered { 4 + 4 } else { 0 } + 8 * rank;

        let root = if entries.is_empty() {
            UNDEF
        } else {
            let mut leaf = b"BTLF".to_vec();
            leaf.extend([0, kind]);
            for (c, addr, size) in entries {
                leaf.extend(addr.to_le_bytes());
                if filtered {
                    leaf.extend(size.to_le_bytes());
                    leaf.extend(0u32.to_le_bytes());
                }
                for c in c {
                    leaf.extend(c.to_le_bytes());
                }
            }
            seal(&mut leaf);
            self.meta(&leaf)
        };

        let mut h = b"BTHD".to_vec();
        h.extend([0, kind]);
        h.extend(BTREE_V2_NODE.to_le_bytes());
        h.extend((record as u16).to_le_bytes());
        h.extend(0u16.to_le_bytes());
        h.extend([100, 40]);
        h.extend(root.to_le_bytes());
        h.extend((entries.len() as u16).to_le_bytes());
        h.extend((entries.len() as u64).to_le_bytes());
        seal(&mut h);
        self.meta(&h)
    }

    /// Write a group, returning its header, B-tree and local heap addresses.
    fn group(&mut self, g: &Group) -> (u64, u64, u64) {
        let mut links = Vec::new();
        for (name, node) in &g.children {
            let addr = match node {
                Node::Group(g) => self.group(g).0,
                Node::Dataset(d) => self.dataset(d),
            };
            links.push((name.clone(), addr));
        }
        links.sort();

        if self.latest {
            let mut info = vec![0, 0];
            info.extend(UNDEF.to_le_bytes());
            info.extend(UNDEF.to_le_bytes());

            let mut msgs = vec![(0x02, info), (0x0a, vec![0, 0])];
            for (name, addr) in &links {
                let mut l = vec![1, 0, name.len() as u8];
                l.extend(name.as_bytes());
                l.extend(addr.to_le_bytes());
                msgs.push((0x06, l));
            }
            return (self.header(&msgs), UNDEF, UNDEF);
        }

        let mut heap_data = vec![0u8];
        let mut offsets = Vec::new();
        for (name, _) in &links {
            offsets.push(heap_data.len() as u64);
            heap_data.extend(name.as_bytes());
            heap_data.push(0);
        }
        pad8(&mut heap_data);

        let data_addr = self.meta(&heap_data);
        let mut h = b"HEAP\0\0\0\0".to_vec();
        h.extend((heap_data.len() as u64).to_le_bytes());
        h.extend(UNDEF.to_le_bytes());
        h.extend(data_addr.to_le_bytes());
        let heap = self.meta(&h);

        let mut snod = b"SNOD\x01\x00".to_vec();
        snod.extend((links.len() as u16).to_le_bytes());
        for ((_, addr), off) in links.iter().zip(&offsets) {
            snod.extend(off.to_le_bytes());
            snod.extend(addr.to_le_bytes());
            snod.extend([0; 24]);
        }
        let snod = self.meta(&snod);

        let mut t = b"TREE\x00\x00".to_vec();
        if links.is_empty() {
            t.extend(0u16.to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            t.extend(0u64.to_le_bytes());
        } else {
            t.extend(1u16.to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            t.extend(UNDEF.to_le_bytes());
            t.extend(0u64.to_le_bytes());
            t.extend(snod.to_le_bytes());
            t.extend(offsets[offsets.len() - 1].to_le_bytes());
        }
        let btree = self.meta(&t);

        let mut st = btree.to_le_bytes().to_vec();
        st.extend(heap.to_le_bytes());
        let header = self.header(&[(0x11, st)]);

        (header, btree, heap)
    }
}

/// Write a file with the default metadata area.
pub fn write(root: &Group) -> Vec<u8> {
    write_with_reserve(root, META_RESERVE)
}

impl Writer {
    /// Metadata area followed by the raw data.
    fn finish(self) -> Vec<u8> {
        assert!(
            self.meta.len() <= self.reserve,
            "metadata of {} bytes does not fit in {}",
            self.meta.len(),
            self.reserve
        );

        let mut f = self.meta;
        f.resize(self.reserve, 0);
        f.extend(self.data);
        f
    }
}

pub fn write_with_reserve(root: &Group, reserve: usize) -> Vec<u8> {
    let mut w = Writer {
        meta: vec![0; 96],
        data: Vec::new(),
        reserve,
        latest: false,
    };

    let (root, btree, heap) = w.group(root);
    let mut f = w.finish();
    let eof = f.len() as u64;

    let mut sb = vec![0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
    sb.extend([0, 0, 0, 0, 0, 8, 8, 0]);
    sb.extend(4u16.to_le_bytes());
    sb.extend(16u16.to_le_bytes());
    sb.extend(0u32.to_le_bytes());
    sb.extend(0u64.to_le_bytes());
    sb.extend(UNDEF.to_le_bytes());
    sb.extend(eof.to_le_bytes());
    sb.extend(UNDEF.to_le_bytes());
    sb.extend(0u64.to_le_bytes());
    sb.extend(root.to_le_bytes());
    sb.extend(1u32.to_le_bytes());
    sb.extend(0u32.to_le_bytes());
    sb.extend(btree.to_le_bytes());
    sb.extend(heap.to_le_bytes());
    assert_eq!(sb.len(), 96);

    f[..96].copy_from_slice(&sb);
    f
}

/// Write a file of the newer structures, with the default metadata area.
pub fn write_latest(root: &Group) -> Vec<u8> {
    let mut w = Writer {
        meta: vec![0; 48],
        data: Vec::new(),
        reserve: META_RESERVE,
        latest: true,
    };

    let (root, _, _) = w.group(root);
    let mut f = w.finish();
    let eof = f.len() as u64;

    let mut sb = vec![0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
    sb.extend([3, 8, 8, 0]);
    sb.extend(0u64.to_le_bytes());
    sb.extend(UNDEF.to_le_bytes());
    sb.extend(eof.to_le_bytes());
    sb.extend(root.to_le_bytes());
    seal(&mut sb);
    assert_eq!(sb.len(), 48);

    f[..48].copy_from_slice(&sb);
    f
}

/// A source that records every request and optionally delays or fails some of them.
pub struct TestSource {
    inner: MemorySource,
    pub requests: Mutex<Vec<(u64, u64)>>,
    pub delay: Duration,

    /// Requests starting here fail.
    pub fail_at: Mutex<Option<u64>>,
    pub failures: AtomicUsize,
}

impl TestSource {
    pub fn new(name: &str, data: Vec<u8>) -> Arc<TestSource> {
        TestSource::with_delay(name, data, Duration::ZERO)
    }

    pub fn with_delay(name: &str, data: Vec<u8>, delay: Duration) -> Arc<TestSource> {
        Arc::new(TestSource {
            inner: MemorySource::new(name, data),
            requests: Mutex::new(Vec::new()),
            delay,
            fail_at: Mutex::new(None),
            failures: AtomicUsize::new(0),
        })
    }

    pub fn fail_at(&self, offset: Option<u64>) {
        *self.fail_at.lock().unwrap() = offset;
    }

    /// Requests starting at `offset`.
    pub fn requests_at(&self, offset: u64) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ByteRangeSource for TestSource {
    fn read(&self, offset: u64, length: u64) -> BoxFuture<'_, io::Result<Bytes>> {
        async move {
            self.requests.lock().unwrap().push((offset, length));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if *self.fail_at.lock().unwrap() == Some(offset) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected"));
            }

            self.inner.read(offset, length).await
        }
        .boxed()
    }

    fn origin(&self) -> &str {
        self.inner.origin()
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }
}
