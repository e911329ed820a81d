//! Resolving paths to objects and enumerating the datasets of a file.
//!
//! Only the object headers and group indices along a path are read. Object headers are kept in
//! an address keyed arena, with at most one read in flight per header.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flight::SingleFlight;
use crate::format::btree_v1::{self, Key};
use crate::format::btree_v2::{self, link_name_record, TYPE_LINK_NAME};
use crate::format::checksum::lookup3;
use crate::format::fractal_heap::FractalHeap;
use crate::format::heap::{self, GlobalHeapId, LocalHeap};
use crate::format::layout::Layout;
use crate::format::messages::{
    filter_pipeline, fill_value, AttributeMessage, Dataspace, Link, LinkInfo, LinkTarget,
    SymbolTable, TypeMessage,
};
use crate::format::object_header::{self, *};
use crate::format::UNDEF;
use crate::idx::{trim_string, DatasetDescriptor, Datatype, TypedArray};
use crate::meta::MetaReader;

/// Soft links followed while resolving one path.
pub const MAX_SOFT_LINKS: usize = 16;

/// Decoded value of an attribute or small dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Numeric(TypedArray),
    Strings(Vec<String>),
}

impl Value {
    pub fn as_numeric(&self) -> Option<&TypedArray> {
        match self {
            Value::Numeric(a) => Some(a),
            Value::Strings(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Value::Strings(s) => Some(s),
            Value::Numeric(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Numeric(a) => a.len(),
            Value::Strings(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub shape: Vec<u64>,
    pub value: Value,
}

/// Result of walking every group of a file.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Sorted by path.
    pub datasets: Vec<DatasetDescriptor>,

    /// Objects that could not be read, by path.
    pub failures: Vec<(String, Error)>,
}

/// Decode `n` stored elements of type `t`. Variable length strings are fetched from the global
/// heap.
pub async fn decode_value(
    meta: &MetaReader,
    t: &TypeMessage,
    data: &[u8],
    n: u64,
) -> Result<Value> {
    let sizes = meta.sizes();
    let (dtype, order) = Datatype::from_message(t)?;
    let n = n as usize;

    match *t {
        TypeMessage::FixedString { size, padding } => Ok(Value::Strings(
            data.chunks(size.max(1) as usize)
                .take(n)
                .map(|b| trim_string(b, padding))
                .collect(),
        )),
        TypeMessage::VarString { padding } => {
            let esz = t.size(sizes) as usize;
            let mut out = Vec::with_capacity(n);

            for e in data.chunks_exact(esz).take(n) {
                let (len, id) = GlobalHeapId::parse(e, sizes)?;
                if len == 0 || id.collection == 0 || id.collection == UNDEF {
                    out.push(String::new());
                    continue;
                }

                let b = heap::read_global(meta, id).await?;
                out.push(trim_string(&b[..(len as usize).min(b.len())], padding));
            }

            Ok(Value::Strings(out))
        }
        _ => {
            let len = dtype.size().map_or(data.len(), |s| (s * n).min(data.len()));
            Ok(Value::Numeric(TypedArray::decode(dtype, order, &data[..len])?))
        }
    }
}

fn require(h: &ObjectHeader, kind: u16) -> Result<&Message> {
    h.find(kind)
        .ok_or_else(|| Error::format(h.addr, format!("object header without message {kind:#x}")))
}

pub fn is_group(h: &ObjectHeader) -> bool {
    h.has(MSG_SYMBOL_TABLE) || h.has(MSG_LINK_INFO) || h.has(MSG_GROUP_INFO) || h.has(MSG_LINK)
}

pub fn is_dataset(h: &ObjectHeader) -> bool {
    h.has(MSG_LAYOUT) && h.has(MSG_DATASPACE)
}

fn segments(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(String::from)
        .collect()
}

/// How a group stores its links.
enum Storage {
    SymbolTable(SymbolTable),
    Dense(LinkInfo),
    Compact,
}

pub struct GroupWalker {
    meta: Arc<MetaReader>,
    root: u64,
    headers: Arc<Mutex<HashMap<u64, Arc<ObjectHeader>>>>,
    flight: SingleFlight<u64, Arc<ObjectHeader>>,

    /// Resolved paths.
    paths: Mutex<HashMap<String, u64>>,
}

impl GroupWalker {
    pub fn new(meta: Arc<MetaReader>, root: u64) -> GroupWalker {
        GroupWalker {
            meta,
            root,
            headers: Arc::new(Mutex::new(HashMap::new())),
            flight: SingleFlight::new(),
            paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn meta(&self) -> &Arc<MetaReader> {
        &self.meta
    }

    /// Number of object headers read so far.
    pub fn headers_read(&self) -> usize {
        self.headers.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// The object header at `addr`, read at most once.
    pub async fn header(&self, addr: u64) -> Result<Arc<ObjectHeader>> {
        if let Some(h) = self.headers.lock().ok().and_then(|h| h.get(&addr).cloned()) {
            return Ok(h);
        }

        let meta = Arc::clone(&self.meta);
        let arena = Arc::clone(&self.headers);

        self.flight
            .run(addr, async move {
                let h = Arc::new(object_header::read(&meta, addr).await?);
                if let Ok(mut a) = arena.lock() {
                    a.insert(addr, Arc::clone(&h));
                }
                Ok(h)
            })
            .await
    }

    fn storage(&self, group: &ObjectHeader) -> Result<Storage> {
        let sizes = self.meta.sizes();

        if let Some(m) = group.find(MSG_SYMBOL_TABLE) {
            return Ok(Storage::SymbolTable(SymbolTable::parse(m, sizes)?));
        }

        if let Some(m) = group.find(MSG_LINK_INFO) {
            let info = LinkInfo::parse(m, sizes)?;
            if info.is_dense() {
                return Ok(Storage::Dense(info));
            }
        }

        Ok(Storage::Compact)
    }

    /// Look up `name` in a group.
    pub async fn lookup(&self, group: &ObjectHeader, name: &str) -> Result<Option<LinkTarget>> {
        match self.storage(group)? {
            Storage::SymbolTable(st) => Ok(self.symbol_lookup(st, name).await?.map(LinkTarget::Hard)),
            Storage::Dense(info) => Ok(self.dense_lookup(&info, name).await?.map(|l| l.target)),
            Storage::Compact => {
                for m in group.all(MSG_LINK) {
                    let link = Link::parse(m, self.meta.sizes())?;
                    if link.name == name {
                        return Ok(Some(link.target));
                    }
                }
                Ok(None)
            }
        }
    }

    /// All links of a group.
    pub async fn links(&self, group: &ObjectHeader) -> Result<Vec<Link>> {
        match self.storage(group)? {
            Storage::SymbolTable(st) => self.symbol_links(st).await,
            Storage::Dense(info) => self.dense_links(&info).await,
            Storage::Compact => group
                .all(MSG_LINK)
                .map(|m| Link::parse(m, self.meta.sizes()))
                .collect(),
        }
    }

    /// Descend the group B-tree to the one symbol table node that may hold `name`.
    async fn symbol_lookup(&self, st: SymbolTable, name: &str) -> Result<Option<u64>> {
        if st.btree_addr == UNDEF {
            return Ok(None);
        }

        let heap = LocalHeap::read(&self.meta, st.heap_addr).await?;
        let mut visited = HashSet::new();
        let mut addr = st.btree_addr;

        loop {
            if !visited.insert(addr) {
                return Err(Error::format(addr, "group B-tree node visited twice"));
            }

            let node = btree_v1::read_node(&self.meta, addr, 0, 0).await?;

            // Child `i` holds the names after key `i` up to and including key `i + 1`.
            let mut child = None;
            for (i, c) in node.children.iter().enumerate() {
                if let Some(Key::Group(off)) = node.keys.get(i + 1) {
                    if name.as_bytes() <= heap.name(*off)? {
                        child = Some(*c);
                        break;
                    }
                }
            }

            let Some(child) = child else {
                return Ok(None);
            };

            if node.level > 0 {
                addr = child;
                continue;
            }

            for e in heap::read_symbol_node(&self.meta, child).await? {
                if heap.name(e.name_offset)? == name.as_bytes() {
                    return Ok(Some(e.header_addr));
                }
            }

            return Ok(None);
        }
    }

    async fn symbol_links(&self, st: SymbolTable) -> Result<Vec<Link>> {
        let mut out = Vec::new();
        if st.btree_addr == UNDEF {
            return Ok(out);
        }

        let heap = LocalHeap::read(&self.meta, st.heap_addr).await?;
        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([st.btree_addr]);

        while let Some(addr) = pending.pop_front() {
            if !visited.insert(addr) {
                return Err(Error::format(addr, "group B-tree node visited twice"));
            }

            let node = btree_v1::read_node(&self.meta, addr, 0, 0).await?;
            if node.level > 0 {
                pending.extend(node.children);
                continue;
            }

            for c in node.children {
                for e in heap::read_symbol_node(&self.meta, c).await? {
                    out.push(Link {
                        name: String::from_utf8_lossy(heap.name(e.name_offset)?).into_owned(),
                        target: LinkTarget::Hard(e.header_addr),
                        creation_order: None,
                    });
                }
            }
        }

        Ok(out)
    }

    async fn dense_storage(&self, info: &LinkInfo) -> Result<(FractalHeap, btree_v2::Header)> {
        let heap = FractalHeap::read(&self.meta, info.heap_addr).await?;
        let tree = btree_v2::Header::read(&self.meta, info.name_index_addr).await?;

        if tree.kind != TYPE_LINK_NAME {
            return Err(Error::format(
                tree.addr,
                format!("B-tree v2 of type {} used as link name index", tree.kind),
            ));
        }

        Ok((heap, tree))
    }

    /// Descend the name index by hash and fetch only the links with a matching hash.
    async fn dense_lookup(&self, info: &LinkInfo, name: &str) -> Result<Option<Link>> {
        let (heap, tree) = self.dense_storage(info).await?;
        let hash = lookup3(name.as_bytes(), 0);

        let hash_of = |r: Option<&[u8]>| r.and_then(|r| link_name_record(r).ok()).map(|(h, _)| h);

        let records = btree_v2::search(&self.meta, &tree, |lower, upper| {
            hash_of(lower).map_or(true, |l| l <= hash) && hash_of(upper).map_or(true, |u| hash <= u)
        })
        .await?;

        for r in records {
            let (h, id) = link_name_record(&r)?;
            if h != hash {
                continue;
            }

            let obj = heap.object(&self.meta, id).await?;
            let link = Link::parse_bytes(&obj, heap.addr, self.meta.sizes())?;
            if link.name == name {
                return Ok(Some(link));
            }
        }

        Ok(None)
    }

    async fn dense_links(&self, info: &LinkInfo) -> Result<Vec<Link>> {
        let (heap, tree) = self.dense_storage(info).await?;
        let mut out = Vec::new();

        for r in btree_v2::records(&self.meta, &tree).await? {
            let (_, id) = link_name_record(&r)?;
            let obj = heap.object(&self.meta, id).await?;
            out.push(Link::parse_bytes(&obj, heap.addr, self.meta.sizes())?);
        }

        Ok(out)
    }

    /// Resolve a slash separated path to the address of an object header. Soft links are
    /// followed, external links are not supported.
    pub async fn resolve(&self, path: &str) -> Result<u64> {
        if let Some(a) = self.paths.lock().ok().and_then(|p| p.get(path).copied()) {
            return Ok(a);
        }

        let mut pending = segments(path);
        let mut addr = self.root;
        let mut soft = 0;

        while let Some(name) = pending.pop_front() {
            let group = self.header(addr).await?;
            if !is_group(&group) {
                return Err(Error::NotFound(format!(
                    "{path}: {name} is looked up in an object which is not a group"
                )));
            }

            match self.lookup(&group, &name).await? {
                None => return Err(Error::NotFound(format!("{path}: no {name}"))),
                Some(LinkTarget::Hard(a)) => addr = a,
                Some(LinkTarget::Soft(target)) => {
                    soft += 1;
                    if soft > MAX_SOFT_LINKS {
                        return Err(Error::format(
                            group.addr,
                            format!("{path}: more than {MAX_SOFT_LINKS} soft links"),
                        ));
                    }

                    log::trace!("{path}: {name} -> {target}");

                    if target.starts_with('/') {
                        addr = self.root;
                    }
                    let mut next = segments(&target);
                    next.extend(pending.drain(..));
                    pending = next;
                }
                Some(LinkTarget::External { file, path: p }) => {
                    return Err(Error::Unsupported(format!(
                        "{path}: external link to {file}:{p}"
                    )));
                }
            }
        }

        if let Ok(mut p) = self.paths.lock() {
            p.insert(path.to_string(), addr);
        }

        Ok(addr)
    }

    async fn datatype(&self, h: &ObjectHeader) -> Result<TypeMessage> {
        let sizes = self.meta.sizes();
        let m = require(h, MSG_DATATYPE)?;

        if !m.is_shared() {
            return TypeMessage::parse(m, sizes);
        }

        let committed = self.header(shared_address(m, sizes)?).await?;
        TypeMessage::parse(require(&committed, MSG_DATATYPE)?, sizes)
    }

    /// Decode the dataset whose object header is `h`.
    pub async fn describe_header(&self, path: &str, h: &ObjectHeader) -> Result<DatasetDescriptor> {
        let sizes = self.meta.sizes();

        let space = require(h, MSG_DATASPACE)?;
        if space.is_shared() {
            return Err(Error::Unsupported(format!("{path}: shared dataspace")));
        }
        let space = Dataspace::parse(space, sizes)?;
        let dtype = self.datatype(h).await?;
        let layout = Layout::parse(require(h, MSG_LAYOUT)?, sizes)?;

        let filters = h
            .find(MSG_FILTER_PIPELINE)
            .map(|m| filter_pipeline(m, sizes))
            .transpose()?
            .unwrap_or_default();

        let fill = match h.find(MSG_FILL_VALUE).or_else(|| h.find(MSG_FILL_VALUE_OLD)) {
            Some(m) => fill_value(m, sizes)?,
            None => None,
        };

        DatasetDescriptor::new(path, h.addr, &space, &dtype, layout, filters, fill, sizes)
    }

    /// Resolve and decode one dataset.
    pub async fn describe(&self, path: &str) -> Result<DatasetDescriptor> {
        let addr = self.resolve(path).await?;
        let h = self.header(addr).await?;

        if !is_dataset(&h) {
            return Err(Error::NotFound(format!("{path}: not a dataset")));
        }

        self.describe_header(&normalize(path), &h).await
    }

    /// Walk every group reachable from the root by hard links. Objects that fail to decode are
    /// reported and skipped.
    pub async fn discover(&self) -> Result<Discovery> {
        let root = self.header(self.root).await?;
        if !is_group(&root) {
            return Err(Error::format(self.root, "root object is not a group"));
        }

        let mut out = Discovery::default();
        let mut visited = HashSet::from([self.root]);
        let mut pending = VecDeque::from([(String::new(), self.root)]);

        while let Some((prefix, addr)) = pending.pop_front() {
            let group = match self.header(addr).await {
                Ok(g) => g,
                Err(e) => {
                    out.failures.push((prefix, e));
                    continue;
                }
            };

            let links = match self.links(&group).await {
                Ok(l) => l,
                Err(e) => {
                    log::warn!("{}: could not list group: {}", display(&prefix), e);
                    out.failures.push((display(&prefix), e));
                    continue;
                }
            };

            for link in links {
                let path = format!("{prefix}/{}", link.name);

                let a = match link.target {
                    LinkTarget::Hard(a) => a,
                    LinkTarget::Soft(t) => {
                        log::debug!("{path}: soft link to {t} not followed while listing");
                        continue;
                    }
                    LinkTarget::External { file, .. } => {
                        log::debug!("{path}: external link to {file} not followed");
                        continue;
                    }
                };

                if !visited.insert(a) {
                    continue;
                }

                match self.header(a).await {
                    Ok(h) if is_dataset(&h) => match self.describe_header(&path, &h).await {
                        Ok(d) => out.datasets.push(d),
                        Err(e) => {
                            log::warn!("{path}: {e}");
                            out.failures.push((path, e));
                        }
                    },
                    Ok(h) if is_group(&h) => pending.push_back((path, a)),
                    Ok(_) => log::debug!("{path}: neither group nor dataset"),
                    Err(e) => {
                        log::warn!("{path}: {e}");
                        out.failures.push((path, e));
                    }
                }
            }
        }

        out.datasets.sort_by(|a, b| a.path.cmp(&b.path));

        log::debug!(
            "discovered {} datasets in {} groups, {} failures",
            out.datasets.len(),
            visited.len() - out.datasets.len(),
            out.failures.len()
        );

        Ok(out)
    }

    /// Attributes stored in the object header at `path`. Densely stored attributes are not
    /// read, attributes of unsupported types are skipped.
    pub async fn attributes(&self, path: &str) -> Result<Vec<Attribute>> {
        let sizes = self.meta.sizes();
        let h = self.header(self.resolve(path).await?).await?;
        let mut out = Vec::new();

        for m in h.all(MSG_ATTRIBUTE) {
            let a = match AttributeMessage::parse(m, sizes) {
                Ok(a) => a,
                Err(e) => {
                    log::debug!("{path}: skipping attribute: {e}");
                    continue;
                }
            };

            match decode_value(&self.meta, &a.dtype, &a.data, a.space.size()).await {
                Ok(value) => out.push(Attribute {
                    name: a.name,
                    shape: a.space.dims().to_vec(),
                    value,
                }),
                Err(e) => log::debug!("{path}: skipping attribute {}: {e}", a.name),
            }
        }

        if h.has(MSG_ATTRIBUTE_INFO) {
            log::debug!("{path}: densely stored attributes are not read");
        }

        Ok(out)
    }
}

fn display(prefix: &str) -> String {
    if prefix.is_empty() {
        "/".into()
    } else {
        prefix.into()
    }
}

/// `a//b/` as `/a/b`.
pub fn normalize(path: &str) -> String {
    let s = segments(path);
    if s.is_empty() {
        "/".into()
    } else {
        s.iter().fold(String::new(), |acc, s| acc + "/" + s)
    }
}
