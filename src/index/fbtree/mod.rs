//! Persistent on-disk B-tree.
//!
//! An `Fbtree` is immutable: readers walk from a root offset through
//! interior nodes to leaves, consulting the in-memory redirection table
//! before dereferencing any offset. Updates happen only inside
//! [`Fbtree::update`] closures run by the background persister — inserts and
//! deletes produce mutable in-memory nodes, splits allocate fake offsets,
//! and [`Fbtree::save`] serializes the damage using one of two strategies:
//!
//! - **keep**: write out mnodes, leave interior rewiring as redirects, and
//!   persist the (small) redirects block alongside the new root.
//! - **flatten**: once redirects pile up past [`REDIR_MAX`], rewrite every
//!   modified interior node so all references are final offsets and drop
//!   the table.
//!
//! Leaves store only data offsets; keys are rematerialized through the
//! configured [`GetLeafKey`] callback, at the cost of a record read per
//! comparison. Interior nodes keep near-full separator keys so descents
//! stay cheap.

pub(crate) mod builder;
pub(crate) mod iter;
pub(crate) mod node;
pub(crate) mod redirs;

use std::sync::Arc;

use bytes::Bytes;

use crate::index::ixbuf::{Ixbuf, TOMBSTONE};
use crate::ixkey::IxSpec;
use crate::stor::Stor;

pub use builder::TreeBuilder;
pub(crate) use node::{FEntry, FNode, MAX_NODE_SIZE};
use node::embed;
use redirs::{is_fake, Redir, Redirs};

/// Flatten instead of keeping redirects past this many table entries.
pub const REDIR_MAX: usize = 100;

/// Window of recently written bytes walked by the quick check.
const RECENT_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("tree corrupt: {0}")]
    Corrupt(&'static str),

    #[error("tree corrupt: {0}")]
    CorruptAt(String),
}

/// Rematerialize the index key for a data offset.
pub type GetLeafKey = fn(&Stor, &IxSpec, u64) -> Bytes;

/// The default leaf-key callback: read the record at `off` and apply the
/// index's key spec.
pub fn record_leaf_key(store: &Stor, spec: &IxSpec, off: u64) -> Bytes {
    spec.key(store.data_sized(off))
}

#[derive(Clone)]
pub struct Fbtree {
    root: u64,
    tree_levels: usize,
    store: Arc<Stor>,
    ixspec: Arc<IxSpec>,
    redirs: Redirs,
    redirs_off: u64,
    mutable: bool,
    get_leaf_key: GetLeafKey,
}

impl Fbtree {
    /// A new empty tree: a single empty leaf, written to the store so the
    /// root offset is real from birth (catalogs persist root offsets even
    /// for tables that never see data).
    pub fn create(store: Arc<Stor>, ixspec: Arc<IxSpec>) -> Fbtree {
        let root = FNode::default().put(&store);
        Fbtree {
            root,
            tree_levels: 0,
            store,
            ixspec,
            redirs: Redirs::new(),
            redirs_off: 0,
            mutable: false,
            get_leaf_key: record_leaf_key,
        }
    }

    pub fn open(
        store: Arc<Stor>,
        ixspec: Arc<IxSpec>,
        root: u64,
        tree_levels: usize,
        redirs_off: u64,
    ) -> Result<Fbtree, TreeError> {
        let redirs = Redirs::load(&store, redirs_off)?;
        Ok(Fbtree {
            root,
            tree_levels,
            store,
            ixspec,
            redirs,
            redirs_off,
            mutable: false,
            get_leaf_key: record_leaf_key,
        })
    }

    pub(crate) fn with_get_leaf_key(mut self, f: GetLeafKey) -> Fbtree {
        self.get_leaf_key = f;
        self
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn tree_levels(&self) -> usize {
        self.tree_levels
    }

    pub fn redirs_off(&self) -> u64 {
        self.redirs_off
    }

    pub fn ixspec(&self) -> &Arc<IxSpec> {
        &self.ixspec
    }

    pub fn store(&self) -> &Arc<Stor> {
        &self.store
    }

    pub(crate) fn leaf_key(&self, off: u64) -> Bytes {
        (self.get_leaf_key)(&self.store, &self.ixspec, off)
    }

    /// The node at `off`, decoded, following the redirection table.
    pub(crate) fn get_node(&self, off: u64) -> FNode {
        if let Some(r) = self.redirs.get(off) {
            if let Some(m) = &r.mnode {
                return (**m).clone();
            }
            return FNode::decode(self.store.data_sized(r.new_offset));
        }
        FNode::decode(self.store.data_sized(off))
    }

    fn get_node_ck(&self, off: u64) -> Result<FNode, TreeError> {
        let real = match self.redirs.get(off) {
            Some(r) => {
                if let Some(m) = &r.mnode {
                    return Ok((**m).clone());
                }
                r.new_offset
            }
            None => off,
        };
        let buf = self
            .store
            .data_sized_ck(real)
            .map_err(|_| TreeError::Corrupt("node checksum mismatch"))?;
        Ok(FNode::decode(buf))
    }

    /// Exact-match lookup: the data offset stored under `key`, if any.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let node = self.get_node(off);
            off = node.entries[node.search(key)].offset;
        }
        let leaf = self.get_node(off);
        if leaf.is_empty() {
            return None;
        }
        let i = leaf.search(key);
        let e = &leaf.entries[i];
        if !key.starts_with(e.known.as_ref()) {
            return None;
        }
        let full = self.leaf_key(e.offset);
        (full.as_ref() == key).then_some(e.offset)
    }

    // mutation (persister only) ----------------------------------------

    /// Run `f` against a mutable copy; the result is frozen again.
    pub fn update(&self, f: impl FnOnce(&mut Fbtree)) -> Fbtree {
        let mut t = self.clone();
        t.mutable = true;
        t.redirs = t.redirs.mutable();
        f(&mut t);
        t.redirs = std::mem::replace(&mut t.redirs, Redirs::new()).freeze();
        t.mutable = false;
        t
    }

    /// Apply a base buffer's inserts and tombstones, then save.
    pub fn merge_and_save(&self, base: &Ixbuf) -> Fbtree {
        self.update(|t| {
            for (key, off) in base.entries() {
                if off & TOMBSTONE != 0 {
                    let found = t.delete(&key, off & !TOMBSTONE);
                    debug_assert!(found, "tombstone without tree entry");
                } else {
                    t.insert(&key, off);
                }
            }
            t.save();
        })
    }

    fn set_mnode(&mut self, off: u64, node: FNode) {
        self.redirs.put(Redir {
            offset: off,
            new_offset: 0,
            mnode: Some(Arc::new(node)),
        });
    }

    fn add_path(&mut self, off: u64) {
        if !is_fake(off) && off != self.root {
            self.redirs.path_add(off);
        }
    }

    fn path_node(&self, off: u64) -> bool {
        is_fake(off) || off == self.root || self.redirs.path_has(off)
    }

    /// Insert `key -> off`. Keys are unique; inserting an existing key is a
    /// caller bug upstream (duplicates are rejected at the action layer).
    pub fn insert(&mut self, key: &[u8], off: u64) {
        assert!(self.mutable, "insert on frozen tree");
        let mut path = Vec::with_capacity(self.tree_levels);
        let mut node_off = self.root;
        for _ in 0..self.tree_levels {
            self.add_path(node_off);
            let node = self.get_node(node_off);
            let i = node.search(key);
            path.push((node_off, i));
            node_off = node.entries[i].offset;
        }

        let mut leaf = self.get_node(node_off);
        let (pos, prev_full) = self.leaf_pos(&leaf, key);
        let known = match (pos, &prev_full) {
            (0, _) => Bytes::new(),
            (_, Some(prev)) => embed(prev, key, 1),
            _ => unreachable!("missing predecessor key"),
        };
        leaf.entries.insert(pos, FEntry { offset: off, known });
        if pos == 0 && leaf.len() > 1 {
            let next_full = self.leaf_key(leaf.entries[1].offset);
            leaf.entries[1].known = embed(key, &next_full, 1);
        } else if pos + 1 < leaf.len() {
            let next_full = self.leaf_key(leaf.entries[pos + 1].offset);
            leaf.entries[pos + 1].known = embed(key, &next_full, 1);
        }

        if leaf.stor_size() <= MAX_NODE_SIZE {
            self.set_mnode(node_off, leaf);
            return;
        }
        let (left, right, sep) = self.split(leaf, true);
        self.set_mnode(node_off, left);
        let right_off = self.redirs.add_mnode(right);
        self.insert_upward(path, sep, right_off);
    }

    /// Position of the first leaf entry whose full key is `> key`, plus the
    /// full key of its predecessor. Panics on an exact match.
    fn leaf_pos(&self, leaf: &FNode, key: &[u8]) -> (usize, Option<Bytes>) {
        let mut prev_full = None;
        for (i, e) in leaf.entries.iter().enumerate() {
            if e.known.as_ref() > key {
                return (i, prev_full);
            }
            let full = self.leaf_key(e.offset);
            if full.as_ref() > key {
                return (i, prev_full);
            }
            assert!(full.as_ref() != key, "duplicate key in tree");
            prev_full = Some(full);
        }
        (leaf.len(), prev_full)
    }

    /// Split an oversized node roughly in half by serialized size.
    /// Returns (left, right, separator); the separator is the full first
    /// key of the right node.
    fn split(&self, mut node: FNode, leaf: bool) -> (FNode, FNode, Bytes) {
        let half = node.stor_size() / 2;
        let mut acc = 0usize;
        let mut m = 0usize;
        for (i, e) in node.entries.iter().enumerate() {
            acc += 9 + e.known.len();
            if acc >= half && i + 1 < node.len() {
                m = i + 1;
                break;
            }
        }
        if m == 0 {
            m = node.len() / 2;
        }
        let mut right_entries = node.entries.split_off(m);
        let sep = if leaf {
            self.leaf_key(right_entries[0].offset)
        } else {
            right_entries[0].known.clone()
        };
        right_entries[0].known = Bytes::new();
        (
            node,
            FNode {
                entries: right_entries,
            },
            sep,
        )
    }

    fn insert_upward(&mut self, mut path: Vec<(u64, usize)>, sep: Bytes, child_off: u64) {
        let mut sep = sep;
        let mut child_off = child_off;
        loop {
            match path.pop() {
                None => {
                    let new_root = FNode {
                        entries: vec![
                            FEntry {
                                offset: self.root,
                                known: Bytes::new(),
                            },
                            FEntry {
                                offset: child_off,
                                known: sep,
                            },
                        ],
                    };
                    self.root = self.redirs.add_mnode(new_root);
                    self.tree_levels += 1;
                    return;
                }
                Some((node_off, i)) => {
                    let mut node = self.get_node(node_off);
                    node.entries.insert(
                        i + 1,
                        FEntry {
                            offset: child_off,
                            known: sep.clone(),
                        },
                    );
                    if node.stor_size() <= MAX_NODE_SIZE {
                        self.set_mnode(node_off, node);
                        return;
                    }
                    let (left, right, sep2) = self.split(node, false);
                    self.set_mnode(node_off, left);
                    child_off = self.redirs.add_mnode(right);
                    sep = sep2;
                }
            }
        }
    }

    /// Remove the entry for `key`; returns whether it was present.
    pub fn delete(&mut self, key: &[u8], off: u64) -> bool {
        assert!(self.mutable, "delete on frozen tree");
        let mut path = Vec::with_capacity(self.tree_levels);
        let mut node_off = self.root;
        for _ in 0..self.tree_levels {
            self.add_path(node_off);
            let node = self.get_node(node_off);
            let i = node.search(key);
            path.push((node_off, i));
            node_off = node.entries[i].offset;
        }

        let mut leaf = self.get_node(node_off);
        let mut found = None;
        let mut prev_full: Option<Bytes> = None;
        for (i, e) in leaf.entries.iter().enumerate() {
            if e.known.as_ref() > key {
                break;
            }
            let full = self.leaf_key(e.offset);
            if full.as_ref() > key {
                break;
            }
            if full.as_ref() == key {
                found = Some(i);
                break;
            }
            prev_full = Some(full);
        }
        let i = match found {
            None => return false,
            Some(i) => i,
        };
        debug_assert_eq!(leaf.entries[i].offset, off, "tombstone offset mismatch");
        leaf.entries.remove(i);
        if i == 0 && !leaf.is_empty() {
            leaf.entries[0].known = Bytes::new();
        } else if i < leaf.len() {
            let prev = prev_full.expect("predecessor exists past position 0");
            let full = self.leaf_key(leaf.entries[i].offset);
            leaf.entries[i].known = embed(&prev, &full, 1);
        }
        if leaf.is_empty() && self.tree_levels > 0 {
            self.redirs.delete(node_off);
            self.remove_upward(path, node_off);
        } else {
            self.set_mnode(node_off, leaf);
        }
        true
    }

    fn remove_upward(&mut self, mut path: Vec<(u64, usize)>, child_off: u64) {
        let mut child_off = child_off;
        loop {
            match path.pop() {
                None => {
                    // the whole tree emptied out
                    debug_assert_eq!(child_off, self.root);
                    self.redirs.delete(self.root);
                    self.root = self.redirs.add_mnode(FNode::default());
                    self.tree_levels = 0;
                    return;
                }
                Some((node_off, i)) => {
                    let mut node = self.get_node(node_off);
                    node.entries.remove(i);
                    self.redirs.delete(child_off);
                    self.redirs.path_delete(child_off);
                    if node.is_empty() {
                        child_off = node_off;
                        continue;
                    }
                    if i == 0 {
                        node.entries[0].known = Bytes::new();
                    }
                    self.set_mnode(node_off, node);
                    return;
                }
            }
        }
    }

    // persistence -------------------------------------------------------

    /// Serialize dirty state: always `keep` the mnodes, then either persist
    /// the redirects block or flatten it away.
    pub fn save(&mut self) {
        assert!(self.mutable, "save on frozen tree");
        self.keep();
        if self.redirs.count() < REDIR_MAX {
            self.redirs_off = self.redirs.save(&self.store);
        } else {
            self.flatten();
        }
    }

    /// Write all in-memory nodes to the store, retaining interior rewiring
    /// as redirects instead of rewriting clean interior nodes.
    fn keep(&mut self) {
        let root = self.keep2(0, self.root);
        self.redirs.delete(self.root);
        self.root = root;
    }

    fn keep2(&mut self, depth: usize, node_off: u64) -> u64 {
        if depth < self.tree_levels {
            let has_mnode = self
                .redirs
                .get(node_off)
                .is_some_and(|r| r.mnode.is_some());
            if !has_mnode && !self.path_node(node_off) {
                return node_off;
            }
            let mut node = self.get_node(node_off);
            let mut modified = false;
            for i in 0..node.len() {
                let child = node.entries[i].offset;
                let child2 = self.keep2(depth + 1, child);
                if child2 == child {
                    continue;
                }
                if !has_mnode {
                    // clean interior node stays; redirect the child
                    self.redirs.put(Redir {
                        offset: child,
                        new_offset: child2,
                        mnode: None,
                    });
                } else {
                    node.entries[i].offset = child2;
                    modified = true;
                    self.redirs.delete(child);
                    if self.path_node(child) {
                        if !is_fake(child) {
                            self.redirs.path_delete(child);
                        }
                        if depth + 1 < self.tree_levels {
                            self.redirs.path_add(child2);
                        }
                    }
                }
            }
            if !has_mnode {
                return node_off;
            }
            let _ = modified;
            node.put(&self.store)
        } else {
            match self.redirs.get(node_off).cloned() {
                None => node_off,
                Some(r) => match r.mnode {
                    None => r.new_offset,
                    Some(m) => m.put(&self.store),
                },
            }
        }
    }

    /// Rewrite every modified interior node so all references use final
    /// offsets, then clear the redirection table.
    fn flatten(&mut self) {
        let root = self.flatten2(0, self.root);
        self.root = root;
        self.redirs = Redirs::new().mutable();
        self.redirs_off = 0;
    }

    fn flatten2(&mut self, depth: usize, node_off: u64) -> u64 {
        if depth < self.tree_levels {
            let ro = self.get_node(node_off);
            let mut rw: Option<FNode> = None;
            for i in 0..ro.len() {
                let child = ro.entries[i].offset;
                // only traverse modified paths, not the whole tree
                if depth + 1 == self.tree_levels || self.path_node(child) {
                    let child2 = self.flatten2(depth + 1, child);
                    if child2 != child {
                        rw.get_or_insert_with(|| ro.clone()).entries[i].offset = child2;
                    }
                }
            }
            match rw {
                Some(node) => node.put(&self.store),
                None => match self.redirs.get(node_off).cloned() {
                    Some(r) => match r.mnode {
                        Some(m) => m.put(&self.store),
                        None => r.new_offset,
                    },
                    None => node_off,
                },
            }
        } else {
            match self.redirs.get(node_off).cloned() {
                None => node_off,
                Some(r) => match r.mnode {
                    None => r.new_offset,
                    Some(m) => m.put(&self.store),
                },
            }
        }
    }

    // integrity ---------------------------------------------------------

    /// Walk the whole tree verifying key order, prefix/data agreement and
    /// node checksums. Applies `f` to every data offset; returns
    /// (entry count, node bytes, node count).
    pub fn check(
        &self,
        f: &mut impl FnMut(u64),
    ) -> Result<(usize, usize, usize), TreeError> {
        let mut last = Bytes::new();
        self.check1(0, self.root, &mut last, f)
    }

    fn check1(
        &self,
        depth: usize,
        off: u64,
        last: &mut Bytes,
        f: &mut impl FnMut(u64),
    ) -> Result<(usize, usize, usize), TreeError> {
        let node = self.get_node_ck(off)?;
        let mut count = 0;
        let mut size = node.stor_size();
        let mut nnodes = 1;
        for (i, e) in node.entries.iter().enumerate() {
            if depth < self.tree_levels {
                if i > 0 && last.as_ref() > e.known.as_ref() {
                    return Err(TreeError::CorruptAt(format!(
                        "separator out of order at {off}"
                    )));
                }
                let (c, s, n) = self.check1(depth + 1, e.offset, last, f)?;
                count += c;
                size += s;
                nnodes += n;
            } else {
                count += 1;
                f(e.offset);
                let full = self.leaf_key(e.offset);
                if !full.starts_with(e.known.as_ref()) {
                    return Err(TreeError::CorruptAt(format!(
                        "index key does not match data at {off}"
                    )));
                }
                if last.as_ref() > full.as_ref() {
                    return Err(TreeError::CorruptAt(format!("keys out of order at {off}")));
                }
                *last = full;
            }
        }
        Ok((count, size, nnodes))
    }

    /// Verify only recently written nodes and records: follows children
    /// whose offsets fall in the recent window or that sit on a modified
    /// path. Applies `f` to recent data offsets.
    pub fn quick_check(&self, f: &mut impl FnMut(u64)) -> Result<(), TreeError> {
        let recent = self.store.size().saturating_sub(RECENT_SIZE);
        self.quick_check1(0, self.root, recent, f)
    }

    fn quick_check1(
        &self,
        depth: usize,
        off: u64,
        recent: u64,
        f: &mut impl FnMut(u64),
    ) -> Result<(), TreeError> {
        let node = self.get_node_ck(off)?;
        if depth < self.tree_levels {
            for e in &node.entries {
                if e.offset >= recent || self.path_node(e.offset) {
                    self.quick_check1(depth + 1, e.offset, recent, f)?;
                }
            }
        } else {
            for e in &node.entries {
                if e.offset >= recent {
                    f(e.offset);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fbtree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fbtree")
            .field("root", &self.root)
            .field("tree_levels", &self.tree_levels)
            .field("redirs", &self.redirs.count())
            .finish()
    }
}
