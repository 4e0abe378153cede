//! Tree traversal for the merged overlay iterator.
//!
//! The overlay merge works over (key, doubled-offset) positions, so the
//! tree exposes the same stateless primitives as the in-memory buffers:
//! first entry at-or-after a position, last entry strictly before one, and
//! an exact-match probe. Every tree entry is an insert (tombstones live in
//! the buffer layers), so doubled offsets always carry the low bit.
//!
//! Keys yielded here are full keys, rematerialized from record data; the
//! stored known prefixes only steer the descent.

use bytes::Bytes;

use crate::index::ixbuf::double;

use super::node::FNode;
use super::Fbtree;

pub(crate) struct Walk {
    /// One (node, position) per level, interior levels first, leaf last.
    stack: Vec<(FNode, usize)>,
}

impl Walk {
    fn cur(&self) -> (u64, &[u8]) {
        let (leaf, pos) = self.stack.last().expect("positioned walk");
        let e = &leaf.entries[*pos];
        (e.offset, &e.known)
    }
}

impl Fbtree {
    fn cur_doubled(&self, w: &Walk) -> (Bytes, u64) {
        let (off, _) = w.cur();
        (self.leaf_key(off), double(off))
    }

    fn descend_first(&self, w: &mut Walk, mut off: u64) {
        while w.stack.len() < self.tree_levels() {
            let node = self.get_node(off);
            off = node.entries[0].offset;
            w.stack.push((node, 0));
        }
        let leaf = self.get_node(off);
        w.stack.push((leaf, 0));
    }

    fn descend_last(&self, w: &mut Walk, mut off: u64) {
        while w.stack.len() < self.tree_levels() {
            let node = self.get_node(off);
            let last = node.len() - 1;
            off = node.entries[last].offset;
            w.stack.push((node, last));
        }
        let leaf = self.get_node(off);
        let last = leaf.len() - 1;
        w.stack.push((leaf, last));
    }

    fn walk_first(&self) -> Option<Walk> {
        let mut w = Walk { stack: Vec::new() };
        self.descend_first(&mut w, self.root());
        if w.stack.last().unwrap().0.is_empty() {
            return None; // empty root leaf
        }
        Some(w)
    }

    fn walk_last(&self) -> Option<Walk> {
        if self.tree_levels() == 0 && self.get_node(self.root()).is_empty() {
            return None;
        }
        let mut w = Walk { stack: Vec::new() };
        self.descend_last(&mut w, self.root());
        Some(w)
    }

    fn advance(&self, w: &mut Walk) -> bool {
        {
            let (leaf, pos) = w.stack.last_mut().unwrap();
            *pos += 1;
            if *pos < leaf.len() {
                return true;
            }
        }
        w.stack.pop();
        loop {
            let next = match w.stack.last_mut() {
                None => return false,
                Some((node, pos)) => {
                    *pos += 1;
                    if *pos < node.len() {
                        Some(node.entries[*pos].offset)
                    } else {
                        None
                    }
                }
            };
            match next {
                Some(off) => {
                    self.descend_first(w, off);
                    return true;
                }
                None => {
                    w.stack.pop();
                }
            }
        }
    }

    fn retreat(&self, w: &mut Walk) -> bool {
        {
            let (_, pos) = w.stack.last_mut().unwrap();
            if *pos > 0 {
                *pos -= 1;
                return true;
            }
        }
        w.stack.pop();
        loop {
            let next = match w.stack.last_mut() {
                None => return false,
                Some((node, pos)) => {
                    if *pos > 0 {
                        *pos -= 1;
                        Some(node.entries[*pos].offset)
                    } else {
                        None
                    }
                }
            };
            match next {
                Some(off) => {
                    self.descend_last(w, off);
                    return true;
                }
                None => {
                    w.stack.pop();
                }
            }
        }
    }

    /// Position at the first entry whose full key is `>= key`.
    fn walk_ge(&self, key: &[u8]) -> Option<Walk> {
        let mut w = Walk { stack: Vec::new() };
        let mut off = self.root();
        for _ in 0..self.tree_levels() {
            let node = self.get_node(off);
            let i = node.search(key);
            off = node.entries[i].offset;
            w.stack.push((node, i));
        }
        let leaf = self.get_node(off);
        if leaf.is_empty() {
            return None; // only the empty root leaf can be empty
        }
        let mut found = None;
        for (i, e) in leaf.entries.iter().enumerate() {
            if e.known.as_ref() >= key {
                found = Some(i);
                break;
            }
            if self.leaf_key(e.offset).as_ref() >= key {
                found = Some(i);
                break;
            }
        }
        match found {
            Some(i) => {
                w.stack.push((leaf, i));
                Some(w)
            }
            None => {
                // everything in this leaf is below the key
                let last = leaf.len() - 1;
                w.stack.push((leaf, last));
                self.advance(&mut w).then_some(w)
            }
        }
    }

    /// Position at the last entry whose full key is `<= key`.
    fn walk_le(&self, key: &[u8]) -> Option<Walk> {
        let mut w = Walk { stack: Vec::new() };
        let mut off = self.root();
        for _ in 0..self.tree_levels() {
            let node = self.get_node(off);
            let i = node.search(key);
            off = node.entries[i].offset;
            w.stack.push((node, i));
        }
        let leaf = self.get_node(off);
        if leaf.is_empty() {
            return None;
        }
        let mut found = None;
        for (i, e) in leaf.entries.iter().enumerate() {
            if e.known.as_ref() > key {
                break;
            }
            if self.leaf_key(e.offset).as_ref() > key {
                break;
            }
            found = Some(i);
        }
        match found {
            Some(i) => {
                w.stack.push((leaf, i));
                Some(w)
            }
            None => {
                // deletions can leave the subtree minimum above the key
                w.stack.push((leaf, 0));
                self.retreat(&mut w).then_some(w)
            }
        }
    }

    /// First entry at or after position `(key, doubled)`; `None` position
    /// means the start.
    pub(crate) fn next_at(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        match pos {
            None => {
                let w = self.walk_first()?;
                Some(self.cur_doubled(&w))
            }
            Some((key, d)) => {
                let mut w = self.walk_ge(key)?;
                loop {
                    let (full, dd) = self.cur_doubled(&w);
                    if full.as_ref() > key || dd >= d {
                        return Some((full, dd));
                    }
                    if !self.advance(&mut w) {
                        return None;
                    }
                }
            }
        }
    }

    /// Last entry strictly before position `(key, doubled)`; `None`
    /// position means the end.
    pub(crate) fn prev_before(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        match pos {
            None => {
                let w = self.walk_last()?;
                Some(self.cur_doubled(&w))
            }
            Some((key, d)) => {
                let mut w = self.walk_le(key)?;
                loop {
                    let (full, dd) = self.cur_doubled(&w);
                    if full.as_ref() < key || dd < d {
                        return Some((full, dd));
                    }
                    if !self.retreat(&mut w) {
                        return None;
                    }
                }
            }
        }
    }

    pub(crate) fn has_exact(&self, key: &[u8], d: u64) -> bool {
        if d & 1 == 0 {
            return false; // the tree holds no tombstones
        }
        self.lookup(key).map(double) == Some(d)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::index::ixbuf::undouble;
    use crate::ixkey::IxSpec;
    use crate::record::RecordBuilder;
    use crate::stor::Stor;

    fn build(n: u32) -> Fbtree {
        let store = Arc::new(Stor::heap(1 << 22));
        Fbtree::create(store.clone(), Arc::new(IxSpec::new(vec![0]))).update(|t| {
            for i in 0..n {
                let k = format!("it{i:05}").into_bytes();
                let mut b = RecordBuilder::new();
                b.add(Bytes::copy_from_slice(&k));
                let off = store.save_sized(b.build().as_bytes());
                t.insert(&k, off);
            }
        })
    }

    #[test]
    fn forward_scan_in_order() {
        let t = build(1000);
        let mut pos: Option<(Bytes, u64)> = None;
        let mut n = 0u32;
        while let Some((k, d)) = t.next_at(pos.as_ref().map(|(k, d)| (k.as_ref(), *d))) {
            assert_eq!(k.as_ref(), format!("it{n:05}").as_bytes());
            assert_eq!(t.lookup(&k), Some(undouble(d)));
            pos = Some((k, d + 1));
            n += 1;
        }
        assert_eq!(n, 1000);
    }

    #[test]
    fn backward_scan_in_order() {
        let t = build(1000);
        let mut pos: Option<(Bytes, u64)> = None;
        let mut n = 1000u32;
        while let Some((k, d)) = t.prev_before(pos.as_ref().map(|(k, d)| (k.as_ref(), *d))) {
            n -= 1;
            assert_eq!(k.as_ref(), format!("it{n:05}").as_bytes());
            pos = Some((k, d));
        }
        assert_eq!(n, 0);
    }

    #[test]
    fn seek_positions_at_or_after() {
        let t = build(100);
        let (k, _) = t.next_at(Some((b"it00050", 0))).unwrap();
        assert_eq!(k.as_ref(), b"it00050");
        let (k, _) = t.next_at(Some((b"it00050x", 0))).unwrap();
        assert_eq!(k.as_ref(), b"it00051");
        assert!(t.next_at(Some((b"it99999", 0))).is_none());
        let (k, _) = t.prev_before(Some((b"it00050", 0))).unwrap();
        assert_eq!(k.as_ref(), b"it00049");
    }

    #[test]
    fn empty_tree_iterates_nothing() {
        let store = Arc::new(Stor::heap(1 << 16));
        let t = Fbtree::create(store, Arc::new(IxSpec::new(vec![0])));
        assert!(t.next_at(None).is_none());
        assert!(t.prev_before(None).is_none());
    }
}
