//! Composite index: one on-disk tree plus layered in-memory buffers.
//!
//! Layer order, oldest to newest: the tree, the base buffer (`under[0]`),
//! one buffer per un-merged committed transaction, and — inside an update
//! transaction only — a mutable buffer collecting that transaction's writes.
//!
//! Lifecycle: a transaction starts with `mutable()` (a snapshot of the
//! layer list plus a fresh mutable buffer); commit re-bases onto the latest
//! published overlay with `update_with`, appending the mutable buffer as a
//! new immutable layer. The background worker folds layers into the base
//! (`merge`/`with_merged`) and folds the base into the tree
//! (`save`/`with_saved`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::index::fbtree::Fbtree;
use crate::index::ixbuf::{self, is_tombstone, Ixbuf, Lookup, TOMBSTONE};
use crate::ixkey::IxSpec;
use crate::stor::Stor;

#[derive(Debug, Clone)]
pub struct Overlay {
    pub(crate) fb: Fbtree,
    pub(crate) under: Vec<Arc<Ixbuf>>,
    pub(crate) mutbuf: Option<Arc<Ixbuf>>,
    /// Bumped on every write through this overlay; iterators sample it to
    /// report invalidation.
    pub(crate) mods: Arc<AtomicU64>,
}

impl Overlay {
    pub fn new(store: Arc<Stor>, ixspec: Arc<IxSpec>) -> Overlay {
        Overlay::for_tree(Fbtree::create(store, ixspec))
    }

    pub fn for_tree(fb: Fbtree) -> Overlay {
        Overlay {
            fb,
            under: vec![Arc::new(Ixbuf::new())],
            mutbuf: None,
            mods: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ixspec(&self) -> &Arc<IxSpec> {
        self.fb.ixspec()
    }

    pub fn tree(&self) -> &Fbtree {
        &self.fb
    }

    /// A modifiable copy for one update transaction: shared layers plus a
    /// fresh mutable buffer.
    pub fn mutable(&self) -> Overlay {
        debug_assert!(self.mutbuf.is_none());
        Overlay {
            fb: self.fb.clone(),
            under: self.under.clone(),
            mutbuf: Some(Arc::new(Ixbuf::new())),
            mods: self.mods.clone(),
        }
    }

    pub fn insert(&self, key: Bytes, off: u64) {
        self.mutbuf
            .as_ref()
            .expect("insert on read-only overlay")
            .insert(key, off);
        self.mods.fetch_add(1, Ordering::Release);
    }

    /// Remove `key -> off`: take back this transaction's own insert, or
    /// record a tombstone masking a lower layer.
    pub fn delete(&self, key: Bytes, off: u64) {
        let mutbuf = self.mutbuf.as_ref().expect("delete on read-only overlay");
        if !mutbuf.remove_insert(&key, off) {
            mutbuf.insert(key, off | TOMBSTONE);
        }
        self.mods.fetch_add(1, Ordering::Release);
    }

    pub fn mods(&self) -> u64 {
        self.mods.load(Ordering::Acquire)
    }

    /// Exact-match lookup through the layers, newest first.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if let Some(mutbuf) = &self.mutbuf {
            match mutbuf.lookup(key) {
                Lookup::Present(off) => return Some(off),
                Lookup::Masked => return None,
                Lookup::Absent => {}
            }
        }
        for layer in self.under.iter().rev() {
            match layer.lookup(key) {
                Lookup::Present(off) => return Some(off),
                Lookup::Masked => return None,
                Lookup::Absent => {}
            }
        }
        self.fb.lookup(key)
    }

    pub fn layer_count(&self) -> usize {
        self.under.len()
    }

    /// Entries in this transaction's own mutable buffer.
    pub fn mut_len(&self) -> usize {
        self.mutbuf.as_ref().map_or(0, |b| b.len())
    }

    pub fn base_len(&self) -> usize {
        self.under[0].len()
    }

    /// Total entries across the un-merged layers (excluding the base).
    pub fn unmerged_len(&self) -> usize {
        self.under[1..].iter().map(|b| b.len()).sum()
    }

    /// Combine this transaction's writes with the latest published overlay.
    /// The checker has already established the updates are independent.
    pub fn update_with(&self, latest: &Overlay) -> Overlay {
        let mutbuf = self.mutbuf.clone().expect("update_with without writes");
        let mut under = latest.under.clone();
        under.push(mutbuf);
        Overlay {
            fb: latest.fb.clone(),
            under,
            mutbuf: None,
            mods: latest.mods.clone(),
        }
    }

    /// Fold layers `0..=nmerge` into a new base buffer. Runs against
    /// immutable layers; the caller publishes with [`Overlay::with_merged`].
    pub fn merge(&self, nmerge: usize) -> Ixbuf {
        debug_assert!(self.mutbuf.is_none());
        ixbuf::merge(&self.under[..=nmerge])
    }

    pub fn with_merged(&self, merged: Ixbuf, nmerged: usize) -> Overlay {
        let mut under = Vec::with_capacity(self.under.len() - nmerged);
        under.push(Arc::new(merged));
        under.extend_from_slice(&self.under[nmerged + 1..]);
        Overlay {
            fb: self.fb.clone(),
            under,
            mutbuf: None,
            mods: self.mods.clone(),
        }
    }

    /// Fold the base buffer into the tree; the caller publishes with
    /// [`Overlay::with_saved`].
    pub fn save(&self) -> Fbtree {
        debug_assert!(self.mutbuf.is_none());
        self.fb.merge_and_save(&self.under[0])
    }

    pub fn with_saved(&self, fb: Fbtree) -> Overlay {
        let mut under = Vec::with_capacity(self.under.len());
        under.push(Arc::new(Ixbuf::new()));
        under.extend_from_slice(&self.under[1..]);
        Overlay {
            fb,
            under,
            mutbuf: None,
            mods: self.mods.clone(),
        }
    }

    // merged cursor primitives -----------------------------------------

    /// First visible entry at or after position `(key, doubled)`.
    /// Tombstones sort just before the insert they mask, so a matched pair
    /// is stepped over in one move; an unmatched tombstone is skipped.
    pub(crate) fn next_at(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        let mut pos: Option<(Bytes, u64)> = pos.map(|(k, d)| (Bytes::copy_from_slice(k), d));
        loop {
            let p = pos.as_ref().map(|(k, d)| (k.as_ref(), *d));
            let mut best: Option<(Bytes, u64)> = None;
            self.each_source(|src| {
                if let Some(h) = src.next_at(p) {
                    if better_min(&best, &h) {
                        best = Some(h);
                    }
                }
            });
            let (key, d) = best?;
            if !is_tombstone(d) {
                return Some((key, d));
            }
            let skip_to = if self.any_exact(&key, d | 1) { d + 2 } else { d + 1 };
            pos = Some((key, skip_to));
        }
    }

    /// Last visible entry strictly before position `(key, doubled)`.
    /// Walking backwards meets an insert before its masking tombstone, so
    /// each insert is probed for a matching tombstone below it.
    pub(crate) fn prev_before(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        let mut pos: Option<(Bytes, u64)> = pos.map(|(k, d)| (Bytes::copy_from_slice(k), d));
        loop {
            let p = pos.as_ref().map(|(k, d)| (k.as_ref(), *d));
            let mut best: Option<(Bytes, u64)> = None;
            self.each_source(|src| {
                if let Some(h) = src.prev_before(p) {
                    if better_max(&best, &h) {
                        best = Some(h);
                    }
                }
            });
            let (key, d) = best?;
            if is_tombstone(d) {
                pos = Some((key, d));
                continue;
            }
            if self.any_exact(&key, d & !1) {
                pos = Some((key, d & !1));
                continue;
            }
            return Some((key, d));
        }
    }

    fn any_exact(&self, key: &[u8], d: u64) -> bool {
        let mut found = false;
        self.each_source(|src| {
            if !found && src.has_exact(key, d) {
                found = true;
            }
        });
        found
    }

    fn each_source(&self, mut f: impl FnMut(Source<'_>)) {
        if let Some(mutbuf) = &self.mutbuf {
            f(Source::Buf(mutbuf));
        }
        for layer in &self.under {
            f(Source::Buf(layer));
        }
        f(Source::Tree(&self.fb));
    }
}

enum Source<'a> {
    Buf(&'a Ixbuf),
    Tree(&'a Fbtree),
}

impl Source<'_> {
    fn next_at(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        match self {
            Source::Buf(b) => b.next_at(pos),
            Source::Tree(t) => t.next_at(pos),
        }
    }

    fn prev_before(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        match self {
            Source::Buf(b) => b.prev_before(pos),
            Source::Tree(t) => t.prev_before(pos),
        }
    }

    fn has_exact(&self, key: &[u8], d: u64) -> bool {
        match self {
            Source::Buf(b) => b.has_exact(key, d),
            Source::Tree(t) => t.has_exact(key, d),
        }
    }
}

fn better_min(best: &Option<(Bytes, u64)>, h: &(Bytes, u64)) -> bool {
    match best {
        None => true,
        Some(b) => (h.0.as_ref(), h.1) < (b.0.as_ref(), b.1),
    }
}

fn better_max(best: &Option<(Bytes, u64)>, h: &(Bytes, u64)) -> bool {
    match best {
        None => true,
        Some(b) => (h.0.as_ref(), h.1) > (b.0.as_ref(), b.1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ixbuf::undouble;
    use crate::record::RecordBuilder;

    fn key(i: u32) -> Bytes {
        Bytes::from(format!("ov{i:05}"))
    }

    fn put_rec(store: &Stor, key: &[u8]) -> u64 {
        let mut b = RecordBuilder::new();
        b.add(Bytes::copy_from_slice(key));
        store.save_sized(b.build().as_bytes())
    }

    fn scan(ov: &Overlay) -> Vec<(Bytes, u64)> {
        let mut out = Vec::new();
        let mut pos: Option<(Bytes, u64)> = None;
        while let Some((k, d)) = ov.next_at(pos.as_ref().map(|(k, d)| (k.as_ref(), *d))) {
            out.push((k.clone(), undouble(d)));
            pos = Some((k, d + 1));
        }
        out
    }

    fn scan_back(ov: &Overlay) -> Vec<(Bytes, u64)> {
        let mut out = Vec::new();
        let mut pos: Option<(Bytes, u64)> = None;
        while let Some((k, d)) = ov.prev_before(pos.as_ref().map(|(k, d)| (k.as_ref(), *d))) {
            out.push((k.clone(), undouble(d)));
            pos = Some((k, d));
        }
        out.reverse();
        out
    }

    #[test]
    fn tombstones_mask_and_merge_drops_them() {
        let store = Arc::new(Stor::heap(1 << 22));
        let base = Overlay::new(store.clone(), Arc::new(IxSpec::new(vec![0])));

        // one committed transaction inserts a thousand entries
        let t1 = base.mutable();
        let mut offs = Vec::new();
        for i in 0..1000u32 {
            let k = key(i);
            let off = put_rec(&store, &k);
            t1.insert(k, off);
            offs.push(off);
        }
        let published = t1.update_with(&base);
        assert_eq!(published.layer_count(), 2);

        // a second transaction deletes the odd half
        let t2 = published.mutable();
        for i in (1..1000u32).step_by(2) {
            t2.delete(key(i), offs[i as usize]);
        }
        let published = t2.update_with(&published);
        assert_eq!(published.layer_count(), 3);

        let survivors: Vec<(Bytes, u64)> = (0..1000u32)
            .step_by(2)
            .map(|i| (key(i), offs[i as usize]))
            .collect();
        assert_eq!(scan(&published), survivors);
        assert_eq!(scan_back(&published), survivors);

        // merging all layers yields exactly the survivors, no tombstones
        let merged = published.merge(published.layer_count() - 1);
        let flat = merged.entries();
        assert_eq!(flat.len(), 500);
        assert!(flat.iter().all(|(_, off)| off & TOMBSTONE == 0));
        let folded = published.with_merged(merged, published.layer_count() - 1);
        assert_eq!(scan(&folded), survivors);

        // saving folds the base into the tree
        let saved = folded.with_saved(folded.save());
        assert_eq!(saved.base_len(), 0);
        assert_eq!(scan(&saved), survivors);
        for (k, off) in &survivors {
            assert_eq!(saved.lookup(k), Some(*off));
        }
        assert_eq!(saved.lookup(&key(1)), None);
    }

    #[test]
    fn lookup_sees_newest_layer_first() {
        let store = Arc::new(Stor::heap(1 << 16));
        let base = Overlay::new(store.clone(), Arc::new(IxSpec::new(vec![0])));
        let t1 = base.mutable();
        let k = Bytes::from_static(b"dup");
        let old = put_rec(&store, &k);
        t1.insert(k.clone(), old);
        let published = t1.update_with(&base);

        // update in a later transaction: tombstone old, insert new
        let t2 = published.mutable();
        let new = put_rec(&store, &k);
        t2.delete(k.clone(), old);
        t2.insert(k.clone(), new);
        assert_eq!(t2.lookup(&k), Some(new));
        let published = t2.update_with(&published);
        assert_eq!(published.lookup(&k), Some(new));

        // delete entirely
        let t3 = published.mutable();
        t3.delete(k.clone(), new);
        assert_eq!(t3.lookup(&k), None);
    }
}
