//! Ordered in-memory index buffer.
//!
//! An `Ixbuf` holds (key, offset) entries; the high offset bit marks a
//! tombstone masking an identical (key, offset) insert in a lower layer. A
//! buffer can hold several entries for one key — an update that leaves the
//! key unchanged records the old offset's tombstone next to the new
//! offset's insert. Buffers are written by exactly one transaction while
//! mutable and become immutable once linked into an overlay's `under` list.
//!
//! Entries are stored under doubled offsets — `(off << 1) | !tombstone` —
//! so a tombstone sorts immediately before the insert it masks and the
//! k-way merge can annihilate matched pairs by looking only at source
//! heads.

use std::ops::Bound;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

/// High offset bit marking a deletion.
pub const TOMBSTONE: u64 = 1 << 63;

/// Double an offset, inverting the tombstone bit into the low position.
pub fn double(off: u64) -> u64 {
    (off << 1) | ((off >> 63) ^ 1)
}

/// Recover the plain record offset from a doubled one.
pub fn undouble(d: u64) -> u64 {
    d >> 1
}

/// Recover the raw offset (tombstone bit in the high position).
pub fn undouble_raw(d: u64) -> u64 {
    if d & 1 == 1 {
        d >> 1
    } else {
        (d >> 1) | TOMBSTONE
    }
}

pub fn is_tombstone(d: u64) -> bool {
    d & 1 == 0
}

/// A buffer layer's answer for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// No entry for the key in this layer.
    Absent,
    /// Only tombstones; the key is deleted as of this layer.
    Masked,
    /// A live insert at this offset.
    Present(u64),
}

#[derive(Debug, Default)]
pub struct Ixbuf {
    map: SkipMap<(Bytes, u64), ()>,
}

impl Ixbuf {
    pub fn new() -> Ixbuf {
        Ixbuf::default()
    }

    pub fn insert(&self, key: Bytes, off: u64) {
        self.map.insert((key, double(off)), ());
    }

    /// Take back this buffer's own insert of `(key, off)`; returns whether
    /// there was one. A miss means the caller records a tombstone instead.
    pub fn remove_insert(&self, key: &[u8], off: u64) -> bool {
        let probe = (Bytes::copy_from_slice(key), double(off));
        self.map.remove(&probe).is_some()
    }

    /// What this layer says about `key`.
    pub fn lookup(&self, key: &[u8]) -> Lookup {
        let lo = (Bytes::copy_from_slice(key), 0u64);
        let hi = (Bytes::copy_from_slice(key), u64::MAX);
        let mut result = Lookup::Absent;
        for e in self.map.range(lo..=hi) {
            let d = e.key().1;
            if !is_tombstone(d) {
                return Lookup::Present(undouble(d));
            }
            result = Lookup::Masked;
        }
        result
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in order as (key, raw offset with tombstone bit).
    pub fn entries(&self) -> Vec<(Bytes, u64)> {
        self.map
            .iter()
            .map(|e| (e.key().0.clone(), undouble_raw(e.key().1)))
            .collect()
    }

    // merged-cursor primitives; offsets are doubled --------------------

    /// First entry at or after position `(key, d)`; `None` position means
    /// the start.
    pub(crate) fn next_at(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        let entry = match pos {
            None => self.map.front(),
            Some((key, d)) => {
                let probe = (Bytes::copy_from_slice(key), d);
                self.map.lower_bound(Bound::Included(&probe))
            }
        };
        entry.map(|e| (e.key().0.clone(), e.key().1))
    }

    /// Last entry strictly before position `(key, d)`; `None` position
    /// means the end.
    pub(crate) fn prev_before(&self, pos: Option<(&[u8], u64)>) -> Option<(Bytes, u64)> {
        let entry = match pos {
            None => self.map.back(),
            Some((key, d)) => {
                let probe = (Bytes::copy_from_slice(key), d);
                self.map.upper_bound(Bound::Excluded(&probe))
            }
        };
        entry.map(|e| (e.key().0.clone(), e.key().1))
    }

    pub(crate) fn has_exact(&self, key: &[u8], d: u64) -> bool {
        let probe = (Bytes::copy_from_slice(key), d);
        self.map.get(&probe).is_some()
    }
}

/// Merge layers (oldest first) into a new base buffer.
///
/// Matched insert/tombstone pairs annihilate. Tombstones whose insert lives
/// below the merged layers (in the on-disk tree) are retained so the next
/// tree save applies them.
pub fn merge(bufs: &[std::sync::Arc<Ixbuf>]) -> Ixbuf {
    struct Src<'a> {
        iter: crossbeam_skiplist::map::Iter<'a, (Bytes, u64), ()>,
        head: Option<(Bytes, u64)>,
    }
    impl Src<'_> {
        fn advance(&mut self) {
            self.head = self.iter.next().map(|e| (e.key().0.clone(), e.key().1));
        }
    }

    let mut srcs: Vec<Src> = bufs
        .iter()
        .map(|b| {
            let mut s = Src {
                iter: b.map.iter(),
                head: None,
            };
            s.advance();
            s
        })
        .collect();

    let out = Ixbuf::new();
    loop {
        let mut min: Option<usize> = None;
        for (i, s) in srcs.iter().enumerate() {
            if let Some(h) = &s.head {
                let beats = match min {
                    None => true,
                    Some(m) => {
                        let mh = srcs[m].head.as_ref().unwrap();
                        (h.0.as_ref(), h.1) < (mh.0.as_ref(), mh.1)
                    }
                };
                if beats {
                    min = Some(i);
                }
            }
        }
        let m = match min {
            None => break,
            Some(m) => m,
        };
        let (key, d) = srcs[m].head.clone().unwrap();
        if is_tombstone(d) {
            // the matching insert, if among these layers, is at some head
            let mut matched = false;
            for (i, s) in srcs.iter_mut().enumerate() {
                if i == m {
                    continue;
                }
                if let Some((k2, d2)) = &s.head {
                    if k2.as_ref() == key.as_ref() && *d2 == (d | 1) {
                        s.advance();
                        matched = true;
                        break;
                    }
                }
            }
            if !matched {
                out.insert(key, undouble(d) | TOMBSTONE);
            }
        } else {
            out.insert(key, undouble(d));
        }
        srcs[m].advance();
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn buf(entries: &[(&[u8], u64)]) -> Arc<Ixbuf> {
        let b = Ixbuf::new();
        for (k, v) in entries {
            b.insert(Bytes::copy_from_slice(k), *v);
        }
        Arc::new(b)
    }

    fn flat(b: &Ixbuf) -> Vec<(Vec<u8>, u64)> {
        b.entries()
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v))
            .collect()
    }

    #[test]
    fn insert_remove_lookup() {
        let b = Ixbuf::new();
        b.insert(Bytes::from_static(b"k"), 7);
        assert_eq!(b.lookup(b"k"), Lookup::Present(7));
        assert!(b.remove_insert(b"k", 7));
        assert!(!b.remove_insert(b"k", 7));
        assert_eq!(b.lookup(b"k"), Lookup::Absent);
        b.insert(Bytes::from_static(b"k"), 7 | TOMBSTONE);
        assert_eq!(b.lookup(b"k"), Lookup::Masked);
    }

    #[test]
    fn same_key_update_chain_in_one_buffer() {
        // update with an unchanged key: tombstone old offset, insert new
        let b = Ixbuf::new();
        b.insert(Bytes::from_static(b"k"), 10 | TOMBSTONE);
        b.insert(Bytes::from_static(b"k"), 20);
        assert_eq!(b.lookup(b"k"), Lookup::Present(20));
        assert_eq!(b.len(), 2);
        assert_eq!(
            flat(&b),
            vec![(b"k".to_vec(), 10 | TOMBSTONE), (b"k".to_vec(), 20)]
        );
    }

    #[test]
    fn doubling_sorts_tombstone_first() {
        let off = 1234u64;
        assert!(double(off | TOMBSTONE) < double(off));
        assert_eq!(double(off | TOMBSTONE) | 1, double(off));
        assert_eq!(undouble(double(off)), off);
        assert_eq!(undouble(double(off | TOMBSTONE)), off);
        assert_eq!(undouble_raw(double(off | TOMBSTONE)), off | TOMBSTONE);
    }

    #[test]
    fn merge_annihilates_matched_pairs() {
        let lower = buf(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        let upper = buf(&[(b"b", 2 | TOMBSTONE), (b"d", 4)]);
        let merged = merge(&[lower, upper]);
        assert_eq!(
            flat(&merged),
            vec![(b"a".to_vec(), 1), (b"c".to_vec(), 3), (b"d".to_vec(), 4)]
        );
    }

    #[test]
    fn merge_keeps_unmatched_tombstones() {
        let upper = buf(&[(b"x", 9 | TOMBSTONE)]);
        let merged = merge(&[upper]);
        assert_eq!(flat(&merged), vec![(b"x".to_vec(), 9 | TOMBSTONE)]);
    }

    #[test]
    fn merge_update_chain_across_layers() {
        let l0 = buf(&[(b"k", 10)]);
        let l1 = buf(&[(b"k", 10 | TOMBSTONE), (b"k", 20)]);
        let merged = merge(&[l0, l1]);
        assert_eq!(flat(&merged), vec![(b"k".to_vec(), 20)]);
    }

    #[test]
    fn cursor_primitives() {
        let b = buf(&[(b"a", 1), (b"c", 3 | TOMBSTONE), (b"e", 5)]);
        assert_eq!(b.next_at(None).unwrap().0.as_ref(), b"a");
        let (k, d) = b.next_at(Some((b"a", double(1) + 1))).unwrap();
        assert_eq!(k.as_ref(), b"c");
        assert!(is_tombstone(d));
        assert_eq!(b.next_at(Some((b"e", double(5) + 1))), None);
        assert_eq!(b.prev_before(None).unwrap().0.as_ref(), b"e");
        assert_eq!(b.prev_before(Some((b"c", 0))).unwrap().0.as_ref(), b"a");
        assert!(b.has_exact(b"a", double(1)));
        assert!(!b.has_exact(b"a", double(1) + 2));
    }
}
