//! Coalescing ordered set of key ranges.
//!
//! Tracks the `[from, to)` ranges an update transaction has read, so the
//! checker can test a written key against them with one predecessor probe.

use std::collections::BTreeMap;

use bytes::Bytes;

#[derive(Debug, Default, Clone)]
pub struct Ranges {
    /// from -> to, non-overlapping and non-touching after coalescing.
    map: BTreeMap<Bytes, Bytes>,
}

impl Ranges {
    pub fn new() -> Ranges {
        Ranges::default()
    }

    pub fn insert(&mut self, from: Bytes, to: Bytes) {
        debug_assert!(from <= to);
        let mut from = from;
        let mut to = to;
        // absorb a predecessor that reaches this range
        if let Some((pf, pt)) = self
            .map
            .range(..=from.clone())
            .next_back()
            .map(|(f, t)| (f.clone(), t.clone()))
        {
            if pt >= from {
                self.map.remove(&pf);
                from = pf;
                if pt > to {
                    to = pt;
                }
            }
        }
        // absorb successors this range reaches
        while let Some((nf, nt)) = self
            .map
            .range(from.clone()..)
            .next()
            .map(|(f, t)| (f.clone(), t.clone()))
        {
            if nf > to {
                break;
            }
            self.map.remove(&nf);
            if nt > to {
                to = nt;
            }
        }
        self.map.insert(from, to);
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match self.map.range(..=Bytes::copy_from_slice(key)).next_back() {
            None => false,
            Some((_, to)) => key < to.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn contains_respects_half_open_bounds() {
        let mut r = Ranges::new();
        r.insert(b("b"), b("d"));
        assert!(!r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(r.contains(b"c"));
        assert!(!r.contains(b"d"));
    }

    #[test]
    fn overlapping_ranges_coalesce() {
        let mut r = Ranges::new();
        r.insert(b("a"), b("c"));
        r.insert(b("b"), b("e"));
        r.insert(b("g"), b("h"));
        assert_eq!(r.len(), 2);
        assert!(r.contains(b"d"));
        assert!(!r.contains(b"f"));
        r.insert(b("c"), b("g"));
        assert_eq!(r.len(), 1);
        assert!(r.contains(b"f"));
    }

    #[test]
    fn point_reads() {
        let mut r = Ranges::new();
        let mut to = b"k1".to_vec();
        to.push(0);
        r.insert(b("k1"), Bytes::from(to));
        assert!(r.contains(b"k1"));
        assert!(!r.contains(b"k10"));
        assert!(!r.contains(b"k2"));
    }
}
