//! Tree node encoding.
//!
//! A node is a sequence of prefix-compressed entries:
//!
//! ```text
//! [offset:5][npre:2 LE][dlen:2 LE][diff bytes]
//! ```
//!
//! An entry's known prefix is the first `npre` bytes of the previous
//! entry's known prefix followed by `diff`. The first entry of every node
//! has an empty known prefix — the parent's separator bounds it. Leaf
//! entries point at record data; interior entries point at child nodes.
//!
//! Known prefixes are only as long as needed to disambiguate: between two
//! leaf keys the stored prefix extends one byte past their common prefix,
//! while interior separators keep (almost) the whole key so descents rarely
//! need to consult record data.

use bytes::Bytes;

use crate::stor::{self, Stor};

/// Soft limit on serialized node size; nodes are split above it.
pub const MAX_NODE_SIZE: usize = 1536;

const ENTRY_HEADER: usize = stor::SMALL_OFFSET_LEN + 2 + 2;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FEntry {
    pub offset: u64,
    pub known: Bytes,
}

/// A decoded node. Immutable nodes are decoded on access; mutable nodes
/// ("mnodes") live in the redirection table until the next save serializes
/// them.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FNode {
    pub entries: Vec<FEntry>,
}

impl FNode {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized size in bytes (before the store's framing).
    pub fn stor_size(&self) -> usize {
        let mut size = 0;
        let mut prev: &[u8] = b"";
        for e in &self.entries {
            let npre = common_prefix(prev, &e.known);
            size += ENTRY_HEADER + (e.known.len() - npre);
            prev = &e.known;
        }
        size
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.stor_size());
        let mut prev: &[u8] = b"";
        for e in &self.entries {
            let npre = common_prefix(prev, &e.known);
            let diff = &e.known[npre..];
            debug_assert!(npre <= u16::MAX as usize && diff.len() <= u16::MAX as usize);
            let mut off5 = [0u8; stor::SMALL_OFFSET_LEN];
            stor::put5(&mut off5, e.offset);
            buf.extend_from_slice(&off5);
            buf.extend_from_slice(&(npre as u16).to_le_bytes());
            buf.extend_from_slice(&(diff.len() as u16).to_le_bytes());
            buf.extend_from_slice(diff);
            prev = &e.known;
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> FNode {
        let mut entries = Vec::new();
        let mut prev: Vec<u8> = Vec::new();
        let mut at = 0;
        while at < buf.len() {
            let offset = stor::get5(&buf[at..]);
            let npre =
                u16::from_le_bytes(buf[at + 5..at + 7].try_into().unwrap()) as usize;
            let dlen =
                u16::from_le_bytes(buf[at + 7..at + 9].try_into().unwrap()) as usize;
            at += ENTRY_HEADER;
            let mut known = Vec::with_capacity(npre + dlen);
            known.extend_from_slice(&prev[..npre]);
            known.extend_from_slice(&buf[at..at + dlen]);
            at += dlen;
            prev = known.clone();
            entries.push(FEntry {
                offset,
                known: Bytes::from(known),
            });
        }
        FNode { entries }
    }

    /// Write this node to the store; returns its offset.
    pub fn put(&self, store: &Stor) -> u64 {
        store.save_sized(&self.encode())
    }

    /// Index of the last entry whose known prefix is `<=` key: the child to
    /// descend into, or the leaf slot at or before the key.
    pub fn search(&self, key: &[u8]) -> usize {
        debug_assert!(!self.entries.is_empty());
        let mut i = 0;
        for (j, e) in self.entries.iter().enumerate().skip(1) {
            if e.known.as_ref() > key {
                break;
            }
            i = j;
        }
        i
    }
}

/// Length of the common prefix of two byte strings.
pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

/// The known prefix for `key` following `prev`: their common prefix
/// extended by up to `embed_len` bytes of `key`. Guaranteed greater than
/// `prev` and a prefix of (or equal to) `key`, given `prev < key`.
pub(crate) fn embed(prev: &[u8], key: &[u8], embed_len: usize) -> Bytes {
    debug_assert!(prev < key, "embed requires ordered keys");
    let npre = common_prefix(prev, key);
    let end = key.len().min(npre + embed_len);
    Bytes::copy_from_slice(&key[..end])
}
