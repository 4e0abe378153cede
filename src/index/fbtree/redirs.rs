//! Redirection table.
//!
//! Updating an immutable tree would rewrite every node on the root-to-leaf
//! path. Instead, modified nodes are parked here: an offset maps either to a
//! mutable in-memory node ("mnode") awaiting serialization, or to the offset
//! its rewritten form was saved at. The `paths` set tracks interior nodes
//! with modified descendants so saves traverse only changed subtrees.
//!
//! New nodes created by splits get fake offsets above [`FAKE_BASE`]; fakes
//! never persist — every save resolves them to real store offsets.

use std::sync::Arc;

use crate::hamt::{Hamt, HamtItem};
use crate::stor::{self, Stor};

use super::node::FNode;
use super::TreeError;

/// In-memory-only offsets for unsaved nodes.
pub(crate) const FAKE_BASE: u64 = 1 << 62;

pub(crate) fn is_fake(off: u64) -> bool {
    off >= FAKE_BASE
}

#[derive(Debug, Clone)]
pub(crate) struct Redir {
    pub offset: u64,
    /// Where the rewritten node was saved; 0 while an mnode is present.
    pub new_offset: u64,
    pub mnode: Option<Arc<FNode>>,
}

impl HamtItem for Redir {
    type Key = u64;
    fn key(&self) -> &u64 {
        &self.offset
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Redirs {
    tbl: Hamt<Redir>,
    paths: Hamt<u64>,
    next_fake: u64,
}

impl Redirs {
    pub fn new() -> Redirs {
        Redirs {
            tbl: Hamt::new(),
            paths: Hamt::new(),
            next_fake: FAKE_BASE,
        }
    }

    /// Read a redirects block written by [`Redirs::save`].
    pub fn load(store: &Stor, off: u64) -> Result<Redirs, TreeError> {
        if off == 0 {
            return Ok(Redirs::new());
        }
        let buf = store
            .data_sized_ck(off)
            .map_err(|_| TreeError::Corrupt("redirects block checksum"))?;
        let mut tbl = Hamt::new().mutable();
        let mut paths = Hamt::new().mutable();
        let mut at = 0usize;
        let n = read2(buf, &mut at)?;
        for _ in 0..n {
            let offset = read5(buf, &mut at)?;
            let new_offset = read5(buf, &mut at)?;
            tbl.put(Redir {
                offset,
                new_offset,
                mnode: None,
            });
        }
        let p = read2(buf, &mut at)?;
        for _ in 0..p {
            paths.put(read5(buf, &mut at)?);
        }
        Ok(Redirs {
            tbl: tbl.freeze(),
            paths: paths.freeze(),
            next_fake: FAKE_BASE,
        })
    }

    /// Write the table as `[n:2][(old:5 new:5)*n][p:2][(path:5)*p]` inside a
    /// checksummed sized block; returns the block offset.
    pub fn save(&self, store: &Stor) -> u64 {
        let n = self.count();
        let p = self.paths.count();
        let mut buf = Vec::with_capacity(2 + n * 2 * stor::SMALL_OFFSET_LEN + 2 + p * stor::SMALL_OFFSET_LEN);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        self.tbl.for_each(|r| {
            assert!(r.mnode.is_none(), "unsaved mnode at redirects save");
            assert!(!is_fake(r.offset) && !is_fake(r.new_offset));
            assert!(r.offset != 0 && r.new_offset != 0);
            let mut five = [0u8; stor::SMALL_OFFSET_LEN];
            stor::put5(&mut five, r.offset);
            buf.extend_from_slice(&five);
            stor::put5(&mut five, r.new_offset);
            buf.extend_from_slice(&five);
        });
        buf.extend_from_slice(&(p as u16).to_le_bytes());
        self.paths.for_each(|&off| {
            assert!(!is_fake(off));
            let mut five = [0u8; stor::SMALL_OFFSET_LEN];
            stor::put5(&mut five, off);
            buf.extend_from_slice(&five);
        });
        store.save_sized(&buf)
    }

    pub fn mutable(&self) -> Redirs {
        Redirs {
            tbl: self.tbl.mutable(),
            paths: self.paths.mutable(),
            next_fake: self.next_fake,
        }
    }

    pub fn freeze(self) -> Redirs {
        Redirs {
            tbl: self.tbl.freeze(),
            paths: self.paths.freeze(),
            next_fake: self.next_fake,
        }
    }

    /// Register a new in-memory node under a fresh fake offset.
    pub fn add_mnode(&mut self, node: FNode) -> u64 {
        let off = self.next_fake;
        self.next_fake += 1;
        self.tbl.put(Redir {
            offset: off,
            new_offset: 0,
            mnode: Some(Arc::new(node)),
        });
        off
    }

    pub fn get(&self, off: u64) -> Option<&Redir> {
        self.tbl.get(&off)
    }

    pub fn put(&mut self, r: Redir) {
        self.tbl.put(r);
    }

    pub fn delete(&mut self, off: u64) -> bool {
        self.tbl.delete(&off)
    }

    pub fn count(&self) -> usize {
        self.tbl.count()
    }

    pub fn path_add(&mut self, off: u64) {
        self.paths.put(off);
    }

    pub fn path_delete(&mut self, off: u64) {
        self.paths.delete(&off);
    }

    pub fn path_has(&self, off: u64) -> bool {
        self.paths.get(&off).is_some()
    }
}

fn read2(buf: &[u8], at: &mut usize) -> Result<usize, TreeError> {
    if *at + 2 > buf.len() {
        return Err(TreeError::Corrupt("short redirects block"));
    }
    let v = u16::from_le_bytes(buf[*at..*at + 2].try_into().unwrap()) as usize;
    *at += 2;
    Ok(v)
}

fn read5(buf: &[u8], at: &mut usize) -> Result<u64, TreeError> {
    if *at + stor::SMALL_OFFSET_LEN > buf.len() {
        return Err(TreeError::Corrupt("short redirects block"));
    }
    let v = stor::get5(&buf[*at..]);
    *at += stor::SMALL_OFFSET_LEN;
    Ok(v)
}
