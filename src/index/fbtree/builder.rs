//! Sorted bulk loading.
//!
//! The builder constructs a tree bottom-up from keys supplied in order,
//! with no splitting or searching: each level's current node fills to about
//! two thirds of the size limit and is then flushed, pushing its first key
//! up a level. The right-hand edge of the tree is allowed to run light.

use std::sync::Arc;

use bytes::Bytes;

use crate::ixkey::IxSpec;
use crate::stor::Stor;

use super::node::{embed, FEntry, FNode, MAX_NODE_SIZE};
use super::redirs::Redirs;
use super::{record_leaf_key, Fbtree, TreeError};

#[derive(Default)]
struct Level {
    first: Bytes,
    prev: Bytes,
    node: FNode,
}

pub struct TreeBuilder {
    store: Arc<Stor>,
    levels: Vec<Level>,
    prev: Option<Bytes>,
}

impl TreeBuilder {
    pub fn new(store: Arc<Stor>) -> TreeBuilder {
        TreeBuilder {
            store,
            levels: vec![Level::default()],
            prev: None,
        }
    }

    /// Add the next key in order. Duplicates are an error (index keys are
    /// unique); out-of-order keys are a caller bug.
    pub fn add(&mut self, key: Bytes, off: u64) -> Result<(), TreeError> {
        if let Some(prev) = &self.prev {
            if key.as_ref() == prev.as_ref() {
                return Err(TreeError::Corrupt("duplicate key in bulk load"));
            }
            assert!(
                key.as_ref() > prev.as_ref(),
                "bulk load keys must be added in order"
            );
        }
        self.insert(0, key.clone(), off);
        self.prev = Some(key);
        Ok(())
    }

    fn insert(&mut self, li: usize, key: Bytes, off: u64) {
        if li >= self.levels.len() {
            self.levels.push(Level::default());
        }
        if self.levels[li].node.stor_size() > MAX_NODE_SIZE * 2 / 3 {
            // flush the full node and push its first key up
            let lev = std::mem::take(&mut self.levels[li]);
            let node_off = lev.node.put(&self.store);
            self.insert(li + 1, lev.first, node_off);
        }
        let embed_len = if li > 0 { 255 } else { 1 };
        let lev = &mut self.levels[li];
        if lev.node.is_empty() {
            lev.first = key.clone();
        }
        push_entry(lev, key, off, embed_len);
    }

    /// Flush every level and return the finished tree.
    pub fn finish(mut self, ixspec: Arc<IxSpec>) -> Fbtree {
        let mut key = Bytes::new();
        let mut off = 0u64;
        for li in 0..self.levels.len() {
            if li > 0 {
                // the final flush from below; slight oversize is fine here
                push_entry(&mut self.levels[li], key, off, 255);
            }
            key = self.levels[li].first.clone();
            off = self.levels[li].node.put(&self.store);
        }
        Fbtree {
            root: off,
            tree_levels: self.levels.len() - 1,
            store: self.store,
            ixspec,
            redirs: Redirs::new(),
            redirs_off: 0,
            mutable: false,
            get_leaf_key: record_leaf_key,
        }
    }
}

fn push_entry(lev: &mut Level, key: Bytes, off: u64, embed_len: usize) {
    let known = if lev.node.is_empty() {
        Bytes::new()
    } else {
        embed(&lev.prev, &key, embed_len)
    };
    lev.node.entries.push(FEntry { offset: off, known });
    lev.prev = key;
}

impl std::fmt::Debug for TreeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("levels", &self.levels.len())
            .finish()
    }
}
