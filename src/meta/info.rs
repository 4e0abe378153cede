//! Per-table bookkeeping: row count, byte totals, and the live overlay for
//! each index. `Info` is the mutable half of the catalog — every commit
//! publishes new `Info`s; schemas change only through schema operations.

use serde::{Deserialize, Serialize};

use crate::hamt::HamtItem;
use crate::index::overlay::Overlay;

#[derive(Clone)]
pub struct Info {
    pub table: String,
    pub nrows: u64,
    pub total_size: u64,
    pub indexes: Vec<Overlay>,
}

impl HamtItem for Info {
    type Key = str;
    fn key(&self) -> &str {
        &self.table
    }
}

impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("table", &self.table)
            .field("nrows", &self.nrows)
            .field("total_size", &self.total_size)
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

/// The persisted form of one index overlay: only the tree roots survive a
/// restart; buffer layers are rebuilt empty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeRoot {
    pub root: u64,
    pub tree_levels: u32,
    pub redirs_off: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPersist {
    pub table: String,
    pub nrows: u64,
    pub total_size: u64,
    pub roots: Vec<TreeRoot>,
}

impl InfoPersist {
    pub fn of(info: &Info) -> InfoPersist {
        InfoPersist {
            table: info.table.clone(),
            nrows: info.nrows,
            total_size: info.total_size,
            roots: info
                .indexes
                .iter()
                .map(|ov| TreeRoot {
                    root: ov.tree().root(),
                    tree_levels: ov.tree().tree_levels() as u32,
                    redirs_off: ov.tree().redirs_off(),
                })
                .collect(),
        }
    }
}
