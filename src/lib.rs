//! `amberdb` is an embedded, single-file, multi-version, multi-index record
//! store.
//!
//! This crate is intentionally opinionated about correctness first:
//! - The store is append-only; records, tree nodes and metadata blocks are
//!   immutable once written.
//! - Reads run against an immutable `DbState` snapshot and never block.
//! - Update transactions are optimistic: a single-threaded checker tracks
//!   read ranges and write keys and aborts one of any conflicting pair.
//! - Deletes are tombstones in layered index buffers; a background worker
//!   folds layers into each index's base buffer and periodically flushes the
//!   base into the on-disk tree, publishing a checksummed state block.
//!
//! Durability follows the persisted state block: record bytes are in the
//! file as soon as a transaction commits, but index state between persists
//! is rebuilt from the last valid state block after a crash.

pub mod check;
pub mod cksum;
pub mod db;
pub mod hamt;
pub mod index;
pub mod ixkey;
pub mod meta;
pub mod record;
pub mod stor;

pub use db::{Database, DbError, DbOptions, ReadTran, UpdateTran};
pub use index::iter::OverIter;
pub use ixkey::IxSpec;
pub use meta::schema::{Fkey, Index, IndexMode, Schema};
pub use record::{Record, RecordBuilder};
