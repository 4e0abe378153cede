//! Transactions.
//!
//! Read transactions hold an immutable state snapshot and never touch the
//! checker: they cost nothing and cannot conflict. Update transactions
//! route every action through the checker and collect their writes in
//! per-index mutable buffers; commit re-bases those buffers onto the
//! latest published state (the checker guarantees independence) and hands
//! the tables to the background worker for merging.
//!
//! Action failures (duplicate key, foreign key block, unknown table) leave
//! the transaction usable; checker-reported conflicts abort it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::check::ConflictSlot;
use crate::index::iter::{OverIter, Range};
use crate::index::overlay::Overlay;
use crate::ixkey;
use crate::meta::Schema;
use crate::record::Record;

use super::state::DbState;
use super::{Database, DbError};

/// A snapshot reader.
pub struct ReadTran {
    pub(crate) state: Arc<DbState>,
}

impl ReadTran {
    pub fn get_schema(&self, table: &str) -> Option<Arc<Schema>> {
        self.state.meta.get_schema(table).cloned()
    }

    pub fn get_info(&self, table: &str) -> Option<(u64, u64)> {
        self.state
            .meta
            .get_info(table)
            .map(|i| (i.nrows, i.total_size))
    }

    pub fn get_view(&self, name: &str) -> Option<String> {
        self.state.meta.get_view(name)
    }

    /// Names of every table, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut v = Vec::new();
        self.state.meta.for_each_schema(|s| v.push(s.table.clone()));
        v.sort();
        v
    }

    /// Exact-match lookup in one index.
    pub fn get(
        &self,
        table: &str,
        index: usize,
        key: &[u8],
    ) -> Result<Option<(Record, u64)>, DbError> {
        let ov = snapshot_overlay(&self.state, table, index)?;
        Ok(ov
            .lookup(key)
            .map(|off| (Record::read(&self.state.store, off), off)))
    }

    /// Iterate one index over its whole range.
    pub fn iter(&self, table: &str, index: usize) -> Result<OverIter, DbError> {
        let ov = snapshot_overlay(&self.state, table, index)?;
        Ok(OverIter::new(ov))
    }

    /// Iterate one index over `[from, to)`.
    pub fn iter_range(
        &self,
        table: &str,
        index: usize,
        from: &[u8],
        to: &[u8],
    ) -> Result<OverIter, DbError> {
        let ov = snapshot_overlay(&self.state, table, index)?;
        let mut it = OverIter::new(ov);
        it.set_range(Range {
            org: Bytes::copy_from_slice(from),
            end: Bytes::copy_from_slice(to),
        });
        Ok(it)
    }

    pub fn read_record(&self, off: u64) -> Record {
        Record::read(&self.state.store, off)
    }
}

fn snapshot_overlay(state: &DbState, table: &str, index: usize) -> Result<Overlay, DbError> {
    let info = state
        .meta
        .get_info(table)
        .ok_or_else(|| DbError::Usage(format!("nonexistent table: {table}")))?;
    info.indexes
        .get(index)
        .cloned()
        .ok_or_else(|| DbError::Usage(format!("{table}: no index {index}")))
}

pub(crate) struct TranTable {
    pub nrows_delta: i64,
    pub size_delta: i64,
    pub overlays: Vec<Overlay>,
}

/// An optimistic update transaction.
pub struct UpdateTran {
    pub(crate) db: Database,
    pub(crate) state: Arc<DbState>,
    pub(crate) tn: u64,
    pub(crate) conflict: ConflictSlot,
    pub(crate) tables: HashMap<String, TranTable>,
    pub(crate) ended: bool,
}

impl UpdateTran {
    pub fn num(&self) -> u64 {
        self.tn
    }

    pub fn get_schema(&self, table: &str) -> Option<Arc<Schema>> {
        self.state.meta.get_schema(table).cloned()
    }

    pub fn get_info(&self, table: &str) -> Option<(u64, u64)> {
        let base = self.state.meta.get_info(table)?;
        let (mut nrows, mut size) = (base.nrows as i64, base.total_size as i64);
        if let Some(tt) = self.tables.get(table) {
            nrows += tt.nrows_delta;
            size += tt.size_delta;
        }
        Some((nrows as u64, size as u64))
    }

    pub fn read_record(&self, off: u64) -> Record {
        Record::read(&self.state.store, off)
    }

    /// Append a new record; returns its offset.
    pub fn output(&mut self, table: &str, rec: Record) -> Result<u64, DbError> {
        self.ensure_active()?;
        let schema = self.schema_of(table)?;
        let keys: Vec<Bytes> = schema
            .indexes
            .iter()
            .map(|ix| ix.ixspec.key(rec.as_bytes()))
            .collect();
        for (i, ix) in schema.indexes.iter().enumerate() {
            if ix.is_unique() && self.lookup_in(table, i, &keys[i])?.is_some() {
                return Err(DbError::DuplicateKey {
                    table: table.to_string(),
                    index: ix.columns.join(","),
                });
            }
        }
        self.fkey_targets_exist(&schema, &rec)?;
        if !self.db.inner.ck.lock().write(self.tn, table, &keys) {
            return Err(self.conflict_err());
        }
        let off = self.db.store_record(&rec);
        let tt = self.table_mut(table)?;
        for (i, key) in keys.into_iter().enumerate() {
            tt.overlays[i].insert(key, off);
        }
        tt.nrows_delta += 1;
        tt.size_delta += rec.len() as i64;
        Ok(off)
    }

    /// Delete the record at `off`.
    pub fn delete(&mut self, table: &str, off: u64) -> Result<(), DbError> {
        self.ensure_active()?;
        let schema = self.schema_of(table)?;
        let rec = Record::read(&self.state.store, off);
        let keys: Vec<Bytes> = schema
            .indexes
            .iter()
            .map(|ix| ix.ixspec.key(rec.as_bytes()))
            .collect();
        self.fkey_no_referrers(table, &schema, &rec, None)?;
        if !self.db.inner.ck.lock().write(self.tn, table, &keys) {
            return Err(self.conflict_err());
        }
        let tt = self.table_mut(table)?;
        for (i, key) in keys.into_iter().enumerate() {
            tt.overlays[i].delete(key, off);
        }
        tt.nrows_delta -= 1;
        tt.size_delta -= rec.len() as i64;
        Ok(())
    }

    /// Replace the record at `old_off`; returns the new record's offset.
    pub fn update(&mut self, table: &str, old_off: u64, rec: Record) -> Result<u64, DbError> {
        self.ensure_active()?;
        let schema = self.schema_of(table)?;
        let old = Record::read(&self.state.store, old_off);
        let old_keys: Vec<Bytes> = schema
            .indexes
            .iter()
            .map(|ix| ix.ixspec.key(old.as_bytes()))
            .collect();
        let new_keys: Vec<Bytes> = schema
            .indexes
            .iter()
            .map(|ix| ix.ixspec.key(rec.as_bytes()))
            .collect();
        for (i, ix) in schema.indexes.iter().enumerate() {
            if ix.is_unique()
                && new_keys[i] != old_keys[i]
                && self.lookup_in(table, i, &new_keys[i])?.is_some()
            {
                return Err(DbError::DuplicateKey {
                    table: table.to_string(),
                    index: ix.columns.join(","),
                });
            }
        }
        self.fkey_targets_exist(&schema, &rec)?;
        self.fkey_no_referrers(table, &schema, &old, Some(&rec))?;
        // both old and new keys register, even where they are equal
        {
            let mut ck = self.db.inner.ck.lock();
            if !ck.write(self.tn, table, &old_keys) || !ck.write(self.tn, table, &new_keys) {
                drop(ck);
                return Err(self.conflict_err());
            }
        }
        let new_off = self.db.store_record(&rec);
        let tt = self.table_mut(table)?;
        for i in 0..old_keys.len() {
            tt.overlays[i].delete(old_keys[i].clone(), old_off);
            tt.overlays[i].insert(new_keys[i].clone(), new_off);
        }
        tt.size_delta += rec.len() as i64 - old.len() as i64;
        Ok(new_off)
    }

    /// Exact-match lookup; registers a point read with the checker.
    pub fn get(
        &mut self,
        table: &str,
        index: usize,
        key: &[u8],
    ) -> Result<Option<(Record, u64)>, DbError> {
        self.ensure_active()?;
        self.register_read(table, index, key, &point_read_end(key))?;
        let store = self.state.store.clone();
        Ok(self
            .lookup_in(table, index, key)?
            .map(|off| (Record::read(&store, off), off)))
    }

    /// Iterate one index; the whole range registers as a read.
    pub fn iter(&mut self, table: &str, index: usize) -> Result<OverIter, DbError> {
        self.iter_range(table, index, ixkey::MIN, ixkey::MAX)
    }

    pub fn iter_range(
        &mut self,
        table: &str,
        index: usize,
        from: &[u8],
        to: &[u8],
    ) -> Result<OverIter, DbError> {
        self.ensure_active()?;
        self.register_read(table, index, from, to)?;
        self.table_mut(table)?;
        let ov = self.view_of(table, index)?;
        let mut it = OverIter::new(ov);
        it.set_range(Range {
            org: Bytes::copy_from_slice(from),
            end: Bytes::copy_from_slice(to),
        });
        Ok(it)
    }

    /// Commit through the checker; the merge and persist happen in the
    /// background.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.ensure_active()?;
        self.ended = true;
        self.db.clone().commit_tran(&mut self)
    }

    /// Abort with a reason the checker will report.
    pub fn abort(mut self, reason: &str) {
        self.do_abort(reason);
    }

    fn do_abort(&mut self, reason: &str) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.db.inner.ck.lock().abort(self.tn, reason);
    }

    // internals ---------------------------------------------------------

    fn ensure_active(&self) -> Result<(), DbError> {
        if self.ended {
            return Err(DbError::Usage("transaction already ended".to_string()));
        }
        if let Some(reason) = self.conflict.read().clone() {
            return Err(DbError::Conflict(reason));
        }
        if self.db.is_corrupted() {
            return Err(DbError::Corrupt("database is corrupted".to_string()));
        }
        Ok(())
    }

    fn conflict_err(&self) -> DbError {
        let reason = self
            .conflict
            .read()
            .clone()
            .unwrap_or_else(|| "conflict".to_string());
        DbError::Conflict(reason)
    }

    fn schema_of(&self, table: &str) -> Result<Arc<Schema>, DbError> {
        self.state
            .meta
            .get_schema(table)
            .cloned()
            .ok_or_else(|| DbError::Usage(format!("nonexistent table: {table}")))
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TranTable, DbError> {
        if !self.tables.contains_key(table) {
            let info = self
                .state
                .meta
                .get_info(table)
                .ok_or_else(|| DbError::Usage(format!("nonexistent table: {table}")))?;
            let overlays = info.indexes.iter().map(|ov| ov.mutable()).collect();
            self.tables.insert(
                table.to_string(),
                TranTable {
                    nrows_delta: 0,
                    size_delta: 0,
                    overlays,
                },
            );
        }
        Ok(self.tables.get_mut(table).expect("inserted above"))
    }

    /// This transaction's view of one index: its own mutable overlay if the
    /// table has been touched, otherwise the start snapshot.
    fn view_of(&mut self, table: &str, index: usize) -> Result<Overlay, DbError> {
        if let Some(tt) = self.tables.get(table) {
            return tt
                .overlays
                .get(index)
                .cloned()
                .ok_or_else(|| DbError::Usage(format!("{table}: no index {index}")));
        }
        snapshot_overlay(&self.state, table, index)
    }

    fn lookup_in(&mut self, table: &str, index: usize, key: &[u8]) -> Result<Option<u64>, DbError> {
        Ok(self.view_of(table, index)?.lookup(key))
    }

    fn register_read(
        &self,
        table: &str,
        index: usize,
        from: &[u8],
        to: &[u8],
    ) -> Result<(), DbError> {
        if !self.db.inner.ck.lock().read(self.tn, table, index, from, to) {
            return Err(self.conflict_err());
        }
        Ok(())
    }

    /// Every declared foreign key of `schema` must point at an existing
    /// target row (empty values are exempt).
    fn fkey_targets_exist(&mut self, schema: &Schema, rec: &Record) -> Result<(), DbError> {
        for ix in &schema.indexes {
            let fk = match &ix.fk {
                None => continue,
                Some(fk) => fk.clone(),
            };
            let val = ix.ixspec.trunc(ix.columns.len()).key(rec.as_bytes());
            if val.is_empty() {
                continue;
            }
            let target = self
                .state
                .meta
                .get_schema(&fk.table)
                .ok_or_else(|| DbError::Usage(format!("fkey target missing: {}", fk.table)))?;
            let tix = target.index_pos(&fk.columns).ok_or_else(|| {
                DbError::Usage(format!("fkey target index missing: {}", fk.table))
            })?;
            self.register_read(&fk.table, tix, &val, &point_read_end(&val))?;
            if self.lookup_in(&fk.table, tix, &val)?.is_none() {
                return Err(DbError::FkeyBlock(format!(
                    "no matching {}({}) for {}",
                    fk.table,
                    fk.columns.join(","),
                    schema.table,
                )));
            }
        }
        Ok(())
    }

    /// Deleting (or re-keying) a row must leave no referencing rows
    /// behind. For updates, values that do not change are exempt.
    fn fkey_no_referrers(
        &mut self,
        table: &str,
        schema: &Schema,
        old: &Record,
        new: Option<&Record>,
    ) -> Result<(), DbError> {
        let refs = self.state.meta.fk_refs_to(table).to_vec();
        for fkref in refs {
            let src_schema = self
                .state
                .meta
                .get_schema(&fkref.table)
                .expect("referencing schema exists")
                .clone();
            let fk = src_schema.indexes[fkref.index]
                .fk
                .as_ref()
                .expect("back-reference implies fk")
                .clone();
            let our_pos = schema.index_pos(&fk.columns).ok_or_else(|| {
                DbError::Usage(format!("{table}: fkey target index missing"))
            })?;
            let our_ix = &schema.indexes[our_pos];
            let spec = our_ix.ixspec.trunc(our_ix.columns.len());
            let old_val = spec.key(old.as_bytes());
            if old_val.is_empty() {
                continue;
            }
            if let Some(new) = new {
                if spec.key(new.as_bytes()) == old_val {
                    continue; // the referenced value is unchanged
                }
            }
            let (from, to) = ixkey::prefix_range(&old_val);
            self.register_read(&fkref.table, fkref.index, &from, &to)?;
            let ov = self.view_of(&fkref.table, fkref.index)?;
            let mut it = OverIter::new(ov);
            it.set_range(Range {
                org: from,
                end: to,
            });
            it.next();
            if !it.eof() {
                return Err(DbError::FkeyBlock(format!(
                    "{}({}) references {table}",
                    fkref.table,
                    fk.columns.join(","),
                )));
            }
        }
        Ok(())
    }
}

impl Drop for UpdateTran {
    fn drop(&mut self) {
        self.do_abort("transaction abandoned");
    }
}

fn point_read_end(key: &[u8]) -> Bytes {
    let mut end = Vec::with_capacity(key.len() + 1);
    end.extend_from_slice(key);
    end.push(0);
    Bytes::from(end)
}
