//! The database: state publication, transactions, schema operations, and
//! the background merge/persist pipeline.
//!
//! One process writes a given file. Readers take `Arc<DbState>` snapshots;
//! writers go through the checker; a single background worker owns merging
//! committed layers into base buffers and folding bases into the on-disk
//! trees, so persisted states always contain whole transactions.

pub mod integrity;
pub mod options;
pub mod state;
pub mod tran;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::check::Check;
use crate::index::fbtree::TreeBuilder;
use crate::index::overlay::Overlay;
use crate::meta::{Info, Meta, Schema};
use crate::record::Record;
use crate::stor::{self, Stor};

pub use crate::index::iter::Range as IterRange;
pub use options::DbOptions;
pub use state::DbState;
pub use tran::{ReadTran, UpdateTran};

const MAGIC: &[u8; 8] = b"amdb0002";
const MAGIC_PREV: &[u8; 8] = b"amdb0001";
const MAGIC_BASE: &[u8; 4] = b"amdb";
const HEADER_LEN: usize = 8 + stor::SMALL_OFFSET_LEN;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("duplicate key in {table} ({index})")]
    DuplicateKey { table: String, index: String },

    #[error("blocked by foreign key: {0}")]
    FkeyBlock(String),

    #[error("schema in use: {0}")]
    SchemaInUse(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("too many update transactions")]
    TooManyTrans,

    #[error("{0}")]
    Usage(String),
}

pub(crate) struct DbInner {
    pub(crate) store: Arc<Stor>,
    pub(crate) state: RwLock<Arc<DbState>>,
    /// Serializes state swaps: commits, merges, saves, schema changes.
    pub(crate) commit_lock: Mutex<()>,
    /// Serializes whole merge/persist passes: the worker, explicit
    /// `persist()` calls, and the final pass at close.
    persist_lock: Mutex<()>,
    pub(crate) ck: Mutex<Check>,
    schema_lock: AtomicBool,
    merge_queue: Mutex<VecDeque<String>>,
    work_cv: Condvar,
    closed: AtomicBool,
    corrupted: AtomicBool,
    /// Set on every published state; cleared when a state block is written.
    dirty: AtomicBool,
    read_only: bool,
    options: DbOptions,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Create a new database file.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Database> {
        let store = Arc::new(Stor::create(&path).context("create database file")?);
        Database::create_on(store, DbOptions::default())
    }

    /// Create an in-memory database (tests and scratch work).
    pub fn heap() -> Database {
        let store = Arc::new(Stor::heap(4 * 1024 * 1024));
        Database::create_on(store, DbOptions::default()).expect("heap create cannot fail")
    }

    pub fn heap_with(options: DbOptions) -> Database {
        let store = Arc::new(Stor::heap(4 * 1024 * 1024));
        Database::create_on(store, options).expect("heap create cannot fail")
    }

    fn create_on(store: Arc<Stor>, options: DbOptions) -> anyhow::Result<Database> {
        let (off, buf) = store.alloc(HEADER_LEN);
        debug_assert_eq!(off, 0);
        buf[..8].copy_from_slice(MAGIC);
        // an empty state block makes a fresh file recoverable immediately
        state::write_state(&store, &Meta::new());
        let size = store.size();
        let mut size5 = [0u8; stor::SMALL_OFFSET_LEN];
        stor::put5(&mut size5, size);
        store.write(8, &size5);

        let db = Database::assemble(store, Meta::new(), false, options);
        db.start_workers();
        Ok(db)
    }

    /// Open an existing database for update.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Database> {
        Database::open_with(path, DbOptions::default(), false)
    }

    /// Open read-only: no checker, no background workers, no writes.
    pub fn open_read(path: impl AsRef<Path>) -> anyhow::Result<Database> {
        Database::open_with(path, DbOptions::default(), true)
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        options: DbOptions,
        read_only: bool,
    ) -> anyhow::Result<Database> {
        let store = Arc::new(Stor::open(&path, read_only).context("open database file")?);
        let header = store.data(0);
        if header.len() < HEADER_LEN || &header[..4] != MAGIC_BASE {
            anyhow::bail!("not a valid database file");
        }
        if &header[..8] == MAGIC_PREV {
            if !read_only {
                store.write(0, MAGIC);
            }
        } else if &header[..8] != MAGIC {
            anyhow::bail!("invalid database version");
        }
        let header_size = stor::get5(&header[8..]);
        if header_size == 0 {
            anyhow::bail!("database is marked corrupt; repair required");
        }

        let meta = if header_size == store.size() && header_size >= state::STATE_LEN as u64 {
            state::read_state(&store, header_size - state::STATE_LEN as u64)
                .map_err(|e| anyhow::anyhow!("{e}"))?
        } else {
            // the process died without shutting down; fall back to the
            // newest valid state block
            warn!(
                header_size,
                file_size = store.size(),
                "size mismatch, scanning for last good state"
            );
            let off = state::find_state(&store)
                .ok_or_else(|| anyhow::anyhow!("no valid state found; database corrupt"))?;
            let meta = state::read_state(&store, off).map_err(|e| anyhow::anyhow!("{e}"))?;
            store.set_size(off + state::STATE_LEN as u64);
            warn!(recovered_size = store.size(), "recovered");
            meta
        };

        let db = Database::assemble(store, meta, read_only, options);
        if db.inner.options.check_on_open {
            db.quick_check().context("integrity check on open")?;
        }
        if !read_only {
            db.start_workers();
        }
        Ok(db)
    }

    fn assemble(store: Arc<Stor>, meta: Meta, read_only: bool, options: DbOptions) -> Database {
        let state = Arc::new(DbState {
            meta,
            store: store.clone(),
        });
        Database {
            inner: Arc::new(DbInner {
                store,
                state: RwLock::new(state),
                commit_lock: Mutex::new(()),
                persist_lock: Mutex::new(()),
                ck: Mutex::new(Check::new()),
                schema_lock: AtomicBool::new(false),
                merge_queue: Mutex::new(VecDeque::new()),
                work_cv: Condvar::new(),
                closed: AtomicBool::new(false),
                corrupted: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
                read_only,
                options,
                stop: Arc::new(AtomicBool::new(false)),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    // state -------------------------------------------------------------

    pub(crate) fn state(&self) -> Arc<DbState> {
        self.inner.state.read().clone()
    }

    pub fn size(&self) -> u64 {
        self.inner.store.size()
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.corrupted.load(Ordering::Acquire)
    }

    /// Flag the database corrupt: zero the header size so the next open
    /// demands a repair, and refuse further writes.
    pub fn corrupt(&self) {
        if self.inner.corrupted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("database marked corrupt");
        if !self.inner.read_only {
            self.inner.store.write(8, &[0u8; stor::SMALL_OFFSET_LEN]);
        }
    }

    // transactions ------------------------------------------------------

    pub fn new_read_tran(&self) -> ReadTran {
        ReadTran {
            state: self.state(),
        }
    }

    pub fn new_update_tran(&self) -> Result<UpdateTran, DbError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DbError::Usage("database closed".to_string()));
        }
        if self.is_corrupted() {
            return Err(DbError::Corrupt("database is corrupted".to_string()));
        }
        if self.inner.read_only {
            return Err(DbError::Usage("database opened read-only".to_string()));
        }
        let (tn, conflict) = self
            .inner
            .ck
            .lock()
            .start_tran()
            .ok_or(DbError::TooManyTrans)?;
        Ok(UpdateTran {
            db: self.clone(),
            state: self.state(),
            tn,
            conflict,
            tables: std::collections::HashMap::new(),
            ended: false,
        })
    }

    /// Make conflict resolution deterministic: the transaction whose
    /// action detects the conflict always loses. For tests.
    pub fn set_abort_acting(&self, v: bool) {
        self.inner.ck.lock().set_abort_first(v);
    }

    /// Outstanding update transaction numbers.
    pub fn transactions(&self) -> Vec<u64> {
        if self.is_corrupted() {
            return Vec::new();
        }
        self.inner.ck.lock().transactions()
    }

    /// Committed transactions still tracked for conflict checks.
    pub fn final_count(&self) -> usize {
        self.inner.ck.lock().final_count()
    }

    pub(crate) fn store_record(&self, rec: &Record) -> u64 {
        self.inner.store.save_sized(rec.as_bytes())
    }

    /// Publish a committed transaction: its per-index buffers are re-based
    /// onto the latest state and appended as new layers.
    pub(crate) fn commit_tran(&self, tran: &mut UpdateTran) -> Result<(), DbError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(DbError::Usage("database closed".to_string()));
        }
        let _cl = inner.commit_lock.lock();
        let cur = self.state();
        // a schema change since this transaction started invalidates its
        // per-index buffers; the transaction loses
        for (table, tt) in &tran.tables {
            if tt.overlays.iter().all(|ov| ov.mut_len() == 0) {
                continue;
            }
            let ok = cur
                .meta
                .get_info(table)
                .is_some_and(|i| i.indexes.len() == tt.overlays.len());
            if !ok {
                let reason = format!("schema of {table} changed during transaction");
                inner.ck.lock().abort(tran.tn, &reason);
                return Err(DbError::Conflict(reason));
            }
        }
        {
            let mut ck = inner.ck.lock();
            if !ck.commit(tran.tn) {
                let reason = tran
                    .conflict
                    .read()
                    .clone()
                    .unwrap_or_else(|| "conflict".to_string());
                return Err(DbError::Conflict(reason));
            }
        }
        let mut infos = Vec::new();
        let mut touched = Vec::new();
        for (table, tt) in &tran.tables {
            if tt.overlays.iter().all(|ov| ov.mut_len() == 0) {
                continue;
            }
            let latest = cur
                .meta
                .get_info(table)
                .expect("schema changes drain transactions first");
            let indexes: Vec<Overlay> = tt
                .overlays
                .iter()
                .enumerate()
                .map(|(i, ov)| ov.update_with(&latest.indexes[i]))
                .collect();
            infos.push(Info {
                table: table.clone(),
                nrows: (latest.nrows as i64 + tt.nrows_delta) as u64,
                total_size: (latest.total_size as i64 + tt.size_delta) as u64,
                indexes,
            });
            touched.push(table.clone());
        }
        if !infos.is_empty() {
            self.publish(cur.meta.put_infos(infos));
            let mut queue = inner.merge_queue.lock();
            queue.extend(touched);
            inner.work_cv.notify_one();
        }
        Ok(())
    }

    // schema operations -------------------------------------------------

    pub fn create_table(&self, mut schema: Schema) -> anyhow::Result<()> {
        schema.check().map_err(DbError::Usage)?;
        schema.setup_indexes();
        let _sl = self.lock_schema()?;
        self.state()
            .meta
            .check_fkeys(&schema)
            .map_err(DbError::Usage)?;
        let table = schema.table.clone();
        self.run_exclusive(&table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            if cur.meta.get_schema(&table).is_some() || cur.meta.get_view(&table).is_some() {
                return Err(DbError::Usage(format!("existing table or view: {table}")).into());
            }
            let info = self.empty_info(&schema);
            let meta = cur.meta.put(Arc::new(schema.clone()), info);
            self.publish(meta);
            Ok(())
        })
    }

    /// Idempotent create-or-extend. Index builds on existing data run
    /// outside the exclusive section.
    pub fn ensure(&self, mut schema: Schema) -> anyhow::Result<()> {
        schema.check().map_err(DbError::Usage)?;
        schema.setup_indexes();
        if self.schema_subsumes(&schema) {
            return Ok(()); // the common fast case
        }
        let _sl = self.lock_schema()?;
        self.state()
            .meta
            .check_fkeys(&schema)
            .map_err(DbError::Usage)?;
        let table = schema.table.clone();

        let mut to_build = Vec::new();
        let handled = self.run_exclusive(&table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            if cur.meta.get_schema(&table).is_none() {
                let info = self.empty_info(&schema);
                let meta = cur.meta.put(Arc::new(schema.clone()), info);
                self.publish(meta);
                return Ok(true);
            }
            let (meta, added) = cur.meta.ensure(&schema).map_err(DbError::Usage)?;
            let nrows = cur.meta.get_info(&table).map_or(0, |i| i.nrows);
            if added.is_empty() || nrows == 0 {
                // no data yet: new indexes start as empty overlays
                let mut info = meta
                    .get_info(&table)
                    .expect("info exists for every table")
                    .clone();
                for (_, ix) in &added {
                    info.indexes.push(Overlay::new(
                        self.inner.store.clone(),
                        Arc::new(ix.ixspec.clone()),
                    ));
                }
                self.publish(meta.put_infos([info]));
                return Ok(true);
            }
            to_build = added;
            Ok(false)
        })?;
        if handled {
            return Ok(());
        }

        // building indexes over existing data is slow; do it without
        // holding the table exclusive, then re-run ensure and publish
        let built = self.build_indexes(&table, &to_build)?;
        self.run_exclusive(&table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let (meta, added) = cur.meta.ensure(&schema).map_err(DbError::Usage)?;
            let mut info = meta
                .get_info(&table)
                .expect("info exists for every table")
                .clone();
            debug_assert_eq!(added.len(), built.len());
            for ov in built {
                info.indexes.push(ov);
            }
            self.publish(meta.put_infos([info]));
            Ok(())
        })
    }

    pub fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        if self.get_view(table).is_some() {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let meta = cur.meta.drop_view(table).expect("view exists");
            self.publish(meta);
            return Ok(());
        }
        self.run_exclusive(table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let meta = cur.meta.drop_table(table).map_err(DbError::Usage)?;
            self.publish(meta);
            Ok(())
        })
    }

    pub fn rename_table(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        self.run_exclusive(from, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let meta = cur.meta.rename_table(from, to).map_err(DbError::Usage)?;
            self.publish(meta);
            Ok(())
        })
    }

    pub fn alter_rename(&self, table: &str, from: &[String], to: &[String]) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        self.run_exclusive(table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let meta = cur
                .meta
                .alter_rename(table, from, to)
                .map_err(DbError::Usage)?;
            self.publish(meta);
            Ok(())
        })
    }

    /// Add columns and/or indexes; new indexes are built against existing
    /// data outside the exclusive section.
    pub fn alter_create(&self, delta: Schema) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        self.state()
            .meta
            .check_fkeys(&delta)
            .map_err(DbError::Usage)?;
        let table = delta.table.clone();

        // validate and discover what needs building
        let (_, added) = self
            .state()
            .meta
            .alter_create(&delta)
            .map_err(DbError::Usage)?;
        let built = if added.is_empty() {
            Vec::new()
        } else {
            self.build_indexes(&table, &added)?
        };

        self.run_exclusive(&table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let (meta, added) = cur.meta.alter_create(&delta).map_err(DbError::Usage)?;
            let mut info = meta
                .get_info(&table)
                .expect("info exists for every table")
                .clone();
            debug_assert_eq!(added.len(), built.len());
            for ov in built {
                info.indexes.push(ov);
            }
            self.publish(meta.put_infos([info]));
            Ok(())
        })
    }

    pub fn alter_drop(&self, delta: Schema) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        self.run_exclusive(&delta.table, || {
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let meta = cur.meta.alter_drop(&delta).map_err(DbError::Usage)?;
            self.publish(meta);
            Ok(())
        })
    }

    pub fn add_view(&self, name: &str, def: &str) -> anyhow::Result<()> {
        let _sl = self.lock_schema()?;
        let _cl = self.inner.commit_lock.lock();
        let cur = self.state();
        let meta = cur
            .meta
            .add_view(name, def)
            .ok_or_else(|| DbError::Usage(format!("existing table or view: {name}")))?;
        self.publish(meta);
        Ok(())
    }

    pub fn get_view(&self, name: &str) -> Option<String> {
        self.state().meta.get_view(name)
    }

    /// The display form of a table's schema, if it exists.
    pub fn schema(&self, table: &str) -> Option<String> {
        self.state()
            .meta
            .get_schema(table)
            .map(|s| s.to_display())
    }

    fn empty_info(&self, schema: &Schema) -> Info {
        Info {
            table: schema.table.clone(),
            nrows: 0,
            total_size: 0,
            indexes: schema
                .indexes
                .iter()
                .map(|ix| {
                    Overlay::new(self.inner.store.clone(), Arc::new(ix.ixspec.clone()))
                })
                .collect(),
        }
    }

    fn publish(&self, meta: Meta) {
        *self.inner.state.write() = Arc::new(DbState {
            meta,
            store: self.inner.store.clone(),
        });
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Does the current schema already include everything `schema` asks
    /// for? The ensure fast path.
    fn schema_subsumes(&self, schema: &Schema) -> bool {
        let cur = self.state();
        let existing = match cur.meta.get_schema(&schema.table) {
            None => return false,
            Some(s) => s,
        };
        schema
            .columns
            .iter()
            .all(|c| existing.col_pos(c).is_some())
            && schema.indexes.iter().all(|ix| {
                existing
                    .find_index(&ix.columns)
                    .is_some_and(|e| e.same_as(ix))
            })
    }

    fn lock_schema(&self) -> Result<SchemaLock<'_>, DbError> {
        if self.inner.read_only {
            return Err(DbError::Usage("database opened read-only".to_string()));
        }
        if self.is_corrupted() {
            return Err(DbError::Corrupt("database is corrupted".to_string()));
        }
        if self
            .inner
            .schema_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DbError::SchemaInUse(
                "concurrent schema modification".to_string(),
            ));
        }
        Ok(SchemaLock { db: self })
    }

    /// Reserve `table`, wait for outstanding transactions that touched it
    /// to drain, run `f`, release.
    fn run_exclusive<T>(
        &self,
        table: &str,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        if !self.inner.ck.lock().set_exclusive(table) {
            return Err(DbError::SchemaInUse(format!("table in use: {table}")).into());
        }
        while self.inner.ck.lock().table_busy(table) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let result = f();
        self.inner.ck.lock().clear_exclusive(table);
        result
    }

    /// Build new indexes from a table's existing rows: collect offsets via
    /// the first index, sort per new index, bulk load.
    fn build_indexes(
        &self,
        table: &str,
        added: &[(usize, crate::meta::Index)],
    ) -> anyhow::Result<Vec<Overlay>> {
        use rayon::prelude::*;

        let rt = self.new_read_tran();
        let mut offs = Vec::new();
        let mut it = rt.iter(table, 0)?;
        it.next();
        while !it.eof() {
            let (_, off) = it.cur().expect("positioned");
            offs.push(off);
            it.next();
        }

        let mut out = Vec::with_capacity(added.len());
        for (_, ix) in added {
            let spec = Arc::new(ix.ixspec.clone());
            let mut keyed: Vec<(bytes::Bytes, u64)> = offs
                .par_iter()
                .map(|&off| {
                    let rec = rt.read_record(off);
                    (spec.key(rec.as_bytes()), off)
                })
                .collect();
            keyed.par_sort_unstable();
            let mut builder = TreeBuilder::new(self.inner.store.clone());
            for (key, off) in keyed {
                builder.add(key, off).map_err(|_| {
                    DbError::Usage(format!(
                        "cannot build index: duplicate value in {table} ({})",
                        ix.columns.join(",")
                    ))
                })?;
            }
            let fb = builder.finish(spec);
            out.push(Overlay::for_tree(fb));
        }
        Ok(out)
    }

    // background pipeline -----------------------------------------------

    fn start_workers(&self) {
        let db = self.clone();
        let worker = std::thread::Builder::new()
            .name("amberdb-persist".to_string())
            .spawn(move || db.worker_loop())
            .expect("spawn persist worker");

        let stop_tick = self.inner.stop.clone();
        let db_tick = self.clone();
        let tick_interval = self.inner.options.tick_interval;
        let ticker = std::thread::Builder::new()
            .name("amberdb-tick".to_string())
            .spawn(move || loop {
                let deadline = Instant::now() + tick_interval;
                loop {
                    if stop_tick.load(Ordering::Acquire) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(deadline.saturating_duration_since(now).min(Duration::from_millis(25)));
                }
                db_tick.inner.ck.lock().tick();
            })
            .expect("spawn tick worker");

        self.inner.workers.lock().extend([worker, ticker]);
    }

    fn worker_loop(&self) {
        let mut last_persist = Instant::now();
        loop {
            let stopping = self.inner.stop.load(Ordering::Acquire);
            let tables: Vec<String> = {
                let mut queue = self.inner.merge_queue.lock();
                if queue.is_empty() && !stopping {
                    self.inner
                        .work_cv
                        .wait_for(&mut queue, Duration::from_millis(50));
                }
                let mut seen = std::collections::HashSet::new();
                queue
                    .drain(..)
                    .filter(|t| seen.insert(t.clone()))
                    .collect()
            };

            let work = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _pl = self.inner.persist_lock.lock();
                for table in &tables {
                    self.merge_table(table);
                }
                if stopping || last_persist.elapsed() >= self.inner.options.persist_interval {
                    self.persist_all();
                    last_persist = Instant::now();
                }
            }));
            if let Err(e) = work {
                error!(?e, "background worker failed; marking corrupt");
                self.corrupt();
                return;
            }
            if stopping {
                return;
            }
        }
    }

    /// Fold a table's committed layers into each index's base buffer.
    fn merge_table(&self, table: &str) {
        let cur = self.state();
        let info = match cur.meta.get_info(table) {
            None => return, // dropped since queued
            Some(i) => i,
        };
        let mut pending = Vec::new();
        for (i, ov) in info.indexes.iter().enumerate() {
            let layers = ov.layer_count();
            if layers > 1 {
                pending.push((i, ov.merge(layers - 1), layers - 1));
            }
        }
        if pending.is_empty() {
            return;
        }
        debug!(table, merged = pending.len(), "merge");
        let _cl = self.inner.commit_lock.lock();
        let cur = self.state();
        let info = match cur.meta.get_info(table) {
            None => return,
            Some(i) => i,
        };
        let mut info = info.clone();
        for (i, merged, nmerged) in pending {
            info.indexes[i] = info.indexes[i].with_merged(merged, nmerged);
        }
        self.publish(cur.meta.put_infos([info]));
    }

    /// Merge every table, fold every non-empty base into its tree, and
    /// publish a new state block. Persisted states contain only whole
    /// transactions because this worker is the only merger.
    fn persist_all(&self) {
        if self.inner.read_only || self.is_corrupted() {
            return;
        }
        let tables: Vec<String> = {
            let mut v = Vec::new();
            self.state().meta.for_each_info(|i| v.push(i.table.clone()));
            v
        };
        for table in &tables {
            self.merge_table(table);
        }
        let mut changed = false;
        for table in &tables {
            let cur = self.state();
            let info = match cur.meta.get_info(table) {
                None => continue,
                Some(i) => i,
            };
            let mut pending = Vec::new();
            for (i, ov) in info.indexes.iter().enumerate() {
                if ov.base_len() > 0 {
                    pending.push((i, ov.save()));
                }
            }
            if pending.is_empty() {
                continue;
            }
            changed = true;
            let _cl = self.inner.commit_lock.lock();
            let cur = self.state();
            let mut info = match cur.meta.get_info(table) {
                None => continue,
                Some(i) => i.clone(),
            };
            for (i, fb) in pending {
                info.indexes[i] = info.indexes[i].with_saved(fb);
            }
            self.publish(cur.meta.put_infos([info]));
        }
        if changed || self.inner.dirty.load(Ordering::Acquire) {
            // clear first: a publish racing in after the snapshot re-marks
            self.inner.dirty.store(false, Ordering::Release);
            let cur = self.state();
            let off = state::write_state(&self.inner.store, &cur.meta);
            debug!(state_off = off, size = self.inner.store.size(), "persist");
        }
    }

    /// Force a full merge + persist now (mainly for tests and the CLI).
    pub fn persist(&self) {
        if !self.inner.read_only {
            let _pl = self.inner.persist_lock.lock();
            self.persist_all();
        }
    }

    // shutdown ----------------------------------------------------------

    /// Stop the background workers, persist, and close the file (writing
    /// the final size into the header).
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.store(true, Ordering::Release);
        self.inner.work_cv.notify_one();
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for w in workers {
            let _ = w.join();
        }
        if !self.inner.read_only && !self.is_corrupted() {
            {
                let _pl = self.inner.persist_lock.lock();
                self.persist_all();
            }
            let size = self.inner.store.size();
            let mut size5 = [0u8; stor::SMALL_OFFSET_LEN];
            stor::put5(&mut size5, size);
            self.inner.store.write(8, &size5);
            self.inner.store.close(size);
        } else {
            self.inner.store.close(self.inner.store.size());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

struct SchemaLock<'a> {
    db: &'a Database,
}

impl Drop for SchemaLock<'_> {
    fn drop(&mut self) {
        self.db.inner.schema_lock.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("size", &self.size())
            .field("corrupted", &self.is_corrupted())
            .finish()
    }
}

