//! Transaction conflict checker.
//!
//! Single-threaded by design: the database wraps a `Check` in a mutex, so
//! actions, commits and aborts form one total order — the commit order of
//! the engine. Transactions are numbered from one shared sequence; a
//! transaction's `end` comes from the same sequence, and two transactions
//! overlap iff each started before the other ended.
//!
//! Per transaction and table the checker tracks read ranges and written
//! keys per index. A conflicting pair loses exactly one member: if the
//! other side already committed, the current transaction aborts; otherwise
//! a coin flip picks the victim. A once-per-second tick aborts transactions
//! older than [`MAX_AGE`] ticks.
//!
//! The checker never touches index data. It only says yes or no, and
//! delivers abort reasons through the handle each transaction holds.

pub mod ranges;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;

pub use ranges::Ranges;

/// Hard ceiling on concurrent update transactions.
pub const MAX_TRANS: usize = 200;

/// Ticks before an update transaction is aborted for age.
pub const MAX_AGE: u64 = 20;

const NO_END: u64 = u64::MAX;

/// Where a transaction learns why it died.
pub type ConflictSlot = Arc<RwLock<Option<String>>>;

struct CkTbl {
    /// per index: keys written (outputs, updates, deletes)
    writes: Vec<Option<BTreeSet<Bytes>>>,
    /// per index: key ranges read
    reads: Vec<Option<Ranges>>,
}

impl CkTbl {
    fn new() -> CkTbl {
        CkTbl {
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }

    fn write_contains(&self, index: usize, key: &[u8]) -> bool {
        self.writes
            .get(index)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.contains(key))
    }

    fn write_in_range(&self, index: usize, from: &[u8], to: &[u8]) -> bool {
        self.writes
            .get(index)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| {
                s.range::<[u8], _>((
                    std::ops::Bound::Included(from),
                    std::ops::Bound::Excluded(to),
                ))
                .next()
                .is_some()
            })
    }

    fn read_contains(&self, index: usize, key: &[u8]) -> bool {
        self.reads
            .get(index)
            .and_then(|r| r.as_ref())
            .is_some_and(|r| r.contains(key))
    }

    fn save_write(&mut self, index: usize, key: Bytes) {
        while self.writes.len() <= index {
            self.writes.push(None);
        }
        self.writes[index]
            .get_or_insert_with(BTreeSet::new)
            .insert(key);
    }

    fn save_read(&mut self, index: usize, from: Bytes, to: Bytes) {
        while self.reads.len() <= index {
            self.reads.push(None);
        }
        self.reads[index]
            .get_or_insert_with(Ranges::new)
            .insert(from, to);
    }
}

struct CkTran {
    start: u64,
    end: u64,
    birth: u64,
    tables: HashMap<String, CkTbl>,
    conflict: ConflictSlot,
}

impl CkTran {
    fn is_ended(&self) -> bool {
        self.end != NO_END
    }
}

pub struct Check {
    seq: u64,
    oldest: u64,
    clock: u64,
    trans: HashMap<u64, CkTran>,
    exclusive: HashSet<String>,
    abort_first: bool,
}

impl Default for Check {
    fn default() -> Self {
        Check::new()
    }
}

impl Check {
    pub fn new() -> Check {
        Check {
            seq: 0,
            oldest: NO_END,
            clock: 0,
            trans: HashMap::new(),
            exclusive: HashSet::new(),
            abort_first: false,
        }
    }

    /// Make conflict resolution deterministic (always abort the acting
    /// transaction). For tests.
    pub fn set_abort_first(&mut self, v: bool) {
        self.abort_first = v;
    }

    fn next(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Begin an update transaction; `None` once [`MAX_TRANS`] are
    /// outstanding.
    pub fn start_tran(&mut self) -> Option<(u64, ConflictSlot)> {
        if self.trans.len() >= MAX_TRANS {
            return None;
        }
        let start = self.next();
        let conflict: ConflictSlot = Arc::new(RwLock::new(None));
        self.trans.insert(
            start,
            CkTran {
                start,
                end: NO_END,
                birth: self.clock,
                tables: HashMap::new(),
                conflict: conflict.clone(),
            },
        );
        Some((start, conflict))
    }

    /// Register a range read. Fails (having aborted someone) when an
    /// overlapping transaction wrote a key inside the range.
    pub fn read(&mut self, tn: u64, table: &str, index: usize, from: &[u8], to: &[u8]) -> bool {
        let t = match self.trans.get(&tn) {
            None => return false, // gone, presumably aborted
            Some(t) => t,
        };
        assert!(!t.is_ended());
        if from > to {
            return true; // empty range reads nothing
        }
        if self.exclusive.contains(table) {
            self.abort(tn, "schema change in progress");
            return false;
        }
        let mut conflict: Option<u64> = None;
        for (tn2, t2) in &self.trans {
            if *tn2 != tn && overlap(&self.trans[&tn], t2) {
                if let Some(tbl) = t2.tables.get(table) {
                    if tbl.write_in_range(index, from, to) {
                        conflict = Some(*tn2);
                        break;
                    }
                }
            }
        }
        if let Some(tn2) = conflict {
            if self.abort_one_of(tn, tn2, "read", "write") {
                return false;
            }
        }
        let t = self.trans.get_mut(&tn).expect("survivor still tracked");
        t.tables
            .entry(table.to_string())
            .or_insert_with(CkTbl::new)
            .save_read(index, Bytes::copy_from_slice(from), Bytes::copy_from_slice(to));
        true
    }

    /// Register written keys, one per index (empty keys are skipped).
    /// Updates call this twice, once with old keys and once with new keys.
    pub fn write(&mut self, tn: u64, table: &str, keys: &[Bytes]) -> bool {
        let t = match self.trans.get(&tn) {
            None => return false,
            Some(t) => t,
        };
        assert!(!t.is_ended());
        if self.exclusive.contains(table) {
            self.abort(tn, "schema change in progress");
            return false;
        }
        let mut conflict: Option<(u64, &'static str)> = None;
        'outer: for (tn2, t2) in &self.trans {
            if *tn2 != tn && overlap(&self.trans[&tn], t2) {
                if let Some(tbl) = t2.tables.get(table) {
                    for (i, key) in keys.iter().enumerate() {
                        if key.is_empty() {
                            continue;
                        }
                        if tbl.write_contains(i, key) {
                            conflict = Some((*tn2, "write"));
                            break 'outer;
                        }
                        if tbl.read_contains(i, key) {
                            conflict = Some((*tn2, "read"));
                            break 'outer;
                        }
                    }
                }
            }
        }
        if let Some((tn2, act2)) = conflict {
            if self.abort_one_of(tn, tn2, "write", act2) {
                return false;
            }
        }
        let t = self.trans.get_mut(&tn).expect("survivor still tracked");
        let tbl = t
            .tables
            .entry(table.to_string())
            .or_insert_with(CkTbl::new);
        for (i, key) in keys.iter().enumerate() {
            if !key.is_empty() {
                tbl.save_write(i, key.clone());
            }
        }
        true
    }

    /// Abort one of the pair; returns true when the acting transaction
    /// `tn` was the victim. A committed other side always survives.
    fn abort_one_of(&mut self, tn: u64, tn2: u64, act1: &str, act2: &str) -> bool {
        let t2_ended = self.trans[&tn2].is_ended();
        if t2_ended || self.abort_first || rand::thread_rng().gen::<bool>() {
            self.abort(
                tn,
                &format!("{act1} in this transaction conflicted with {act2} in another transaction"),
            );
            true
        } else {
            self.abort(
                tn2,
                &format!("{act2} in this transaction conflicted with {act1} in another transaction"),
            );
            false
        }
    }

    /// Cancel a transaction; false if it is already gone.
    pub fn abort(&mut self, tn: u64, reason: &str) -> bool {
        let t = match self.trans.remove(&tn) {
            None => return false,
            Some(t) => t,
        };
        *t.conflict.write() = Some(reason.to_string());
        if tn == self.oldest {
            self.oldest = NO_END;
        }
        self.clean_ended();
        true
    }

    /// Finish a transaction; no further checking is needed because every
    /// action was checked as it happened.
    pub fn commit(&mut self, tn: u64) -> bool {
        if !self.trans.contains_key(&tn) {
            return false; // gone, presumably aborted
        }
        let end = self.next();
        let t = self.trans.get_mut(&tn).expect("present above");
        t.end = end;
        if t.start == self.oldest {
            self.oldest = NO_END;
        }
        self.clean_ended();
        true
    }

    /// Drop ended transactions that finished before the earliest
    /// outstanding start.
    fn clean_ended(&mut self) {
        if self.oldest == NO_END {
            self.oldest = self
                .trans
                .values()
                .filter(|t| !t.is_ended())
                .map(|t| t.start)
                .min()
                .unwrap_or(NO_END);
        }
        let oldest = self.oldest;
        self.trans.retain(|_, t| !(t.is_ended() && t.end < oldest));
    }

    /// Advance the age clock; aborts transactions older than [`MAX_AGE`].
    pub fn tick(&mut self) {
        self.clock += 1;
        let expired: Vec<u64> = self
            .trans
            .values()
            .filter(|t| !t.is_ended() && self.clock - t.birth >= MAX_AGE)
            .map(|t| t.start)
            .collect();
        for tn in expired {
            self.abort(tn, "transaction exceeded max age");
        }
    }

    /// Outstanding update transaction numbers.
    pub fn transactions(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .trans
            .values()
            .filter(|t| !t.is_ended())
            .map(|t| t.start)
            .collect();
        v.sort_unstable();
        v
    }

    /// Committed transactions still tracked for overlap checks.
    pub fn final_count(&self) -> usize {
        self.trans.values().filter(|t| t.is_ended()).count()
    }

    // exclusive table guards --------------------------------------------

    /// Reserve a table for a schema operation; false if already reserved.
    pub fn set_exclusive(&mut self, table: &str) -> bool {
        self.exclusive.insert(table.to_string())
    }

    pub fn clear_exclusive(&mut self, table: &str) {
        self.exclusive.remove(table);
    }

    /// Whether any outstanding transaction has touched `table`.
    pub fn table_busy(&self, table: &str) -> bool {
        self.trans
            .values()
            .any(|t| !t.is_ended() && t.tables.contains_key(table))
    }
}

fn overlap(t1: &CkTran, t2: &CkTran) -> bool {
    t1.end > t2.start && t2.end > t1.start
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn start(ck: &mut Check) -> (u64, ConflictSlot) {
        ck.start_tran().expect("transaction slot")
    }

    #[test]
    fn starts_are_strictly_increasing() {
        let mut ck = Check::new();
        let mut last = 0;
        for _ in 0..50 {
            let (tn, _) = start(&mut ck);
            assert!(tn > last);
            last = tn;
            ck.commit(tn);
        }
    }

    #[test]
    fn max_trans_is_a_hard_ceiling() {
        let mut ck = Check::new();
        let mut slots = Vec::new();
        for _ in 0..MAX_TRANS {
            slots.push(start(&mut ck));
        }
        assert!(ck.start_tran().is_none());
        let (tn, _) = slots.pop().unwrap();
        ck.abort(tn, "make room");
        assert!(ck.start_tran().is_some());
    }

    #[test]
    fn write_write_conflict_aborts_one() {
        let mut ck = Check::new();
        ck.set_abort_first(true);
        let (t1, _) = start(&mut ck);
        let (t2, c2) = start(&mut ck);
        assert!(ck.write(t1, "t", &[b("k")]));
        assert!(!ck.write(t2, "t", &[b("k")]));
        assert!(c2.read().as_deref().is_some());
        // the victim is gone; the survivor can commit
        assert!(!ck.commit(t2));
        assert!(ck.commit(t1));
    }

    #[test]
    fn read_range_conflicts_with_write_in_range() {
        let mut ck = Check::new();
        ck.set_abort_first(true);
        let (t1, _) = start(&mut ck);
        let (t2, _) = start(&mut ck);
        assert!(ck.write(t1, "t", &[b("m")]));
        assert!(!ck.read(t2, "t", 0, b"a".as_ref(), b"z".as_ref()));

        // non-overlapping range is fine
        let (t3, _) = start(&mut ck);
        assert!(ck.read(t3, "t", 0, b"n".as_ref(), b"z".as_ref()));
    }

    #[test]
    fn write_into_read_range_conflicts() {
        let mut ck = Check::new();
        ck.set_abort_first(true);
        let (t1, _) = start(&mut ck);
        let (t2, _) = start(&mut ck);
        assert!(ck.read(t1, "t", 0, b"a".as_ref(), b"m".as_ref()));
        assert!(!ck.write(t2, "t", &[b("c")]));
        assert!(ck.commit(t1));
    }

    #[test]
    fn committed_side_always_survives() {
        let mut ck = Check::new();
        // no abort_first: the committed side must win regardless of the coin
        for _ in 0..20 {
            let (t1, _) = start(&mut ck);
            let (t2, c2) = start(&mut ck);
            assert!(ck.write(t1, "t", &[b("k")]));
            assert!(ck.commit(t1));
            assert!(!ck.write(t2, "t", &[b("k")]));
            assert!(c2.read().is_some());
        }
    }

    #[test]
    fn non_overlapping_transactions_do_not_conflict() {
        let mut ck = Check::new();
        let (t1, _) = start(&mut ck);
        assert!(ck.write(t1, "t", &[b("k")]));
        assert!(ck.commit(t1));
        // t2 starts after t1 ended
        let (t2, _) = start(&mut ck);
        assert!(ck.write(t2, "t", &[b("k")]));
        assert!(ck.commit(t2));
    }

    #[test]
    fn different_indexes_do_not_conflict() {
        let mut ck = Check::new();
        let (t1, _) = start(&mut ck);
        let (t2, _) = start(&mut ck);
        assert!(ck.write(t1, "t", &[b("k")]));
        assert!(ck.write(t2, "t", &[Bytes::new(), b("k")]));
        assert!(ck.commit(t1));
        assert!(ck.commit(t2));
    }

    #[test]
    fn tick_aborts_old_transactions() {
        let mut ck = Check::new();
        let (t1, c1) = start(&mut ck);
        for _ in 0..MAX_AGE {
            ck.tick();
        }
        assert!(!ck.commit(t1));
        assert_eq!(c1.read().as_deref(), Some("transaction exceeded max age"));
    }

    #[test]
    fn exclusive_tables_abort_actions() {
        let mut ck = Check::new();
        assert!(ck.set_exclusive("t"));
        assert!(!ck.set_exclusive("t"));
        let (t1, c1) = start(&mut ck);
        assert!(!ck.write(t1, "t", &[b("k")]));
        assert_eq!(c1.read().as_deref(), Some("schema change in progress"));
        ck.clear_exclusive("t");
        let (t2, _) = start(&mut ck);
        assert!(ck.write(t2, "t", &[b("k")]));
    }

    #[test]
    fn table_busy_tracks_outstanding_touches() {
        let mut ck = Check::new();
        let (t1, _) = start(&mut ck);
        assert!(!ck.table_busy("t"));
        assert!(ck.write(t1, "t", &[b("k")]));
        assert!(ck.table_busy("t"));
        assert!(ck.commit(t1));
        assert!(!ck.table_busy("t"));
    }
}
