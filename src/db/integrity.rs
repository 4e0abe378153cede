//! Integrity checking.
//!
//! Two depths: the quick check at open walks only recently written tree
//! regions and records, verifying checksums; the full check walks every
//! index of every table in parallel, verifying key order, key/data
//! agreement, record checksums, and row counts against the catalog.

use rayon::prelude::*;
use tracing::warn;

use super::Database;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub tables: usize,
    pub indexes: usize,
    pub entries: u64,
}

impl Database {
    /// Fast integrity check over recently written state. Run at open.
    pub fn quick_check(&self) -> anyhow::Result<()> {
        let state = self.state();
        let mut tables = Vec::new();
        state.meta.for_each_info(|i| tables.push(i.table.clone()));
        for table in tables {
            let info = state.meta.get_info(&table).expect("listed above");
            for (i, ov) in info.indexes.iter().enumerate() {
                let mut bad = None;
                ov.tree()
                    .quick_check(&mut |off| {
                        if bad.is_none() && state.store.data_sized_ck(off).is_err() {
                            bad = Some(off);
                        }
                    })
                    .map_err(|e| anyhow::anyhow!("{table} index {i}: {e}"))?;
                if let Some(off) = bad {
                    anyhow::bail!("{table}: record checksum mismatch at {off}");
                }
            }
        }
        Ok(())
    }

    /// Exhaustive check of every table. Tables are verified in parallel;
    /// the first problem found is returned.
    pub fn full_check(&self) -> anyhow::Result<CheckReport> {
        let state = self.state();
        let mut tables = Vec::new();
        state.meta.for_each_info(|i| tables.push(i.table.clone()));

        let results: Vec<anyhow::Result<(usize, u64)>> = tables
            .par_iter()
            .map(|table| {
                let info = state.meta.get_info(table).expect("listed above");
                let mut entries = 0u64;
                for (i, ov) in info.indexes.iter().enumerate() {
                    // the tree itself: order, prefixes, node checksums
                    ov.tree()
                        .check(&mut |_| {})
                        .map_err(|e| anyhow::anyhow!("{table} index {i}: {e}"))?;
                    // the merged view: visible count and record checksums
                    let mut count = 0u64;
                    let mut pos: Option<(bytes::Bytes, u64)> = None;
                    while let Some((k, d)) =
                        ov.next_at(pos.as_ref().map(|(k, d)| (k.as_ref(), *d)))
                    {
                        count += 1;
                        let off = crate::index::ixbuf::undouble(d);
                        state
                            .store
                            .data_sized_ck(off)
                            .map_err(|_| anyhow::anyhow!("{table}: bad record at {off}"))?;
                        pos = Some((k, d + 1));
                    }
                    if count != info.nrows {
                        anyhow::bail!(
                            "{table} index {i}: {count} entries but {} rows recorded",
                            info.nrows
                        );
                    }
                    entries += count;
                }
                Ok((info.indexes.len(), entries))
            })
            .collect();

        let mut report = CheckReport {
            tables: tables.len(),
            ..CheckReport::default()
        };
        for r in results {
            match r {
                Ok((indexes, entries)) => {
                    report.indexes += indexes;
                    report.entries += entries;
                }
                Err(e) => {
                    warn!(error = %e, "integrity check failed");
                    return Err(e);
                }
            }
        }
        Ok(report)
    }
}
