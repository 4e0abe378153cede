//! Persisted database state.
//!
//! A state block is the root of everything: the offsets of the catalog's
//! schema and info blocks, tagged and checksummed, at a fixed length so the
//! newest one can be found at `size - STATE_LEN` — or, after a crash, by
//! scanning backwards over 8-byte boundaries for the newest block whose tag
//! and checksum verify.

use std::sync::Arc;

use crate::cksum;
use crate::meta::Meta;
use crate::stor::{self, Stor, ALIGN};

/// The immutable root published atomically on every commit and persist.
pub struct DbState {
    pub meta: Meta,
    pub store: Arc<Stor>,
}

const STATE_TAG: &[u8; 8] = b"amdbSt01";

/// tag + schema offset + info offset + padding + checksum
pub const STATE_LEN: usize = 8 + stor::SMALL_OFFSET_LEN + stor::SMALL_OFFSET_LEN + 2 + cksum::LEN;

/// Write the catalog and a state block pointing at it; returns the state
/// block's offset.
pub fn write_state(store: &Stor, meta: &Meta) -> u64 {
    let (schema_off, info_off) = meta.write(store);
    let (off, buf) = store.alloc(STATE_LEN);
    buf[..8].copy_from_slice(STATE_TAG);
    stor::put5(&mut buf[8..], schema_off);
    stor::put5(&mut buf[13..], info_off);
    buf[18] = 0;
    buf[19] = 0;
    cksum::update(buf);
    off
}

/// Read the state block at `off` and rebuild the catalog.
pub fn read_state(store: &Arc<Stor>, off: u64) -> Result<Meta, String> {
    let data = store.data(off);
    if data.len() < STATE_LEN || &data[..8] != STATE_TAG {
        return Err("bad state block tag".to_string());
    }
    if !cksum::check(&data[..STATE_LEN]) {
        return Err("state block checksum mismatch".to_string());
    }
    let schema_off = stor::get5(&data[8..]);
    let info_off = stor::get5(&data[13..]);
    if schema_off == 0 || info_off == 0 {
        return Ok(Meta::new());
    }
    Meta::read(store, schema_off, info_off)
}

/// Scan backwards for the newest valid state block. Used when the header
/// size disagrees with the file (the process died without shutting down).
pub fn find_state(store: &Arc<Stor>) -> Option<u64> {
    let end = store.size();
    if end < STATE_LEN as u64 {
        return None;
    }
    let mut off = (end - STATE_LEN as u64) / ALIGN * ALIGN;
    loop {
        let data = store.data(off);
        if data.len() >= STATE_LEN
            && &data[..8] == STATE_TAG
            && cksum::check(&data[..STATE_LEN])
            && read_state(store, off).is_ok()
        {
            return Some(off);
        }
        if off == 0 {
            return None;
        }
        off -= ALIGN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_round_trip() {
        let store = Arc::new(Stor::heap(1 << 16));
        let off = write_state(&store, &Meta::new());
        let meta = read_state(&store, off).unwrap();
        assert_eq!(meta.table_count(), 0);
    }

    #[test]
    fn find_state_locates_newest_valid_block() {
        let store = Arc::new(Stor::heap(1 << 16));
        let off1 = write_state(&store, &Meta::new());
        let off2 = write_state(&store, &Meta::new());
        assert!(off2 > off1);
        // trailing garbage simulates a torn write
        let (_, buf) = store.alloc(64);
        buf.fill(0xaa);
        assert_eq!(find_state(&store), Some(off2));
    }

    #[test]
    fn corrupted_state_block_is_skipped() {
        let store = Arc::new(Stor::heap(1 << 16));
        let off1 = write_state(&store, &Meta::new());
        let off2 = write_state(&store, &Meta::new());
        let flipped = store.data(off2)[9] ^ 0xff;
        store.write(off2 + 9, &[flipped]);
        assert_eq!(find_state(&store), Some(off1));
    }
}
