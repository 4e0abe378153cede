//! Bidirectional merged index iterator.
//!
//! An `OverIter` walks one overlay — tree, committed layers, and the owning
//! transaction's mutable buffer — in key order, suppressing tombstoned
//! entries. It is position-based: every step re-derives from the current
//! key, so concurrent writes through the same transaction never leave it
//! dangling; `modified()` tells the caller the index changed under it since
//! the last seek or rewind (the usual cue to re-seek).

use bytes::Bytes;

use crate::index::ixbuf::undouble;
use crate::index::overlay::Overlay;
use crate::ixkey;

/// Half-open key range, inclusive low / exclusive high.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub org: Bytes,
    pub end: Bytes,
}

impl Default for Range {
    fn default() -> Self {
        Range {
            org: Bytes::from_static(ixkey::MIN),
            end: Bytes::from_static(ixkey::MAX),
        }
    }
}

#[derive(Debug)]
enum State {
    Rewound,
    Positioned { key: Bytes, d: u64, off: u64 },
    Eof,
}

#[derive(Debug)]
pub struct OverIter {
    overlay: Overlay,
    range: Range,
    state: State,
    mods_seen: u64,
}

impl OverIter {
    pub fn new(overlay: Overlay) -> OverIter {
        let mods_seen = overlay.mods();
        OverIter {
            overlay,
            range: Range::default(),
            state: State::Rewound,
            mods_seen,
        }
    }

    /// True at either end: an empty index, or a `next`/`prev` that ran off
    /// the range.
    pub fn eof(&self) -> bool {
        matches!(self.state, State::Eof)
    }

    /// True if the index was written through this iterator's transaction
    /// since the last seek or rewind.
    pub fn modified(&self) -> bool {
        self.overlay.mods() != self.mods_seen
    }

    /// The current key and record offset, valid after a successful `next`,
    /// `prev`, or `seek`.
    pub fn cur(&self) -> Option<(&[u8], u64)> {
        match &self.state {
            State::Positioned { key, off, .. } => Some((key.as_ref(), *off)),
            _ => None,
        }
    }

    /// Reset so `next` gives the first entry in range and `prev` the last.
    pub fn rewind(&mut self) {
        self.state = State::Rewound;
        self.mods_seen = self.overlay.mods();
    }

    /// Constrain the iterator to `range` and rewind.
    pub fn set_range(&mut self, range: Range) {
        self.range = range;
        self.rewind();
    }

    /// Advance to the first entry with key greater than the current one
    /// (or the first in range when rewound).
    pub fn next(&mut self) {
        let found = match &self.state {
            State::Eof => return,
            State::Rewound => self.overlay.next_at(Some((self.range.org.as_ref(), 0))),
            State::Positioned { key, d, .. } => {
                self.overlay.next_at(Some((key.as_ref(), d + 1)))
            }
        };
        self.state = self.clamp(found);
    }

    /// Move back to the last entry with key less than the current one (or
    /// the last in range when rewound).
    pub fn prev(&mut self) {
        let found = match &self.state {
            State::Eof => return,
            State::Rewound => self.overlay.prev_before(Some((self.range.end.as_ref(), 0))),
            State::Positioned { key, d, .. } => {
                self.overlay.prev_before(Some((key.as_ref(), *d)))
            }
        };
        self.state = self.clamp(found);
    }

    /// Position at the first entry with key `>=` the given key (clamped to
    /// the range). Resets `modified`.
    pub fn seek(&mut self, key: &[u8]) {
        self.mods_seen = self.overlay.mods();
        let target = if key < self.range.org.as_ref() {
            self.range.org.as_ref()
        } else {
            key
        };
        let found = self.overlay.next_at(Some((target, 0)));
        self.state = self.clamp(found);
    }

    fn clamp(&self, found: Option<(Bytes, u64)>) -> State {
        match found {
            None => State::Eof,
            Some((key, d)) => {
                if key.as_ref() < self.range.org.as_ref()
                    || key.as_ref() >= self.range.end.as_ref()
                {
                    State::Eof
                } else {
                    State::Positioned {
                        off: undouble(d),
                        key,
                        d,
                    }
                }
            }
        }
    }
}
