//! Record encoding.
//!
//! A record is an immutable, self-describing tuple of raw byte fields:
//!
//! ```text
//! [mode:1][count:2 LE][ends:(count+1)*w LE][field bytes]
//! ```
//!
//! `mode` is the byte width `w` of the `ends` table (1, 2 or 4), chosen as
//! the smallest that can address the whole record. `ends[0]` is the header
//! length (where field data starts) and `ends[i+1]` is the end offset of
//! field `i`, so the final entry is the total record length and is
//! recoverable from a prefix of the buffer alone. The engine never
//! interprets field contents.

use bytes::Bytes;

const HEADER: usize = 3;

/// An owned record.
#[derive(Clone, PartialEq, Eq)]
pub struct Record(Bytes);

impl Record {
    pub fn from_bytes(bytes: Bytes) -> Record {
        Record(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes (never zero; the header is always present).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Number of fields.
    pub fn count(&self) -> usize {
        count_of(&self.0)
    }

    /// Raw bytes of field `i`; empty for fields past the end.
    pub fn field(&self, i: usize) -> &[u8] {
        field_at(&self.0, i)
    }

    /// Field `i` as a cheap slice of the record's buffer.
    pub fn field_bytes(&self, i: usize) -> Bytes {
        let (start, end) = field_span(&self.0, i);
        self.0.slice(start..end)
    }

    /// Read the record stored at `off` (copies out of the store).
    pub fn read(stor: &crate::stor::Stor, off: u64) -> Record {
        Record(Bytes::copy_from_slice(stor.data_sized(off)))
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut t = f.debug_tuple("Record");
        for i in 0..self.count() {
            t.field(&String::from_utf8_lossy(self.field(i)));
        }
        t.finish()
    }
}

fn width(buf: &[u8]) -> usize {
    buf[0] as usize
}

/// Number of fields in an encoded record.
pub fn count_of(buf: &[u8]) -> usize {
    u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize
}

fn end_entry(buf: &[u8], j: usize) -> usize {
    let w = width(buf);
    let at = HEADER + j * w;
    match w {
        1 => buf[at] as usize,
        2 => u16::from_le_bytes(buf[at..at + 2].try_into().unwrap()) as usize,
        4 => u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize,
        _ => unreachable!("bad record mode"),
    }
}

fn field_span(buf: &[u8], i: usize) -> (usize, usize) {
    if i >= count_of(buf) {
        return (0, 0);
    }
    (end_entry(buf, i), end_entry(buf, i + 1))
}

/// Raw bytes of field `i` of an encoded record.
pub fn field_at(buf: &[u8], i: usize) -> &[u8] {
    let (start, end) = field_span(buf, i);
    &buf[start..end]
}

/// Total length of the record starting at `buf`, readable from a prefix.
pub fn len_at(buf: &[u8]) -> usize {
    end_entry(buf, count_of(buf))
}

/// Builds records field by field.
#[derive(Default)]
pub struct RecordBuilder {
    fields: Vec<Bytes>,
}

impl RecordBuilder {
    pub fn new() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn add(&mut self, field: impl Into<Bytes>) -> &mut Self {
        self.fields.push(field.into());
        self
    }

    pub fn build(&self) -> Record {
        let count = self.fields.len();
        assert!(count <= u16::MAX as usize, "too many fields");
        let data: usize = self.fields.iter().map(|f| f.len()).sum();
        let w = [1usize, 2, 4]
            .into_iter()
            .find(|w| {
                let total = HEADER + (count + 1) * w + data;
                total <= match w {
                    1 => u8::MAX as usize,
                    2 => u16::MAX as usize,
                    _ => u32::MAX as usize,
                }
            })
            .expect("record too large");

        let header_len = HEADER + (count + 1) * w;
        let mut buf = Vec::with_capacity(header_len + data);
        buf.push(w as u8);
        buf.extend_from_slice(&(count as u16).to_le_bytes());
        let mut end = header_len;
        push_entry(&mut buf, w, end);
        for f in &self.fields {
            end += f.len();
            push_entry(&mut buf, w, end);
        }
        for f in &self.fields {
            buf.extend_from_slice(f);
        }
        Record(Bytes::from(buf))
    }
}

fn push_entry(buf: &mut Vec<u8>, w: usize, v: usize) {
    match w {
        1 => buf.push(v as u8),
        2 => buf.extend_from_slice(&(v as u16).to_le_bytes()),
        _ => buf.extend_from_slice(&(v as u32).to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(fields: &[&[u8]]) -> Record {
        let mut b = RecordBuilder::new();
        for f in fields {
            b.add(Bytes::copy_from_slice(f));
        }
        b.build()
    }

    #[test]
    fn build_and_read_back() {
        let r = rec(&[b"hello", b"", b"world"]);
        assert_eq!(r.count(), 3);
        assert_eq!(r.field(0), b"hello");
        assert_eq!(r.field(1), b"");
        assert_eq!(r.field(2), b"world");
        assert_eq!(r.field(3), b"");
        assert_eq!(len_at(r.as_bytes()), r.len());
    }

    #[test]
    fn empty_record() {
        let r = rec(&[]);
        assert_eq!(r.count(), 0);
        assert_eq!(len_at(r.as_bytes()), r.len());
    }

    #[test]
    fn widens_table_for_large_records() {
        let big = vec![0x61u8; 300];
        let r = rec(&[&big, b"x"]);
        assert_eq!(r.field(0), &big[..]);
        assert_eq!(r.field(1), b"x");
        assert_eq!(len_at(r.as_bytes()), r.len());

        let huge = vec![0x62u8; 70_000];
        let r = rec(&[&huge]);
        assert_eq!(r.field(0), &huge[..]);
        assert_eq!(len_at(r.as_bytes()), r.len());
    }

    #[test]
    fn store_round_trip() {
        let st = crate::stor::Stor::heap(1 << 16);
        let r = rec(&[b"a", b"bb", b"ccc"]);
        let off = st.save_sized(r.as_bytes());
        let back = Record::read(&st, off);
        assert_eq!(back, r);
    }
}
