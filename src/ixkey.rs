//! Index key encoding.
//!
//! An index key is derived from a record by extracting the indexed fields
//! and packing them into a single byte string whose lexicographic order
//! matches field-by-field comparison of the record:
//!
//! - A single-field spec returns the raw field bytes, unescaped.
//! - Multi-field specs escape `\x00` as `\x00\x01` within each field, join
//!   fields with `\x00\x00`, and drop trailing empty fields so short keys
//!   stay short.
//!
//! A spec may carry uniquifier fields (`fields2`, typically the table's key
//! columns or a timestamp). They are appended — with the full multi-field
//! encoding — only when the primary fields encode to an empty key, so that
//! rows with empty index values do not collide while non-empty values keep
//! their compact single-field form.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::record::field_at;

/// Smallest possible key.
pub const MIN: &[u8] = b"";

/// Sentinel above any encoded key.
pub const MAX: &[u8] = &[0xff; 8];

const SEP: &[u8] = &[0, 0];
const ESCAPED_ZERO: &[u8] = &[0, 1];

/// How to extract an index key from a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IxSpec {
    /// Field numbers of the indexed columns, in index order.
    pub fields: Vec<usize>,
    /// Uniquifier fields, used only when `fields` encode to empty.
    pub fields2: Vec<usize>,
}

impl IxSpec {
    pub fn new(fields: Vec<usize>) -> IxSpec {
        IxSpec {
            fields,
            fields2: Vec::new(),
        }
    }

    pub fn with_uniquifier(fields: Vec<usize>, fields2: Vec<usize>) -> IxSpec {
        IxSpec { fields, fields2 }
    }

    /// Extract this spec's key from an encoded record.
    pub fn key(&self, rec: &[u8]) -> Bytes {
        let k = encode(rec, &self.fields);
        if k.is_empty() && !self.fields2.is_empty() {
            let mut all = self.fields.clone();
            all.extend_from_slice(&self.fields2);
            return encode(rec, &all);
        }
        k
    }

    /// A spec over only the first `n` primary fields (no uniquifier).
    /// Used to derive foreign-key lookup values.
    pub fn trunc(&self, n: usize) -> IxSpec {
        IxSpec::new(self.fields[..n.min(self.fields.len())].to_vec())
    }
}

/// Encode the key for `fields` of `rec`, treating the last field as a
/// uniquifier when `ts` is set.
pub fn key(rec: &[u8], fields: &[usize], ts: bool) -> Bytes {
    if ts && !fields.is_empty() {
        let n = fields.len() - 1;
        return IxSpec::with_uniquifier(fields[..n].to_vec(), fields[n..].to_vec()).key(rec);
    }
    encode(rec, fields)
}

fn encode(rec: &[u8], fields: &[usize]) -> Bytes {
    match fields {
        [] => Bytes::new(),
        [f] => Bytes::copy_from_slice(field_at(rec, *f)),
        _ => {
            let last = match fields.iter().rposition(|f| !field_at(rec, *f).is_empty()) {
                None => return Bytes::new(),
                Some(i) => i,
            };
            let mut out = Vec::new();
            for (i, f) in fields[..=last].iter().enumerate() {
                if i > 0 {
                    out.extend_from_slice(SEP);
                }
                escape_into(field_at(rec, *f), &mut out);
            }
            Bytes::from(out)
        }
    }
}

fn escape_into(field: &[u8], out: &mut Vec<u8>) {
    for &b in field {
        if b == 0 {
            out.extend_from_slice(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
}

/// Half-open key range `[prefix-keys-start, prefix-keys-end)` covering every
/// key whose leading fields encode to `prefix`: the bare prefix itself plus
/// any continuation (which always starts with the field separator).
pub fn prefix_range(prefix: &[u8]) -> (Bytes, Bytes) {
    let from = Bytes::copy_from_slice(prefix);
    let mut to = Vec::with_capacity(prefix.len() + 2);
    to.extend_from_slice(prefix);
    to.extend_from_slice(ESCAPED_ZERO);
    (from, Bytes::from(to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordBuilder};

    fn mkrec(fields: &[&[u8]]) -> Record {
        let mut b = RecordBuilder::new();
        for f in fields {
            b.add(Bytes::copy_from_slice(f));
        }
        b.build()
    }

    fn k(fields: &[&[u8]], spec: &[usize], ts: bool) -> Vec<u8> {
        key(mkrec(fields).as_bytes(), spec, ts).to_vec()
    }

    #[test]
    fn field_selection() {
        assert_eq!(k(&[b"a", b"b"], &[], false), b"");
        assert_eq!(k(&[b"a", b"b"], &[0], false), b"a");
        assert_eq!(k(&[b"a", b"b"], &[1], false), b"b");
        assert_eq!(k(&[b"a", b"b"], &[0, 1], false), b"a\x00\x00b");
        assert_eq!(k(&[b"a", b"b"], &[1, 0], false), b"b\x00\x00a");
    }

    #[test]
    fn trailing_empty_fields_are_omitted() {
        let f = &[0usize, 1, 2][..];
        assert_eq!(k(&[b"a", b"b", b"c"], f, false), b"a\x00\x00b\x00\x00c");
        assert_eq!(k(&[b"a", b"", b"c"], f, false), b"a\x00\x00\x00\x00c");
        assert_eq!(k(&[b"", b"", b"c"], f, false), b"\x00\x00\x00\x00c");
        assert_eq!(k(&[b"a", b"b", b""], f, false), b"a\x00\x00b");
        assert_eq!(k(&[b"a", b"", b""], f, false), b"a");
        assert_eq!(k(&[b"", b"", b""], f, false), b"");
    }

    #[test]
    fn single_field_is_not_escaped() {
        assert_eq!(k(&[b"a\x00b"], &[0], false), b"a\x00b");
    }

    #[test]
    fn multi_field_escaping() {
        let f = &[0usize, 1][..];
        assert_eq!(k(&[b"ab"], f, false), b"ab");
        assert_eq!(k(&[b"a\x00b"], f, false), b"a\x00\x01b");
        assert_eq!(k(&[b"\x00ab"], f, false), b"\x00\x01ab");
        assert_eq!(k(&[b"a\x00\x00b"], f, false), b"a\x00\x01\x00\x01b");
        assert_eq!(k(&[b"a\x00\x01b"], f, false), b"a\x00\x01\x01b");
        assert_eq!(k(&[b"ab\x00"], f, false), b"ab\x00\x01");
        assert_eq!(k(&[b"ab\x00\x00"], f, false), b"ab\x00\x01\x00\x01");
    }

    #[test]
    fn uniquifier_only_when_primary_empty() {
        assert_eq!(k(&[b"a", b"b"], &[0, 1], false), b"a\x00\x00b");
        assert_eq!(k(&[b"a", b"b"], &[0, 1], true), b"a");
        assert_eq!(k(&[b"", b"b"], &[0, 1], true), b"\x00\x00b");
    }

    #[test]
    fn prefix_range_covers_bare_and_continued() {
        let (from, to) = prefix_range(b"ab");
        assert!(from.as_ref() <= b"ab".as_ref() && b"ab".as_ref() < to.as_ref());
        let continued = b"ab\x00\x00x";
        assert!(from.as_ref() <= continued.as_ref() && continued.as_ref() < to.as_ref());
        let other = b"abc";
        assert!(!(from.as_ref() <= other.as_ref() && other.as_ref() < to.as_ref()));
    }
}
