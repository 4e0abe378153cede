//! Table schemas.
//!
//! Columns are positional: record field `i` holds column `i`'s value, and
//! dropped columns leave an empty-named placeholder so later columns keep
//! their positions. The first index must be the table's key; other indexes
//! get uniquifier fields from it so every index entry's encoded key is
//! unique.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hamt::HamtItem;
use crate::ixkey::IxSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexMode {
    /// Unique, and the target of uniquifiers and foreign keys.
    Key,
    /// Unique on its own columns (empty values excepted).
    Unique,
    /// Non-unique.
    Index,
}

/// A foreign key: this index's columns reference the named table's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fkey {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub columns: Vec<String>,
    pub mode: IndexMode,
    pub fk: Option<Fkey>,
    /// Derived by [`Schema::setup_indexes`]; not part of index identity.
    #[serde(default)]
    pub ixspec: IxSpec,
}

impl Index {
    pub fn key(columns: &[&str]) -> Index {
        Index {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            mode: IndexMode::Key,
            fk: None,
            ixspec: IxSpec::default(),
        }
    }

    pub fn index(columns: &[&str]) -> Index {
        Index {
            mode: IndexMode::Index,
            ..Index::key(columns)
        }
    }

    pub fn unique(columns: &[&str]) -> Index {
        Index {
            mode: IndexMode::Unique,
            ..Index::key(columns)
        }
    }

    pub fn with_fk(mut self, table: &str, columns: &[&str]) -> Index {
        self.fk = Some(Fkey {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    /// Identity for ensure/alter comparisons: everything but the derived
    /// key spec.
    pub fn same_as(&self, other: &Index) -> bool {
        self.columns == other.columns && self.mode == other.mode && self.fk == other.fk
    }

    pub fn is_unique(&self) -> bool {
        matches!(self.mode, IndexMode::Key | IndexMode::Unique)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub table: String,
    pub columns: Vec<String>,
    /// Computed columns; stored in records but never indexed.
    pub derived: Vec<String>,
    pub indexes: Vec<Index>,
}

impl Schema {
    pub fn new(table: &str, columns: &[&str], indexes: Vec<Index>) -> Schema {
        Schema {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            derived: Vec::new(),
            indexes,
        }
    }

    pub fn check(&self) -> Result<(), String> {
        if self.table.is_empty() {
            return Err("table name cannot be empty".to_string());
        }
        if self.indexes.is_empty() {
            return Err(format!("{}: at least one index is required", self.table));
        }
        if self.indexes[0].mode != IndexMode::Key {
            return Err(format!("{}: the first index must be a key", self.table));
        }
        for ix in &self.indexes {
            for col in &ix.columns {
                if !self.columns.iter().any(|c| c == col) {
                    return Err(format!("{}: unknown index column {col}", self.table));
                }
            }
        }
        Ok(())
    }

    pub fn col_pos(&self, col: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == col)
    }

    /// Derive every index's key spec from column positions.
    pub fn setup_indexes(&mut self) {
        for i in 0..self.indexes.len() {
            self.indexes[i].ixspec = self.spec_for(&self.indexes[i].clone());
        }
    }

    /// The key spec for one index of this schema.
    pub fn spec_for(&self, ix: &Index) -> IxSpec {
        let fields: Vec<usize> = ix
            .columns
            .iter()
            .map(|c| self.col_pos(c).expect("index column exists"))
            .collect();
        let key0: Vec<usize> = self.indexes[0]
            .columns
            .iter()
            .map(|c| self.col_pos(c).expect("key column exists"))
            .filter(|f| !fields.contains(f))
            .collect();
        match ix.mode {
            IndexMode::Key => IxSpec::new(fields),
            IndexMode::Unique => IxSpec::with_uniquifier(fields, key0),
            IndexMode::Index => {
                let mut all = fields;
                all.extend(key0);
                IxSpec::new(all)
            }
        }
    }

    pub fn find_index(&self, columns: &[String]) -> Option<&Index> {
        self.indexes.iter().find(|ix| ix.columns == *columns)
    }

    pub fn index_pos(&self, columns: &[String]) -> Option<usize> {
        self.indexes.iter().position(|ix| ix.columns == *columns)
    }

    /// Human-readable form, e.g. `(a, b) key(a) index(b)`.
    pub fn to_display(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let cols: Vec<&str> = self
            .columns
            .iter()
            .map(|c| if c.is_empty() { "-" } else { c.as_str() })
            .collect();
        let _ = write!(s, "({})", cols.join(", "));
        for ix in &self.indexes {
            let kind = match ix.mode {
                IndexMode::Key => "key",
                IndexMode::Unique => "unique",
                IndexMode::Index => "index",
            };
            let _ = write!(s, " {kind}({})", ix.columns.join(", "));
            if let Some(fk) = &ix.fk {
                let _ = write!(s, " in {}({})", fk.table, fk.columns.join(", "));
            }
        }
        s
    }
}

impl HamtItem for Arc<Schema> {
    type Key = str;
    fn key(&self) -> &str {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        let mut s = Schema::new(
            "lines",
            &["order", "line", "item", "qty"],
            vec![
                Index::key(&["order", "line"]),
                Index::index(&["item"]),
                Index::unique(&["qty"]),
            ],
        );
        s.setup_indexes();
        s
    }

    #[test]
    fn specs_follow_column_positions() {
        let s = sample();
        assert_eq!(s.indexes[0].ixspec, IxSpec::new(vec![0, 1]));
        // non-unique index carries the key fields as uniquifier suffix
        assert_eq!(s.indexes[1].ixspec, IxSpec::new(vec![2, 0, 1]));
        // unique index appends them only when its own fields are empty
        assert_eq!(
            s.indexes[2].ixspec,
            IxSpec::with_uniquifier(vec![3], vec![0, 1])
        );
    }

    #[test]
    fn check_rejects_bad_schemas() {
        assert!(Schema::new("t", &["a"], vec![]).check().is_err());
        assert!(Schema::new("t", &["a"], vec![Index::index(&["a"])])
            .check()
            .is_err());
        assert!(Schema::new("t", &["a"], vec![Index::key(&["b"])])
            .check()
            .is_err());
        assert!(sample().check().is_ok());
    }

    #[test]
    fn display_form() {
        assert_eq!(
            sample().to_display(),
            "(order, line, item, qty) key(order, line) index(item) unique(qty)"
        );
    }
}
