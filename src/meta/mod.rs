//! The table catalog.
//!
//! `Meta` is an immutable pair of tries — schemas and infos — plus views
//! and a derived foreign-key back-reference map. Every mutation returns a
//! new `Meta`; published states share structure. Commits replace only
//! infos (cheap); schema operations rebuild the back-reference map.

pub mod info;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hamt::{Hamt, HamtItem};
use crate::index::fbtree::Fbtree;
use crate::index::overlay::Overlay;
use crate::stor::Stor;

pub use info::{Info, InfoPersist, TreeRoot};
pub use schema::{Fkey, Index, IndexMode, Schema};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    pub def: String,
}

impl HamtItem for View {
    type Key = str;
    fn key(&self) -> &str {
        &self.name
    }
}

/// A reference from `table`'s index number `index` to some target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkRef {
    pub table: String,
    pub index: usize,
}

#[derive(Clone, Default)]
pub struct Meta {
    schema: Hamt<Arc<Schema>>,
    info: Hamt<Info>,
    views: Hamt<View>,
    /// target table -> indexes referencing it
    fk_refs: Arc<HashMap<String, Vec<FkRef>>>,
}

impl Meta {
    pub fn new() -> Meta {
        Meta::default()
    }

    pub fn get_schema(&self, table: &str) -> Option<&Arc<Schema>> {
        self.schema.get(table)
    }

    pub fn get_info(&self, table: &str) -> Option<&Info> {
        self.info.get(table)
    }

    pub fn table_count(&self) -> usize {
        self.schema.count()
    }

    pub fn for_each_schema(&self, f: impl FnMut(&Arc<Schema>)) {
        self.schema.for_each(f);
    }

    pub fn for_each_info(&self, f: impl FnMut(&Info)) {
        self.info.for_each(f);
    }

    pub fn fk_refs_to(&self, table: &str) -> &[FkRef] {
        self.fk_refs
            .get(table)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Add or replace a table.
    pub fn put(&self, schema: Arc<Schema>, info: Info) -> Meta {
        let mut sh = self.schema.mutable();
        sh.put(schema);
        let mut ih = self.info.mutable();
        ih.put(info);
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Meta {
            schema,
            info: ih.freeze(),
            views: self.views.clone(),
            fk_refs,
        }
    }

    /// Replace infos only (the commit path); schemas and back-references
    /// are shared with the previous state.
    pub fn put_infos(&self, infos: impl IntoIterator<Item = Info>) -> Meta {
        let mut ih = self.info.mutable();
        for info in infos {
            ih.put(info);
        }
        Meta {
            schema: self.schema.clone(),
            info: ih.freeze(),
            views: self.views.clone(),
            fk_refs: self.fk_refs.clone(),
        }
    }

    pub fn drop_table(&self, table: &str) -> Result<Meta, String> {
        if self.schema.get(table).is_none() {
            return Err(format!("nonexistent table: {table}"));
        }
        if !self.fk_refs_to(table).is_empty() {
            return Err(format!("can't drop {table}: foreign keys point to it"));
        }
        let mut sh = self.schema.mutable();
        sh.delete(table);
        let mut ih = self.info.mutable();
        ih.delete(table);
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Ok(Meta {
            schema,
            info: ih.freeze(),
            views: self.views.clone(),
            fk_refs,
        })
    }

    pub fn rename_table(&self, from: &str, to: &str) -> Result<Meta, String> {
        let old = self
            .schema
            .get(from)
            .ok_or_else(|| format!("nonexistent table: {from}"))?
            .clone();
        if self.schema.get(to).is_some() || self.views.get(to).is_some() {
            return Err(format!("existing table or view: {to}"));
        }
        if !self.fk_refs_to(from).is_empty() {
            return Err(format!("can't rename {from}: foreign keys point to it"));
        }
        let mut schema = (*old).clone();
        schema.table = to.to_string();
        let mut inf = self
            .info
            .get(from)
            .expect("info exists for every table")
            .clone();
        inf.table = to.to_string();
        let mut sh = self.schema.mutable();
        sh.delete(from);
        sh.put(Arc::new(schema));
        let mut ih = self.info.mutable();
        ih.delete(from);
        ih.put(inf);
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Ok(Meta {
            schema,
            info: ih.freeze(),
            views: self.views.clone(),
            fk_refs,
        })
    }

    /// Rename columns; index specs keep their positions.
    pub fn alter_rename(&self, table: &str, from: &[String], to: &[String]) -> Result<Meta, String> {
        let old = self
            .schema
            .get(table)
            .ok_or_else(|| format!("nonexistent table: {table}"))?;
        let mut schema = (**old).clone();
        for (f, t) in from.iter().zip(to) {
            let pos = schema
                .col_pos(f)
                .ok_or_else(|| format!("{table}: nonexistent column: {f}"))?;
            if schema.col_pos(t).is_some() {
                return Err(format!("{table}: existing column: {t}"));
            }
            schema.columns[pos] = t.clone();
            for ix in &mut schema.indexes {
                for c in &mut ix.columns {
                    if c == f {
                        *c = t.clone();
                    }
                }
            }
        }
        Ok(self.put_schema_only(Arc::new(schema)))
    }

    /// Add the columns and indexes of `delta` to an existing table.
    /// Returns the new meta and the added indexes (position + definition)
    /// so the caller can build them against existing data.
    pub fn alter_create(&self, delta: &Schema) -> Result<(Meta, Vec<(usize, Index)>), String> {
        let old = self
            .schema
            .get(&delta.table)
            .ok_or_else(|| format!("nonexistent table: {}", delta.table))?;
        let mut schema = (**old).clone();
        for col in &delta.columns {
            if schema.col_pos(col).is_some() {
                return Err(format!("{}: existing column: {col}", delta.table));
            }
            schema.columns.push(col.clone());
        }
        let mut added = Vec::new();
        for ix in &delta.indexes {
            if schema.find_index(&ix.columns).is_some() {
                return Err(format!(
                    "{}: existing index: ({})",
                    delta.table,
                    ix.columns.join(",")
                ));
            }
            let mut ix = ix.clone();
            ix.ixspec = schema.spec_for(&ix);
            schema.indexes.push(ix.clone());
            added.push((schema.indexes.len() - 1, ix));
        }
        schema.check()?;
        Ok((self.put_schema_only(Arc::new(schema)), added))
    }

    /// Drop columns (leaving positional placeholders) and indexes.
    pub fn alter_drop(&self, delta: &Schema) -> Result<Meta, String> {
        let old = self
            .schema
            .get(&delta.table)
            .ok_or_else(|| format!("nonexistent table: {}", delta.table))?;
        let mut schema = (**old).clone();
        let mut info = self
            .info
            .get(&delta.table)
            .expect("info exists for every table")
            .clone();
        for ix in &delta.indexes {
            let pos = schema
                .index_pos(&ix.columns)
                .ok_or_else(|| format!("{}: nonexistent index", delta.table))?;
            if pos == 0 {
                return Err(format!("{}: can't drop the key", delta.table));
            }
            schema.indexes.remove(pos);
            info.indexes.remove(pos);
        }
        for col in &delta.columns {
            let pos = schema
                .col_pos(col)
                .ok_or_else(|| format!("{}: nonexistent column: {col}", delta.table))?;
            if schema
                .indexes
                .iter()
                .any(|ix| ix.columns.iter().any(|c| c == col))
            {
                return Err(format!("{}: can't drop indexed column: {col}", delta.table));
            }
            schema.columns[pos] = String::new();
        }
        let mut sh = self.schema.mutable();
        sh.put(Arc::new(schema));
        let mut ih = self.info.mutable();
        ih.put(info);
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Ok(Meta {
            schema,
            info: ih.freeze(),
            views: self.views.clone(),
            fk_refs,
        })
    }

    /// Idempotent create-or-extend. Missing columns are appended; missing
    /// indexes are appended and returned for building. An existing index
    /// with the same columns but different attributes is an error.
    pub fn ensure(&self, delta: &Schema) -> Result<(Meta, Vec<(usize, Index)>), String> {
        let old = match self.schema.get(&delta.table) {
            None => return Err(format!("nonexistent table: {}", delta.table)),
            Some(s) => s,
        };
        let mut schema = (**old).clone();
        let mut changed = false;
        for col in &delta.columns {
            if schema.col_pos(col).is_none() {
                schema.columns.push(col.clone());
                changed = true;
            }
        }
        let mut added = Vec::new();
        for ix in &delta.indexes {
            match schema.find_index(&ix.columns) {
                Some(existing) => {
                    if !existing.same_as(ix) {
                        return Err(format!(
                            "ensure {}: index ({}) exists but is different",
                            delta.table,
                            ix.columns.join(",")
                        ));
                    }
                }
                None => {
                    let mut ix = ix.clone();
                    ix.ixspec = schema.spec_for(&ix);
                    schema.indexes.push(ix.clone());
                    added.push((schema.indexes.len() - 1, ix));
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok((self.clone(), added));
        }
        Ok((self.put_schema_only(Arc::new(schema)), added))
    }

    fn put_schema_only(&self, schema: Arc<Schema>) -> Meta {
        let mut sh = self.schema.mutable();
        sh.put(schema);
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Meta {
            schema,
            info: self.info.clone(),
            views: self.views.clone(),
            fk_refs,
        }
    }

    /// Validate the foreign keys declared by `schema` against this catalog.
    pub fn check_fkeys(&self, schema: &Schema) -> Result<(), String> {
        for ix in &schema.indexes {
            if let Some(fk) = &ix.fk {
                let target: &Schema = if fk.table == schema.table {
                    schema
                } else {
                    match self.schema.get(&fk.table) {
                        Some(s) => s.as_ref(),
                        None => {
                            return Err(format!(
                                "{}: foreign key target missing: {}",
                                schema.table, fk.table
                            ))
                        }
                    }
                };
                let tix = target.find_index(&fk.columns).ok_or_else(|| {
                    format!(
                        "{}: foreign key target {} has no index on ({})",
                        schema.table,
                        fk.table,
                        fk.columns.join(",")
                    )
                })?;
                if !tix.is_unique() {
                    return Err(format!(
                        "{}: foreign key target index on {}({}) is not unique",
                        schema.table,
                        fk.table,
                        fk.columns.join(",")
                    ));
                }
                if ix.columns.len() != fk.columns.len() {
                    return Err(format!(
                        "{}: foreign key column count mismatch",
                        schema.table
                    ));
                }
            }
        }
        Ok(())
    }

    // views -------------------------------------------------------------

    pub fn add_view(&self, name: &str, def: &str) -> Option<Meta> {
        if self.views.get(name).is_some() || self.schema.get(name).is_some() {
            return None;
        }
        let mut vh = self.views.mutable();
        vh.put(View {
            name: name.to_string(),
            def: def.to_string(),
        });
        Some(Meta {
            schema: self.schema.clone(),
            info: self.info.clone(),
            views: vh.freeze(),
            fk_refs: self.fk_refs.clone(),
        })
    }

    pub fn get_view(&self, name: &str) -> Option<String> {
        self.views.get(name).map(|v| v.def.clone())
    }

    pub fn drop_view(&self, name: &str) -> Option<Meta> {
        self.views.get(name)?;
        let mut vh = self.views.mutable();
        vh.delete(name);
        Some(Meta {
            schema: self.schema.clone(),
            info: self.info.clone(),
            views: vh.freeze(),
            fk_refs: self.fk_refs.clone(),
        })
    }

    // persistence -------------------------------------------------------

    /// Write the catalog; returns (schema block offset, info block offset).
    pub fn write(&self, store: &Stor) -> (u64, u64) {
        let mut schemas = Vec::new();
        self.schema.for_each(|s| schemas.push((**s).clone()));
        schemas.sort_by(|a, b| a.table.cmp(&b.table));
        let mut views = Vec::new();
        self.views.for_each(|v| views.push(v.clone()));
        views.sort_by(|a, b| a.name.cmp(&b.name));
        let blob = SchemaBlob { schemas, views };
        let schema_off = store.save_sized(&bincode::serialize(&blob).expect("serialize schemas"));

        let mut infos = Vec::new();
        self.info.for_each(|i| infos.push(InfoPersist::of(i)));
        infos.sort_by(|a, b| a.table.cmp(&b.table));
        let info_off = store.save_sized(&bincode::serialize(&infos).expect("serialize infos"));
        (schema_off, info_off)
    }

    /// Read a catalog written by [`Meta::write`], rebuilding each index
    /// overlay from its persisted tree roots.
    pub fn read(store: &Arc<Stor>, schema_off: u64, info_off: u64) -> Result<Meta, String> {
        let blob: SchemaBlob = bincode::deserialize(
            store
                .data_sized_ck(schema_off)
                .map_err(|e| e.to_string())?,
        )
        .map_err(|_| "schema block decode".to_string())?;
        let persisted: Vec<InfoPersist> = bincode::deserialize(
            store.data_sized_ck(info_off).map_err(|e| e.to_string())?,
        )
        .map_err(|_| "info block decode".to_string())?;

        let mut sh = Hamt::new().mutable();
        let mut by_name: HashMap<String, Arc<Schema>> = HashMap::new();
        for s in blob.schemas {
            let s = Arc::new(s);
            by_name.insert(s.table.clone(), s.clone());
            sh.put(s);
        }
        let mut ih = Hamt::new().mutable();
        for ip in persisted {
            let schema = by_name
                .get(&ip.table)
                .ok_or_else(|| format!("info without schema: {}", ip.table))?;
            if ip.roots.len() != schema.indexes.len() {
                return Err(format!("index count mismatch for {}", ip.table));
            }
            let mut indexes = Vec::with_capacity(ip.roots.len());
            for (i, root) in ip.roots.iter().enumerate() {
                let spec = Arc::new(schema.indexes[i].ixspec.clone());
                let fb = Fbtree::open(
                    store.clone(),
                    spec,
                    root.root,
                    root.tree_levels as usize,
                    root.redirs_off,
                )
                .map_err(|e| e.to_string())?;
                indexes.push(Overlay::for_tree(fb));
            }
            ih.put(Info {
                table: ip.table,
                nrows: ip.nrows,
                total_size: ip.total_size,
                indexes,
            });
        }
        let mut vh = Hamt::new().mutable();
        for v in blob.views {
            vh.put(v);
        }
        let schema = sh.freeze();
        let fk_refs = Arc::new(build_fk_refs(&schema));
        Ok(Meta {
            schema,
            info: ih.freeze(),
            views: vh.freeze(),
            fk_refs,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaBlob {
    schemas: Vec<Schema>,
    views: Vec<View>,
}

fn build_fk_refs(schemas: &Hamt<Arc<Schema>>) -> HashMap<String, Vec<FkRef>> {
    let mut map: HashMap<String, Vec<FkRef>> = HashMap::new();
    schemas.for_each(|s| {
        for (i, ix) in s.indexes.iter().enumerate() {
            if let Some(fk) = &ix.fk {
                map.entry(fk.table.clone()).or_default().push(FkRef {
                    table: s.table.clone(),
                    index: i,
                });
            }
        }
    });
    map
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meta")
            .field("tables", &self.schema.count())
            .field("views", &self.views.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> (Arc<Schema>, Info) {
        let mut s = Schema::new(name, &["a", "b"], vec![Index::key(&["a"])]);
        s.setup_indexes();
        let store = Arc::new(Stor::heap(1 << 16));
        let ov = Overlay::new(store, Arc::new(s.indexes[0].ixspec.clone()));
        (
            Arc::new(s),
            Info {
                table: name.to_string(),
                nrows: 0,
                total_size: 0,
                indexes: vec![ov],
            },
        )
    }

    #[test]
    fn put_get_drop_rename() {
        let meta = Meta::new();
        let (s, i) = table("t");
        let meta = meta.put(s, i);
        assert!(meta.get_schema("t").is_some());
        assert!(meta.get_info("t").is_some());

        let meta2 = meta.rename_table("t", "u").unwrap();
        assert!(meta2.get_schema("t").is_none());
        assert!(meta2.get_schema("u").is_some());
        assert_eq!(meta2.get_info("u").unwrap().table, "u");
        // the original is untouched
        assert!(meta.get_schema("t").is_some());

        let meta3 = meta2.drop_table("u").unwrap();
        assert!(meta3.get_schema("u").is_none());
        assert!(meta3.drop_table("u").is_err());
    }

    #[test]
    fn ensure_is_idempotent_and_flags_mismatch() {
        let meta = Meta::new();
        let (s, i) = table("t");
        let meta = meta.put(s, i);

        let mut same = Schema::new("t", &["a", "b"], vec![Index::key(&["a"])]);
        same.setup_indexes();
        let (meta2, added) = meta.ensure(&same).unwrap();
        assert!(added.is_empty());
        assert_eq!(meta2.get_schema("t").unwrap().columns.len(), 2);

        let extend = Schema::new("t", &["a", "b", "c"], vec![Index::index(&["b"])]);
        let (meta3, added) = meta2.ensure(&extend).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, 1);
        assert_eq!(meta3.get_schema("t").unwrap().columns.len(), 3);

        let clash = Schema::new("t", &["a"], vec![Index::unique(&["a"])]);
        assert!(meta3.ensure(&clash).is_err());
    }

    #[test]
    fn views() {
        let meta = Meta::new();
        let meta = meta.add_view("v", "t where a > 1").unwrap();
        assert_eq!(meta.get_view("v").unwrap(), "t where a > 1");
        assert!(meta.add_view("v", "other").is_none());
        let meta = meta.drop_view("v").unwrap();
        assert!(meta.get_view("v").is_none());
    }

    #[test]
    fn fkey_back_references() {
        let meta = Meta::new();
        let (hs, hi) = table("hdr");
        let meta = meta.put(hs, hi);

        let mut lines = Schema::new(
            "lines",
            &["ln", "hdr_a"],
            vec![
                Index::key(&["ln"]),
                Index::index(&["hdr_a"]).with_fk("hdr", &["a"]),
            ],
        );
        lines.setup_indexes();
        meta.check_fkeys(&lines).unwrap();
        let store = Arc::new(Stor::heap(1 << 16));
        let info = Info {
            table: "lines".to_string(),
            nrows: 0,
            total_size: 0,
            indexes: lines
                .indexes
                .iter()
                .map(|ix| Overlay::new(store.clone(), Arc::new(ix.ixspec.clone())))
                .collect(),
        };
        let meta = meta.put(Arc::new(lines), info);
        assert_eq!(
            meta.fk_refs_to("hdr"),
            &[FkRef {
                table: "lines".to_string(),
                index: 1
            }]
        );
        assert!(meta.drop_table("hdr").is_err());

        let bad = Schema::new("x", &["q"], vec![Index::key(&["q"]).with_fk("none", &["z"])]);
        assert!(meta.check_fkeys(&bad).is_err());
    }
}
