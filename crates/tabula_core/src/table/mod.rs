//! Table values: row tree, index set and schema bundled into one
//! content-addressed `TABL` message.
//!
//! ```text
//! "TABL" u16 version u16 reserved
//! [20] schema address
//! [20] row tree root
//! [20] index set root (address map: index name -> tree root)
//! u8 has auto-increment, u64 auto-increment value
//! ```

mod partition;

pub use partition::{partition_rows, Partition, PartitionIter};

use crate::config::PartitionConfig;
use crate::consts::{ADDR_LEN, FILE_ID_TABLE, TABLE_VERSION};
use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::message::MessageKind;
use crate::prolly::{Edits, MapIter, NodeStore, ProllyMap};
use crate::schema::{decode_schema, encode_schema, Index, Row, Schema};
use crate::tuple::Value;
use crate::utils::{read_u16, read_u64, write_u16, write_u64};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

const TABLE_MSG_LEN: usize = 8 + 3 * ADDR_LEN + 1 + 8;

#[derive(Clone, Debug)]
pub struct Table {
    schema: Arc<Schema>,
    rows: ProllyMap,
    indexes: ProllyMap,
    auto_increment: Option<u64>,
}

impl Table {
    /// Empty table with an empty tree for every secondary index.
    pub fn new(ctx: &Ctx, ns: &NodeStore, schema: Schema) -> Result<Table> {
        let mut edits = Edits::new();
        for idx in schema.indexes() {
            edits.insert(idx.name.as_bytes().to_vec(), Some(Address::EMPTY.as_bytes().to_vec()));
        }
        let indexes = ProllyMap::empty(ns, MessageKind::AddressMap).mutate(ctx, &edits)?;
        Ok(Table {
            schema: Arc::new(schema),
            rows: ProllyMap::empty(ns, MessageKind::ValueMap),
            indexes,
            auto_increment: None,
        })
    }

    pub fn load(ctx: &Ctx, ns: &NodeStore, addr: Address) -> Result<Table> {
        let chunk = ns.chunk_store().get(&addr)?.ok_or(TabulaError::ChunkNotFound(addr))?;
        if chunk.len() != TABLE_MSG_LEN || &chunk[..4] != FILE_ID_TABLE {
            return Err(TabulaError::BadHeader);
        }
        let mut r = Cursor::new(&chunk[4..]);
        if read_u16(&mut r)? != TABLE_VERSION {
            return Err(TabulaError::BadHeader);
        }
        let _reserved = read_u16(&mut r)?;
        let mut addr_buf = [0u8; ADDR_LEN];
        let mut next_addr = |r: &mut Cursor<&[u8]>| -> Result<Address> {
            r.read_exact(&mut addr_buf)?;
            Address::from_slice(&addr_buf)
        };
        let schema_addr = next_addr(&mut r)?;
        let rows_addr = next_addr(&mut r)?;
        let index_addr = next_addr(&mut r)?;
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let raw_auto = read_u64(&mut r)?;
        let auto_increment = match flag[0] {
            0 => None,
            1 => Some(raw_auto),
            b => return Err(TabulaError::Corrupt(format!("table {addr}: bad auto-increment flag {b}"))),
        };

        ctx.check()?;
        let schema_bytes = ns
            .chunk_store()
            .get(&schema_addr)?
            .ok_or(TabulaError::ChunkNotFound(schema_addr))?;
        let schema = decode_schema(&schema_bytes)?;
        Ok(Table {
            schema: Arc::new(schema),
            rows: ProllyMap::load(ctx, ns, MessageKind::ValueMap, rows_addr)?,
            indexes: ProllyMap::load(ctx, ns, MessageKind::AddressMap, index_addr)?,
            auto_increment,
        })
    }

    /// Persist the schema and table message; returns the table's address.
    pub fn write(&self, ctx: &Ctx) -> Result<Address> {
        ctx.check()?;
        let store = self.rows.node_store().chunk_store();
        let schema_addr = store.put(&encode_schema(&self.schema)?)?;
        let mut out = Vec::with_capacity(TABLE_MSG_LEN);
        out.extend_from_slice(FILE_ID_TABLE);
        write_u16(&mut out, TABLE_VERSION)?;
        write_u16(&mut out, 0)?;
        out.extend_from_slice(schema_addr.as_bytes());
        out.extend_from_slice(self.rows.address().as_bytes());
        out.extend_from_slice(self.indexes.address().as_bytes());
        out.push(self.auto_increment.is_some() as u8);
        write_u64(&mut out, self.auto_increment.unwrap_or(0))?;
        let addr = store.put(&out)?;
        debug!(table = %addr, rows = self.rows.count(), "table written");
        Ok(addr)
    }

    pub fn node_store(&self) -> &NodeStore { self.rows.node_store() }

    pub fn schema(&self) -> &Schema { &self.schema }

    pub fn row_data(&self) -> &ProllyMap { &self.rows }

    pub fn index_set(&self) -> &ProllyMap { &self.indexes }

    pub fn auto_increment_value(&self) -> Option<u64> { self.auto_increment }

    pub fn count(&self) -> u64 { self.rows.count() }

    /// Replace the schema only; row and index trees are untouched.
    pub fn update_schema(&self, schema: Schema) -> Table {
        Table { schema: Arc::new(schema), ..self.clone() }
    }

    pub fn with_rows(&self, rows: ProllyMap) -> Table { Table { rows, ..self.clone() } }

    pub fn with_auto_increment(&self, v: Option<u64>) -> Table {
        Table { auto_increment: v, ..self.clone() }
    }

    pub fn index_names(&self, ctx: &Ctx) -> Result<Vec<String>> {
        self.indexes
            .iter_all(ctx)?
            .map(|r| {
                let (k, _) = r?;
                String::from_utf8(k).map_err(|_| TabulaError::Corrupt("index name is not utf-8".into()))
            })
            .collect()
    }

    pub fn get_index(&self, ctx: &Ctx, name: &str) -> Result<ProllyMap> {
        let raw = self
            .indexes
            .get(ctx, name.as_bytes())?
            .ok_or_else(|| TabulaError::not_found("index", name))?;
        ProllyMap::load(ctx, self.node_store(), MessageKind::ValueMap, Address::from_slice(&raw)?)
    }

    pub fn put_index(&self, ctx: &Ctx, name: &str, tree: &ProllyMap) -> Result<Table> {
        let mut edits = Edits::new();
        edits.insert(name.as_bytes().to_vec(), Some(tree.address().as_bytes().to_vec()));
        Ok(Table { indexes: self.indexes.mutate(ctx, &edits)?, ..self.clone() })
    }

    pub fn delete_index(&self, ctx: &Ctx, name: &str) -> Result<Table> {
        if !self.indexes.has(ctx, name.as_bytes())? {
            return Err(TabulaError::not_found("index", name));
        }
        let mut edits = Edits::new();
        edits.insert(name.as_bytes().to_vec(), None);
        Ok(Table { indexes: self.indexes.mutate(ctx, &edits)?, ..self.clone() })
    }

    /// Move an index tree to a new name. The tree itself is not touched.
    pub fn rename_index(&self, ctx: &Ctx, from: &str, to: &str) -> Result<Table> {
        let raw = self
            .indexes
            .get(ctx, from.as_bytes())?
            .ok_or_else(|| TabulaError::not_found("index", from))?;
        if from != to && self.indexes.has(ctx, to.as_bytes())? {
            return Err(TabulaError::exists("index", to));
        }
        let mut edits = Edits::new();
        edits.insert(from.as_bytes().to_vec(), None);
        edits.insert(to.as_bytes().to_vec(), Some(raw));
        Ok(Table { indexes: self.indexes.mutate(ctx, &edits)?, ..self.clone() })
    }

    /// Empty every tree, keep the schema, forget the auto-increment value.
    /// Returns the new table and how many rows it dropped.
    pub fn truncate(&self, ctx: &Ctx) -> Result<(Table, u64)> {
        let ns = self.node_store();
        let fresh = Table::new(ctx, ns, (*self.schema).clone())?;
        Ok((fresh, self.count()))
    }

    pub fn get_row(&self, ctx: &Ctx, key: &[Value]) -> Result<Option<Row>> {
        let k = self.schema.encode_key(key)?;
        match self.rows.get(ctx, &k)? {
            Some(v) => Ok(Some(self.schema.row_from_kv(&k, &v)?)),
            None => Ok(None),
        }
    }

    pub fn scan(&self, ctx: &Ctx) -> Result<RowIter> {
        Ok(RowIter { schema: self.schema.clone(), inner: self.rows.iter_all(ctx)? })
    }

    pub fn partitions(&self, cfg: &PartitionConfig) -> Vec<Partition> { partition_rows(self.count(), cfg) }

    pub fn partition_iter(&self, cfg: &PartitionConfig) -> PartitionIter { PartitionIter::new(self.partitions(cfg)) }

    /// Rows of one partition, in key order.
    pub fn partition_rows(&self, ctx: &Ctx, part: &Partition) -> Result<RowIter> {
        Ok(RowIter {
            schema: self.schema.clone(),
            inner: self.rows.iter_ordinal_range(ctx, part.start(), part.end())?,
        })
    }

    /// Tree for one secondary index, built from the current rows. `table`
    /// names the table in constraint errors.
    pub fn build_index(&self, ctx: &Ctx, table: &str, index: &Index) -> Result<ProllyMap> {
        build_index_from(ctx, self.node_store(), &self.schema, index, table, self.scan(ctx)?)
    }

    /// Rebuild every secondary index tree of the schema.
    pub fn rebuild_indexes(&self, ctx: &Ctx, table: &str) -> Result<Table> {
        let mut t = Table::new(ctx, self.node_store(), (*self.schema).clone())?;
        t.rows = self.rows.clone();
        t.auto_increment = self.auto_increment;
        for idx in self.schema.indexes() {
            let tree = self.build_index(ctx, table, idx)?;
            t = t.put_index(ctx, &idx.name, &tree)?;
        }
        Ok(t)
    }

    /// Re-encode every row under `schema`. Columns are matched by tag; new
    /// columns take their default. All index trees are rebuilt.
    pub fn rewrite(&self, ctx: &Ctx, table: &str, schema: Schema) -> Result<Table> {
        let sources: Vec<Option<usize>> = schema
            .columns()
            .iter()
            .map(|c| self.schema.column_by_tag(c.tag).map(|(p, _)| p))
            .collect();
        let defaults: Vec<Value> = schema.columns().iter().map(|c| c.default_value()).collect::<Result<_>>()?;

        let mut rows = BTreeMap::new();
        for old in self.scan(ctx)? {
            let old = old?;
            let row: Row = sources
                .iter()
                .zip(&defaults)
                .map(|(src, d)| src.map_or_else(|| d.clone(), |p| old[p].clone()))
                .collect();
            schema.check_row(table, &row)?;
            let key = schema.key_tuple(&row);
            let value = schema.value_tuple(&row);
            if rows.insert(key, value).is_some() {
                return Err(TabulaError::DuplicateKey { table: table.to_string(), key: render_key(&schema, &row) });
            }
        }
        let ns = self.node_store();
        let new_rows = ProllyMap::from_sorted(ctx, ns, MessageKind::ValueMap, rows)?;
        let auto = if schema.auto_increment_position().is_some() { self.auto_increment } else { None };
        let t = Table::new(ctx, ns, schema)?.with_rows(new_rows).with_auto_increment(auto);
        debug!(table, rows = t.count(), "table rewritten");
        t.rebuild_indexes(ctx, table)
    }

    /// Visit every chunk the table references: its schema, then the row
    /// tree, the index set and each index tree.
    pub fn walk_addresses<F>(&self, ctx: &Ctx, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address) -> Result<()>,
    {
        visit(&Address::of(&encode_schema(&self.schema)?))?;
        self.rows.walk_addresses(ctx, &mut visit)?;
        self.indexes.walk_addresses(ctx, &mut visit)?;
        for name in self.index_names(ctx)? {
            self.get_index(ctx, &name)?.walk_addresses(ctx, &mut visit)?;
        }
        Ok(())
    }
}

/// Primary-key values of a row for error messages.
pub(crate) fn render_key(schema: &Schema, row: &[Value]) -> String {
    schema.pk_positions().iter().map(|&p| row[p as usize].to_string()).collect::<Vec<_>>().join(",")
}

/// Build an index tree from rows. Unique indexes reject two rows sharing the
/// declared column values (NULLs excepted).
pub(crate) fn build_index_from<I>(
    ctx: &Ctx,
    ns: &NodeStore,
    schema: &Schema,
    index: &Index,
    table: &str,
    rows: I,
) -> Result<ProllyMap>
where
    I: IntoIterator<Item = Result<Row>>,
{
    let mut keys = BTreeMap::new();
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        let row = row?;
        if index.unique {
            if let Some(prefix) = schema.unique_prefix(index, &row) {
                if !seen.insert(prefix) {
                    return Err(TabulaError::UniqueViolation {
                        table: table.to_string(),
                        index: index.name.clone(),
                        key: index.columns.iter().map(|&p| row[p as usize].to_string()).collect::<Vec<_>>().join(","),
                    });
                }
            }
        }
        keys.insert(schema.index_key(index, &row), Vec::new());
    }
    ProllyMap::from_sorted(ctx, ns, MessageKind::ValueMap, keys)
}

/// Decoded rows in key order.
pub struct RowIter {
    schema: Arc<Schema>,
    inner: MapIter,
}

impl Iterator for RowIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Result<Row>> {
        let (k, v) = match self.inner.next()? {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e)),
        };
        Some(self.schema.row_from_kv(&k, &v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::tuple::Encoding;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", 1, Encoding::Int).primary_key(),
            Column::new("name", 2, Encoding::Text),
        ])
        .unwrap()
        .add_secondary_index("by_name", &["name"], false)
        .unwrap()
    }

    fn with_rows(ctx: &Ctx, t: &Table, rows: &[(i64, &str)]) -> Table {
        let s = t.schema();
        let edits: Edits = rows
            .iter()
            .map(|(id, name)| {
                let row = vec![Value::Int(*id), Value::Text(name.to_string())];
                (s.key_tuple(&row), Some(s.value_tuple(&row)))
            })
            .collect();
        t.with_rows(t.row_data().mutate(ctx, &edits).unwrap())
    }

    #[test]
    fn write_and_load_roundtrip() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a"), (2, "b")])
            .with_auto_increment(Some(3));
        let t = t.rebuild_indexes(&ctx, "people").unwrap();
        let addr = t.write(&ctx).unwrap();

        let back = Table::load(&ctx, &ns, addr).unwrap();
        assert_eq!(back.schema(), t.schema());
        assert_eq!(back.count(), 2);
        assert_eq!(back.auto_increment_value(), Some(3));
        assert_eq!(back.row_data().address(), t.row_data().address());
        assert_eq!(back.get_index(&ctx, "by_name").unwrap().count(), 2);
        assert_eq!(back.write(&ctx).unwrap(), addr);
        assert_eq!(
            back.get_row(&ctx, &[Value::Int(2)]).unwrap(),
            Some(vec![Value::Int(2), Value::Text("b".into())])
        );
    }

    #[test]
    fn index_set_updates_are_pure() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a")])
            .rebuild_indexes(&ctx, "people")
            .unwrap();
        let tree = t.get_index(&ctx, "by_name").unwrap();

        let renamed = t.rename_index(&ctx, "by_name", "names").unwrap();
        assert_eq!(renamed.get_index(&ctx, "names").unwrap().address(), tree.address());
        assert!(renamed.get_index(&ctx, "by_name").unwrap_err().is_not_found());
        // the original value is untouched
        assert!(t.get_index(&ctx, "by_name").is_ok());

        let dropped = renamed.delete_index(&ctx, "names").unwrap();
        assert!(dropped.index_names(&ctx).unwrap().is_empty());
        assert!(dropped.delete_index(&ctx, "names").unwrap_err().is_not_found());
    }

    #[test]
    fn truncate_empties_everything_but_the_schema() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a"), (2, "b"), (3, "c")])
            .rebuild_indexes(&ctx, "people")
            .unwrap()
            .with_auto_increment(Some(4));
        let (empty, removed) = t.truncate(&ctx).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(empty.count(), 0);
        assert_eq!(empty.row_data().address(), Address::EMPTY);
        assert_eq!(empty.get_index(&ctx, "by_name").unwrap().address(), Address::EMPTY);
        assert_eq!(empty.auto_increment_value(), None);
        assert_eq!(empty.schema(), t.schema());
    }

    #[test]
    fn rewrite_matches_columns_by_tag() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a"), (2, "b")]);
        let s2 = t
            .schema()
            .add_column(Column::new("score", 3, Encoding::Int).with_default("10"), Some(1))
            .unwrap();
        let t2 = t.rewrite(&ctx, "people", s2).unwrap();
        let rows: Vec<Row> = t2.scan(&ctx).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows[0], vec![Value::Int(1), Value::Int(10), Value::Text("a".into())]);
        assert_eq!(t2.get_index(&ctx, "by_name").unwrap().count(), 2);
    }

    #[test]
    fn rewrite_to_a_new_key_detects_duplicates() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a"), (2, "a")]);
        let s2 = t.schema().drop_index("by_name").unwrap().with_primary_key(&["name"]).unwrap();
        assert!(matches!(t.rewrite(&ctx, "people", s2), Err(TabulaError::DuplicateKey { .. })));
    }

    #[test]
    fn unique_index_build_rejects_duplicates() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &[(1, "a"), (2, "a")]);
        let s = t.schema().add_secondary_index("u_name", &["name"], true).unwrap();
        let idx = s.index("u_name").unwrap().clone();
        let err = t.update_schema(s).build_index(&ctx, "people", &idx).unwrap_err();
        assert!(matches!(err, TabulaError::UniqueViolation { ref index, .. } if index == "u_name"));
    }

    #[test]
    fn partitions_cover_the_rows() {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let rows: Vec<(i64, String)> = (0..3000).map(|i| (i, format!("n{i}"))).collect();
        let refs: Vec<(i64, &str)> = rows.iter().map(|(i, s)| (*i, s.as_str())).collect();
        let t = with_rows(&ctx, &Table::new(&ctx, &ns, schema()).unwrap(), &refs);
        let cfg = PartitionConfig { workers: Some(2), ..PartitionConfig::default() };
        let it = t.partition_iter(&cfg);
        let mut seen = Vec::new();
        while let Some(p) = it.next_partition() {
            for r in t.partition_rows(&ctx, &p).unwrap() {
                seen.push(r.unwrap()[0].clone());
            }
        }
        assert_eq!(seen.len(), 3000);
        assert_eq!(seen[0], Value::Int(0));
        assert_eq!(seen[2999], Value::Int(2999));
    }
}
