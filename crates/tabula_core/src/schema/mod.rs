//! Table schemas.
//!
//! A schema is an ordered column list, one clustered index holding the rows,
//! any number of secondary indexes, and check constraints. Indexes refer to
//! columns by position, so every edit that moves columns rewrites those
//! positions. Edits never mutate a schema in place; each returns a new,
//! validated one.

mod check;
mod column;
mod index;
mod serial;

pub use check::{generate_check_name, Check};
pub use column::{generate_tag, Column, ColumnFlags};
pub use index::{Index, PRIMARY_INDEX};
pub use serial::{decode_schema, encode_schema};

use crate::consts::SYSTEM_PREFIX;
use crate::errors::{Result, TabulaError};
use crate::tuple::{self, Value};
use std::collections::HashSet;

/// One row, values in schema column order.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
    clustered: Index,
    indexes: Vec<Index>,
    checks: Vec<Check>,
}

fn invalid(msg: impl Into<String>) -> TabulaError { TabulaError::InvalidSchema(msg.into()) }

pub fn is_reserved(name: &str) -> bool {
    let p = SYSTEM_PREFIX.as_bytes();
    name.len() >= p.len() && name.as_bytes()[..p.len()].eq_ignore_ascii_case(p)
}

fn non_pk_positions(columns: &[Column]) -> Vec<u16> {
    (0..columns.len() as u16).filter(|&p| !columns[p as usize].is_primary_key()).collect()
}

impl Schema {
    /// Schema whose clustered index is keyed by the primary-key columns in
    /// column order.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let pk = (0..columns.len() as u16).filter(|&p| columns[p as usize].is_primary_key()).collect();
        let values = non_pk_positions(&columns);
        Self::from_parts(columns, Index::clustered(pk, values), Vec::new(), Vec::new())
    }

    pub fn from_parts(columns: Vec<Column>, clustered: Index, indexes: Vec<Index>, checks: Vec<Check>) -> Result<Self> {
        let s = Schema { columns, clustered, indexes, checks };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.columns.len();
        if n == 0 {
            return Err(invalid("schema has no columns"));
        }
        if n > u16::MAX as usize {
            return Err(invalid(format!("{n} columns exceed the limit")));
        }
        for idx in self.all_indexes() {
            for &p in idx.columns.iter().chain(&idx.key_columns).chain(&idx.value_columns) {
                if p as usize >= n {
                    return Err(invalid(format!(
                        "index {} references column position {p}, schema has {n} columns",
                        idx.name
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        let mut tags = HashSet::new();
        for c in &self.columns {
            if c.name.is_empty() {
                return Err(invalid("column with empty name"));
            }
            if !names.insert(c.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate column name {}", c.name)));
            }
            if !tags.insert(c.tag) {
                return Err(invalid(format!("duplicate tag {} on column {}", c.tag, c.name)));
            }
            if c.is_primary_key() && c.is_nullable() {
                return Err(invalid(format!("primary key column {} is nullable", c.name)));
            }
        }

        let pk: HashSet<u16> = (0..n as u16).filter(|&p| self.columns[p as usize].is_primary_key()).collect();
        if pk.is_empty() {
            return Err(invalid("schema has no primary key"));
        }
        let key: HashSet<u16> = self.clustered.key_columns.iter().copied().collect();
        if key != pk || key.len() != self.clustered.key_columns.len() {
            return Err(invalid("clustered index key must be exactly the primary key columns"));
        }
        let vals: HashSet<u16> = self.clustered.value_columns.iter().copied().collect();
        if vals.len() != self.clustered.value_columns.len()
            || vals.len() + pk.len() != n
            || !vals.is_disjoint(&pk)
        {
            return Err(invalid("clustered index must store every non-key column once"));
        }

        let mut index_names = HashSet::new();
        for idx in self.all_indexes() {
            if !index_names.insert(idx.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate index name {}", idx.name)));
            }
        }
        for idx in &self.indexes {
            if idx.columns.is_empty() || idx.key_columns.is_empty() {
                return Err(invalid(format!("index {} has no columns", idx.name)));
            }
        }

        let mut check_names = HashSet::new();
        for c in &self.checks {
            if c.name.is_empty() || !check_names.insert(c.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate or empty check name {:?}", c.name)));
            }
        }

        let auto: Vec<&Column> = self.columns.iter().filter(|c| c.is_auto_increment()).collect();
        match auto.as_slice() {
            [] => {}
            [c] if c.is_primary_key() && c.encoding.is_integer() => {}
            [c] => return Err(invalid(format!("auto_increment column {} must be an integer primary key", c.name))),
            _ => return Err(invalid("more than one auto_increment column")),
        }
        Ok(())
    }

    fn all_indexes(&self) -> impl Iterator<Item = &Index> {
        std::iter::once(&self.clustered).chain(self.indexes.iter())
    }

    pub fn columns(&self) -> &[Column] { &self.columns }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> { self.position(name).map(|p| &self.columns[p]) }

    pub fn column_by_tag(&self, tag: u64) -> Option<(usize, &Column)> {
        self.columns.iter().enumerate().find(|(_, c)| c.tag == tag)
    }

    pub fn tags(&self) -> HashSet<u64> { self.columns.iter().map(|c| c.tag).collect() }

    pub fn clustered(&self) -> &Index { &self.clustered }

    pub fn indexes(&self) -> &[Index] { &self.indexes }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn checks(&self) -> &[Check] { &self.checks }

    pub fn pk_positions(&self) -> &[u16] { &self.clustered.key_columns }

    pub fn auto_increment_position(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_auto_increment())
    }

    /// Tag for a column about to be added to `table`.
    pub fn generate_tag(&self, table: &str, column: &str, sql_type: &str) -> u64 {
        generate_tag(table, column, sql_type, &self.tags())
    }

    fn positions_of(&self, names: &[&str]) -> Result<Vec<u16>> {
        let mut out = Vec::with_capacity(names.len());
        for n in names {
            let p = self.position(n).ok_or_else(|| TabulaError::not_found("column", *n))? as u16;
            if out.contains(&p) {
                return Err(invalid(format!("column {n} listed twice")));
            }
            out.push(p);
        }
        Ok(out)
    }

    /// New schema over `columns`, with every index position passed through `map`.
    fn rearranged(&self, columns: Vec<Column>, map: impl Fn(u16) -> Option<u16>) -> Result<Schema> {
        let mut clustered = self.clustered.clone();
        clustered.remap(&map);
        clustered.value_columns = non_pk_positions(&columns);
        let mut indexes = self.indexes.clone();
        for idx in &mut indexes {
            idx.remap(&map);
        }
        Schema::from_parts(columns, clustered, indexes, self.checks.clone())
    }

    /// Insert a non-key column at `order` (default: last).
    pub fn add_column(&self, column: Column, order: Option<usize>) -> Result<Schema> {
        if self.position(&column.name).is_some() {
            return Err(TabulaError::exists("column", column.name));
        }
        if self.tags().contains(&column.tag) {
            return Err(invalid(format!("tag {} of column {} is already used", column.tag, column.name)));
        }
        if column.is_primary_key() {
            return Err(invalid(format!(
                "cannot add primary key column {}; change the key with with_primary_key",
                column.name
            )));
        }
        let at = order.unwrap_or(self.columns.len()).min(self.columns.len());
        let mut columns = self.columns.clone();
        columns.insert(at, column);
        let at = at as u16;
        self.rearranged(columns, |p| Some(if p >= at { p + 1 } else { p }))
    }

    /// Remove a column. Fails with `ColumnInUse` while any index still names it.
    pub fn drop_column(&self, name: &str) -> Result<Schema> {
        let at = self.position(name).ok_or_else(|| TabulaError::not_found("column", name))?;
        let col = &self.columns[at];
        if col.is_primary_key() {
            return Err(TabulaError::ColumnInUse { column: col.name.clone(), index: self.clustered.name.clone() });
        }
        if let Some(idx) = self.indexes.iter().find(|i| i.references(at as u16)) {
            return Err(TabulaError::ColumnInUse { column: col.name.clone(), index: idx.name.clone() });
        }
        let mut columns = self.columns.clone();
        columns.remove(at);
        let at = at as u16;
        self.rearranged(columns, |p| match p.cmp(&at) {
            std::cmp::Ordering::Less => Some(p),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(p - 1),
        })
    }

    /// Replace a column's definition and optionally move it. The tag is kept.
    pub fn modify_column(&self, name: &str, mut column: Column, order: Option<usize>) -> Result<Schema> {
        let from = self.position(name).ok_or_else(|| TabulaError::not_found("column", name))?;
        let old = &self.columns[from];
        if let Some(other) = self.position(&column.name) {
            if other != from {
                return Err(TabulaError::exists("column", column.name));
            }
        }
        if column.is_primary_key() != old.is_primary_key() {
            return Err(invalid(format!(
                "modify_column cannot change primary key membership of {}; use with_primary_key",
                old.name
            )));
        }
        column.tag = old.tag;
        let to = order.unwrap_or(from).min(self.columns.len() - 1);

        // new position -> old position
        let mut perm: Vec<u16> = (0..self.columns.len() as u16).collect();
        let moved = perm.remove(from);
        perm.insert(to, moved);
        let mut inverse = vec![0u16; perm.len()];
        for (new, &old) in perm.iter().enumerate() {
            inverse[old as usize] = new as u16;
        }

        let mut columns: Vec<Column> = perm.iter().map(|&p| self.columns[p as usize].clone()).collect();
        columns[to] = column;
        self.rearranged(columns, |p| inverse.get(p as usize).copied())
    }

    /// Rebuild the clustered index over new primary-key columns. Row data must
    /// then be rewritten with `Table::rewrite`.
    pub fn with_primary_key(&self, names: &[&str]) -> Result<Schema> {
        if names.is_empty() {
            return Err(invalid("primary key needs at least one column"));
        }
        let pk = self.positions_of(names)?;
        let mut columns = self.columns.clone();
        for (p, c) in columns.iter_mut().enumerate() {
            let key = pk.contains(&(p as u16));
            c.flags.set(ColumnFlags::PRIMARY_KEY, key);
            if key {
                c.flags.set(ColumnFlags::NULLABLE, false);
            }
        }
        let clustered = Index::clustered(pk.clone(), non_pk_positions(&columns));
        let indexes = self
            .indexes
            .iter()
            .map(|i| {
                let mut n = Index::secondary(i.name.clone(), i.columns.clone(), &pk, i.unique);
                n.system_defined = i.system_defined;
                n.comment = i.comment.clone();
                n
            })
            .collect();
        Schema::from_parts(columns, clustered, indexes, self.checks.clone())
    }

    /// Add an index built by the caller. Reserved names need `system_defined`.
    pub fn add_index(&self, index: Index) -> Result<Schema> {
        if is_reserved(&index.name) && !index.system_defined {
            return Err(TabulaError::ReservedName(index.name));
        }
        if index.name.eq_ignore_ascii_case(&self.clustered.name) || self.index(&index.name).is_some() {
            return Err(TabulaError::exists("index", index.name));
        }
        let mut indexes = self.indexes.clone();
        indexes.push(index);
        Schema::from_parts(self.columns.clone(), self.clustered.clone(), indexes, self.checks.clone())
    }

    pub fn add_secondary_index(&self, name: &str, columns: &[&str], unique: bool) -> Result<Schema> {
        let cols = self.positions_of(columns)?;
        self.add_index(Index::secondary(name, cols, self.pk_positions(), unique))
    }

    pub fn drop_index(&self, name: &str) -> Result<Schema> {
        let at = self
            .indexes
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| TabulaError::not_found("index", name))?;
        if self.indexes[at].system_defined || is_reserved(name) {
            return Err(TabulaError::ReservedName(name.to_string()));
        }
        let mut indexes = self.indexes.clone();
        indexes.remove(at);
        Schema::from_parts(self.columns.clone(), self.clustered.clone(), indexes, self.checks.clone())
    }

    pub fn rename_index(&self, from: &str, to: &str) -> Result<Schema> {
        if is_reserved(from) || is_reserved(to) {
            return Err(TabulaError::ReservedName(if is_reserved(from) { from } else { to }.to_string()));
        }
        let at = self
            .indexes
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(from))
            .ok_or_else(|| TabulaError::not_found("index", from))?;
        if !from.eq_ignore_ascii_case(to) && (self.index(to).is_some() || to.eq_ignore_ascii_case(&self.clustered.name)) {
            return Err(TabulaError::exists("index", to));
        }
        let mut indexes = self.indexes.clone();
        indexes[at].name = to.to_string();
        Schema::from_parts(self.columns.clone(), self.clustered.clone(), indexes, self.checks.clone())
    }

    /// Add a check; an absent name is generated from the expression.
    /// Returns the new schema and the check's name.
    pub fn add_check(&self, name: Option<&str>, expression: &str, enforced: bool) -> Result<(Schema, String)> {
        let taken = |n: &str| self.checks.iter().any(|c| c.name.eq_ignore_ascii_case(n));
        let name = match name {
            Some(n) if taken(n) => return Err(TabulaError::exists("check", n)),
            Some(n) => n.to_string(),
            None => generate_check_name(expression, taken),
        };
        let mut checks = self.checks.clone();
        checks.push(Check { name: name.clone(), expression: expression.to_string(), enforced });
        let s = Schema::from_parts(self.columns.clone(), self.clustered.clone(), self.indexes.clone(), checks)?;
        Ok((s, name))
    }

    pub fn drop_check(&self, name: &str) -> Result<Schema> {
        let at = self
            .checks
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| TabulaError::not_found("check", name))?;
        let mut checks = self.checks.clone();
        checks.remove(at);
        Schema::from_parts(self.columns.clone(), self.clustered.clone(), self.indexes.clone(), checks)
    }

    // ---- row encoding ----

    fn pick(row: &[Value], positions: &[u16]) -> Vec<Value> {
        positions.iter().map(|&p| row[p as usize].clone()).collect()
    }

    /// Clustered key of a row.
    pub fn key_tuple(&self, row: &[Value]) -> Vec<u8> { tuple::encode(&Self::pick(row, &self.clustered.key_columns)) }

    /// Clustered value of a row.
    pub fn value_tuple(&self, row: &[Value]) -> Vec<u8> {
        tuple::encode(&Self::pick(row, &self.clustered.value_columns))
    }

    /// Encode primary-key values given in key column order.
    pub fn encode_key(&self, key: &[Value]) -> Result<Vec<u8>> {
        if key.len() != self.clustered.key_columns.len() {
            return Err(TabulaError::InvalidInput(format!(
                "key has {} values, primary key has {} columns",
                key.len(),
                self.clustered.key_columns.len()
            )));
        }
        Ok(tuple::encode(key))
    }

    /// Reassemble a row from its stored clustered key and value.
    pub fn row_from_kv(&self, key: &[u8], value: &[u8]) -> Result<Row> {
        let k = tuple::decode(key)?;
        let v = tuple::decode(value)?;
        if k.len() != self.clustered.key_columns.len() || v.len() != self.clustered.value_columns.len() {
            return Err(TabulaError::Corrupt(format!(
                "stored row has {}+{} fields, schema expects {}+{}",
                k.len(),
                v.len(),
                self.clustered.key_columns.len(),
                self.clustered.value_columns.len()
            )));
        }
        let mut row = vec![Value::Null; self.columns.len()];
        for (p, val) in self.clustered.key_columns.iter().zip(k).chain(self.clustered.value_columns.iter().zip(v)) {
            row[*p as usize] = val;
        }
        Ok(row)
    }

    /// Stored key of `row` in a secondary index.
    pub fn index_key(&self, index: &Index, row: &[Value]) -> Vec<u8> {
        tuple::encode(&Self::pick(row, &index.key_columns))
    }

    /// Prefix shared by every entry with the same declared column values, or
    /// `None` when one of them is NULL (NULLs never collide in unique indexes).
    pub fn unique_prefix(&self, index: &Index, row: &[Value]) -> Option<Vec<u8>> {
        let vals = Self::pick(row, &index.columns);
        if vals.iter().any(Value::is_null) {
            return None;
        }
        Some(tuple::encode(&vals))
    }

    /// Arity, NOT NULL and type checks for a row about to be stored.
    pub fn check_row(&self, table: &str, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(TabulaError::InvalidInput(format!(
                "row for {table} has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (c, v) in self.columns.iter().zip(row) {
            if v.is_null() && !c.is_nullable() {
                return Err(TabulaError::NotNull { table: table.to_string(), column: c.name.clone() });
            }
            if !c.encoding.accepts(v) {
                return Err(TabulaError::TypeMismatch {
                    table: table.to_string(),
                    column: c.name.clone(),
                    expected: c.encoding.name().to_string(),
                    found: v.type_name().to_string(),
                });
            }
        }
        Ok(())
    }
}
