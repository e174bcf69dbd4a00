//! Row editing: a buffered editor per table, the auto-increment tracker it
//! draws values from, and the write session that folds edited tables into a
//! new root value.

mod autoinc;
mod session;

pub use autoinc::AutoIncrementTracker;
pub use session::{BatchMode, Database, WriteMode, WriteSession};

use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::prolly::{check_sizes, Edits, ProllyMap};
use crate::schema::{Index, Row};
use crate::table::{render_key, Table};
use crate::tuple::{Encoding, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    /// Nothing buffered.
    Idle,
    /// Edits buffered, not yet applied to the trees.
    Editing,
    /// `commit` ran; every further call fails.
    Committed,
}

/// Buffers row edits against one table and applies them to the row tree and
/// every secondary index tree in one pass.
///
/// Reads go through the buffer, so an editor always sees its own writes.
#[derive(Debug)]
pub struct TableEditor {
    name: String,
    table: Table,
    trees: Vec<(Index, ProllyMap)>,
    rows: Edits,
    index_edits: Vec<Edits>,
    tracker: Arc<AutoIncrementTracker>,
    state: EditorState,
}

fn restore(edits: &mut Edits, key: Vec<u8>, saved: Option<Option<Vec<u8>>>) {
    match saved {
        Some(v) => {
            edits.insert(key, v);
        }
        None => {
            edits.remove(&key);
        }
    }
}

fn render_values(vals: &[Value]) -> String {
    vals.iter().map(Value::to_string).collect::<Vec<_>>().join(",")
}

impl TableEditor {
    pub fn new(ctx: &Ctx, name: &str, table: Table, tracker: Arc<AutoIncrementTracker>) -> Result<Self> {
        tracker.init(ctx, name, &table)?;
        let mut trees = Vec::with_capacity(table.schema().indexes().len());
        for idx in table.schema().indexes() {
            trees.push((idx.clone(), table.get_index(ctx, &idx.name)?));
        }
        let index_edits = vec![Edits::new(); trees.len()];
        Ok(TableEditor {
            name: name.to_string(),
            table,
            trees,
            rows: Edits::new(),
            index_edits,
            tracker,
            state: EditorState::Idle,
        })
    }

    pub fn name(&self) -> &str { &self.name }

    /// Table as of the last flush; buffered edits are not part of it.
    pub fn table(&self) -> &Table { &self.table }

    pub fn state(&self) -> EditorState { self.state }

    /// Buffered row edits.
    pub fn pending(&self) -> usize { self.rows.len() }

    fn ensure_open(&self) -> Result<()> {
        if self.state == EditorState::Committed {
            return Err(TabulaError::EditorClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Stored value for an encoded key, buffer first.
    fn stored(&self, ctx: &Ctx, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.rows.get(key) {
            Some(v) => Ok(v.clone()),
            None => self.table.row_data().get(ctx, key),
        }
    }

    fn fill_auto_increment(&self, row: &mut Row) -> Result<()> {
        let schema = self.table.schema();
        if row.len() != schema.columns().len() {
            return Err(TabulaError::InvalidInput(format!(
                "row for {} has {} values, table has {} columns",
                self.name,
                row.len(),
                schema.columns().len()
            )));
        }
        let Some(p) = schema.auto_increment_position() else {
            return Ok(());
        };
        match row[p].as_u64() {
            Some(v) if v > 0 => self.tracker.observe(&self.name, v),
            Some(_) => row[p] = self.next_auto(schema.columns()[p].encoding)?,
            None if row[p].is_null() => row[p] = self.next_auto(schema.columns()[p].encoding)?,
            None => {}
        }
        Ok(())
    }

    fn next_auto(&self, encoding: Encoding) -> Result<Value> {
        let v = self.tracker.next(&self.name)?;
        match encoding {
            Encoding::Uint => Ok(Value::Uint(v)),
            _ => i64::try_from(v)
                .map(Value::Int)
                .map_err(|_| TabulaError::InvalidInput(format!("auto-increment of {} overflowed", self.name))),
        }
    }

    /// Unique indexes reject a second row with the same declared values,
    /// whether stored or buffered. Rows with a NULL in those values never
    /// conflict.
    fn check_unique(&self, ctx: &Ctx, row: &[Value]) -> Result<()> {
        let schema = self.table.schema();
        for ((idx, tree), edits) in self.trees.iter().zip(&self.index_edits) {
            if !idx.unique {
                continue;
            }
            let Some(prefix) = schema.unique_prefix(idx, row) else {
                continue;
            };
            let mut hit = edits
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .any(|(_, v)| v.is_some());
            if !hit {
                for entry in tree.iter_range(ctx, Some(prefix.as_slice()), None)? {
                    let (k, _) = entry?;
                    if !k.starts_with(&prefix) {
                        break;
                    }
                    // deleted in the buffer
                    if !matches!(edits.get(&k), Some(None)) {
                        hit = true;
                        break;
                    }
                }
            }
            if hit {
                let vals: Vec<Value> = idx.columns.iter().map(|&p| row[p as usize].clone()).collect();
                return Err(TabulaError::UniqueViolation {
                    table: self.name.clone(),
                    index: idx.name.clone(),
                    key: render_values(&vals),
                });
            }
        }
        Ok(())
    }

    /// Buffer a new row. NULL or 0 in the auto-increment column takes the next
    /// value. Returns the row as it will be stored.
    pub fn insert(&mut self, ctx: &Ctx, mut row: Row) -> Result<Row> {
        self.ensure_open()?;
        self.fill_auto_increment(&mut row)?;
        let schema = self.table.schema();
        schema.check_row(&self.name, &row)?;
        let key = schema.key_tuple(&row);
        if self.stored(ctx, &key)?.is_some() {
            return Err(TabulaError::DuplicateKey { table: self.name.clone(), key: render_key(schema, &row) });
        }
        self.check_unique(ctx, &row)?;

        let value = schema.value_tuple(&row);
        let index_keys: Vec<Vec<u8>> = self.trees.iter().map(|(idx, _)| schema.index_key(idx, &row)).collect();
        // nothing is buffered for a row the trees would refuse
        check_sizes(&key, Some(value.as_slice()))?;
        for k in &index_keys {
            check_sizes(k, None)?;
        }
        self.rows.insert(key, Some(value));
        for (edits, k) in self.index_edits.iter_mut().zip(index_keys) {
            edits.insert(k, Some(Vec::new()));
        }
        self.state = EditorState::Editing;
        Ok(row)
    }

    fn remove(&mut self, ctx: &Ctx, key: Vec<u8>) -> Result<Option<Row>> {
        let Some(value) = self.stored(ctx, &key)? else {
            return Ok(None);
        };
        let schema = self.table.schema();
        let row = schema.row_from_kv(&key, &value)?;
        let index_keys: Vec<Vec<u8>> = self.trees.iter().map(|(idx, _)| schema.index_key(idx, &row)).collect();
        self.rows.insert(key, None);
        for (edits, k) in self.index_edits.iter_mut().zip(index_keys) {
            edits.insert(k, None);
        }
        self.state = EditorState::Editing;
        Ok(Some(row))
    }

    /// Buffer removal of the row with primary key `key`. Returns whether a
    /// row was there.
    pub fn delete(&mut self, ctx: &Ctx, key: &[Value]) -> Result<bool> {
        self.ensure_open()?;
        let k = self.table.schema().encode_key(key)?;
        Ok(self.remove(ctx, k)?.is_some())
    }

    /// Replace the row keyed by `key` with `row`, which may carry a different
    /// key. On failure the buffer is left as it was.
    pub fn update(&mut self, ctx: &Ctx, key: &[Value], row: Row) -> Result<Row> {
        self.ensure_open()?;
        let schema = self.table.schema();
        let k = schema.encode_key(key)?;
        let old = match self.stored(ctx, &k)? {
            Some(v) => schema.row_from_kv(&k, &v)?,
            None => return Err(TabulaError::not_found("row", format!("{}({})", self.name, render_values(key)))),
        };
        let old_index: Vec<Vec<u8>> = self.trees.iter().map(|(idx, _)| schema.index_key(idx, &old)).collect();
        let saved_row = self.rows.get(&k).cloned();
        let saved_index: Vec<Option<Option<Vec<u8>>>> =
            old_index.iter().zip(&self.index_edits).map(|(ik, e)| e.get(ik).cloned()).collect();
        let prev_state = self.state;

        self.remove(ctx, k.clone())?;
        match self.insert(ctx, row) {
            Ok(r) => Ok(r),
            Err(e) => {
                restore(&mut self.rows, k, saved_row);
                for ((ik, saved), edits) in old_index.into_iter().zip(saved_index).zip(&mut self.index_edits) {
                    restore(edits, ik, saved);
                }
                self.state = prev_state;
                Err(e)
            }
        }
    }

    pub fn get(&self, ctx: &Ctx, key: &[Value]) -> Result<Option<Row>> {
        self.ensure_open()?;
        let schema = self.table.schema();
        let k = schema.encode_key(key)?;
        match self.stored(ctx, &k)? {
            Some(v) => Ok(Some(schema.row_from_kv(&k, &v)?)),
            None => Ok(None),
        }
    }

    /// Apply the buffer to the trees and return the resulting table. The
    /// editor stays usable. When a tree write fails the buffer is kept and
    /// the flush can be retried.
    pub fn flush(&mut self, ctx: &Ctx) -> Result<Table> {
        self.ensure_open()?;
        let buffered = self.rows.len();
        let mut t = self.table.with_rows(self.table.row_data().mutate(ctx, &self.rows)?);
        let mut trees = Vec::with_capacity(self.trees.len());
        for ((idx, tree), edits) in self.trees.iter().zip(&self.index_edits) {
            if edits.is_empty() {
                trees.push(tree.clone());
                continue;
            }
            let next = tree.mutate(ctx, edits)?;
            t = t.put_index(ctx, &idx.name, &next)?;
            trees.push(next);
        }
        if t.schema().auto_increment_position().is_some() {
            t = t.with_auto_increment(self.tracker.current(&self.name));
        }
        for ((_, tree), next) in self.trees.iter_mut().zip(trees) {
            *tree = next;
        }
        self.index_edits.iter_mut().for_each(Edits::clear);
        self.rows.clear();
        self.table = t.clone();
        self.state = EditorState::Idle;
        debug!(table = %self.name, edits = buffered, rows = t.count(), "editor flushed");
        Ok(t)
    }

    /// Flush and close the editor.
    pub fn commit(&mut self, ctx: &Ctx) -> Result<Table> {
        let t = self.flush(ctx)?;
        self.close();
        Ok(t)
    }

    /// Close without writing; buffered edits are dropped.
    pub fn close(&mut self) {
        self.rows.clear();
        self.index_edits.iter_mut().for_each(Edits::clear);
        self.state = EditorState::Committed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prolly::NodeStore;
    use crate::schema::{Column, Schema};

    fn editor() -> (Ctx, TableEditor) {
        let ctx = Ctx::new();
        let ns = NodeStore::in_memory();
        let s = Schema::new(vec![
            Column::new("id", 1, Encoding::Int).primary_key().auto_increment(),
            Column::new("email", 2, Encoding::Text),
            Column::new("age", 3, Encoding::Int).not_null(),
        ])
        .unwrap()
        .add_secondary_index("by_email", &["email"], true)
        .unwrap();
        let t = Table::new(&ctx, &ns, s).unwrap();
        let ed = TableEditor::new(&ctx, "users", t, Arc::new(AutoIncrementTracker::new())).unwrap();
        (ctx, ed)
    }

    fn user(id: Value, email: Option<&str>, age: i64) -> Row {
        vec![id, email.map_or(Value::Null, |e| Value::Text(e.into())), Value::Int(age)]
    }

    #[test]
    fn auto_increment_fills_and_follows_explicit_values() {
        let (ctx, mut ed) = editor();
        assert_eq!(ed.state(), EditorState::Idle);
        let r = ed.insert(&ctx, user(Value::Null, Some("a@x"), 30)).unwrap();
        assert_eq!(r[0], Value::Int(1));
        ed.insert(&ctx, user(Value::Int(10), Some("b@x"), 31)).unwrap();
        let r = ed.insert(&ctx, user(Value::Int(0), Some("c@x"), 32)).unwrap();
        assert_eq!(r[0], Value::Int(11));
        assert_eq!(ed.state(), EditorState::Editing);

        let t = ed.commit(&ctx).unwrap();
        assert_eq!(t.count(), 3);
        assert_eq!(t.auto_increment_value(), Some(12));
        assert_eq!(t.get_index(&ctx, "by_email").unwrap().count(), 3);
    }

    #[test]
    fn constraint_errors() {
        let (ctx, mut ed) = editor();
        ed.insert(&ctx, user(Value::Int(1), Some("a@x"), 1)).unwrap();
        assert!(matches!(
            ed.insert(&ctx, user(Value::Int(1), Some("z@x"), 1)),
            Err(TabulaError::DuplicateKey { .. })
        ));
        assert!(matches!(
            ed.insert(&ctx, user(Value::Int(2), Some("a@x"), 1)),
            Err(TabulaError::UniqueViolation { ref index, .. }) if index == "by_email"
        ));
        assert!(matches!(
            ed.insert(&ctx, vec![Value::Int(3), Value::Null, Value::Null]),
            Err(TabulaError::NotNull { ref column, .. }) if column == "age"
        ));
        assert!(matches!(
            ed.insert(&ctx, vec![Value::Int(3), Value::Int(5), Value::Int(1)]),
            Err(TabulaError::TypeMismatch { .. })
        ));
        // NULLs never collide
        ed.insert(&ctx, user(Value::Int(4), None, 1)).unwrap();
        ed.insert(&ctx, user(Value::Int(5), None, 1)).unwrap();
        assert_eq!(ed.pending(), 3);
    }

    #[test]
    fn unique_check_sees_stored_rows_and_buffered_deletes() {
        let (ctx, mut ed) = editor();
        ed.insert(&ctx, user(Value::Int(1), Some("a@x"), 1)).unwrap();
        ed.flush(&ctx).unwrap();
        assert_eq!(ed.state(), EditorState::Idle);
        assert!(matches!(
            ed.insert(&ctx, user(Value::Int(2), Some("a@x"), 1)),
            Err(TabulaError::UniqueViolation { .. })
        ));
        assert!(ed.delete(&ctx, &[Value::Int(1)]).unwrap());
        ed.insert(&ctx, user(Value::Int(2), Some("a@x"), 1)).unwrap();
        let t = ed.flush(&ctx).unwrap();
        assert_eq!(t.count(), 1);
        assert!(t.get_row(&ctx, &[Value::Int(1)]).unwrap().is_none());
    }

    #[test]
    fn reads_go_through_the_buffer() {
        let (ctx, mut ed) = editor();
        ed.insert(&ctx, user(Value::Int(7), Some("q@x"), 9)).unwrap();
        assert_eq!(ed.get(&ctx, &[Value::Int(7)]).unwrap(), Some(user(Value::Int(7), Some("q@x"), 9)));
        assert!(ed.table().get_row(&ctx, &[Value::Int(7)]).unwrap().is_none());
        assert!(ed.delete(&ctx, &[Value::Int(7)]).unwrap());
        assert!(!ed.delete(&ctx, &[Value::Int(7)]).unwrap());
        assert_eq!(ed.get(&ctx, &[Value::Int(7)]).unwrap(), None);
    }

    #[test]
    fn update_moves_rows_and_rolls_back_on_failure() {
        let (ctx, mut ed) = editor();
        ed.insert(&ctx, user(Value::Int(1), Some("a@x"), 1)).unwrap();
        ed.insert(&ctx, user(Value::Int(2), Some("b@x"), 2)).unwrap();
        ed.flush(&ctx).unwrap();

        ed.update(&ctx, &[Value::Int(1)], user(Value::Int(3), Some("a@x"), 5)).unwrap();
        assert_eq!(ed.get(&ctx, &[Value::Int(1)]).unwrap(), None);

        let err = ed.update(&ctx, &[Value::Int(3)], user(Value::Int(3), Some("b@x"), 5)).unwrap_err();
        assert!(matches!(err, TabulaError::UniqueViolation { .. }));
        assert_eq!(ed.get(&ctx, &[Value::Int(3)]).unwrap(), Some(user(Value::Int(3), Some("a@x"), 5)));

        assert!(ed.update(&ctx, &[Value::Int(99)], user(Value::Int(99), None, 1)).unwrap_err().is_not_found());

        let t = ed.commit(&ctx).unwrap();
        let rows: Vec<Row> = t.scan(&ctx).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows, vec![user(Value::Int(2), Some("b@x"), 2), user(Value::Int(3), Some("a@x"), 5)]);
        assert_eq!(t.get_index(&ctx, "by_email").unwrap().count(), 2);
    }

    #[test]
    fn oversized_rows_are_refused_before_buffering() {
        let (ctx, mut ed) = editor();
        ed.insert(&ctx, user(Value::Int(1), Some("a@x"), 1)).unwrap();
        let huge = "x".repeat(30_000);
        let err = ed.insert(&ctx, user(Value::Int(2), Some(&huge), 1)).unwrap_err();
        assert!(matches!(err, TabulaError::InvalidInput(_)));
        assert_eq!(ed.pending(), 1);

        // a failed update leaves the old row buffered
        assert!(ed.update(&ctx, &[Value::Int(1)], user(Value::Int(1), Some(&huge), 1)).is_err());
        assert_eq!(ed.get(&ctx, &[Value::Int(1)]).unwrap(), Some(user(Value::Int(1), Some("a@x"), 1)));

        let t = ed.flush(&ctx).unwrap();
        assert_eq!(t.count(), 1);
        assert_eq!(t.get_index(&ctx, "by_email").unwrap().count(), 1);
    }

    #[test]
    fn committed_editor_is_closed() {
        let (ctx, mut ed) = editor();
        ed.commit(&ctx).unwrap();
        assert_eq!(ed.state(), EditorState::Committed);
        assert!(matches!(ed.insert(&ctx, user(Value::Null, None, 1)), Err(TabulaError::EditorClosed(_))));
        assert!(matches!(ed.get(&ctx, &[Value::Int(1)]), Err(TabulaError::EditorClosed(_))));
        assert!(matches!(ed.commit(&ctx), Err(TabulaError::EditorClosed(_))));
    }
}
