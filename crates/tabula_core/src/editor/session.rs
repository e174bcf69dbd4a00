use super::{AutoIncrementTracker, TableEditor};
use crate::chunks::ChunkStore;
use crate::config::EngineConfig;
use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::prolly::NodeStore;
use crate::root::RootValue;
use crate::schema::{is_reserved, Row, Schema};
use crate::table::{build_index_from, Table};
use crate::tuple::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A chunk store and the head root it carries.
#[derive(Debug, Clone)]
pub struct Database {
    ns: NodeStore,
}

impl Database {
    pub fn open(store: Arc<dyn ChunkStore>, config: &EngineConfig) -> Result<Self> {
        Ok(Database { ns: NodeStore::new(store, config)? })
    }

    pub fn in_memory() -> Self { Database { ns: NodeStore::in_memory() } }

    pub fn node_store(&self) -> &NodeStore { &self.ns }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> { self.ns.chunk_store() }

    pub fn head(&self) -> Result<Address> { self.chunk_store().root() }

    /// Root value the head points at.
    pub fn root(&self, ctx: &Ctx) -> Result<RootValue> { RootValue::load(ctx, &self.ns, self.head()?) }

    pub fn begin(&self, ctx: &Ctx, write: WriteMode, batch: BatchMode) -> Result<WriteSession> {
        let base = self.head()?;
        let pending = RootValue::load(ctx, &self.ns, base)?;
        debug!(base = %base, ?write, ?batch, "session started");
        Ok(WriteSession {
            base,
            pending,
            write,
            batch,
            tracker: Arc::new(AutoIncrementTracker::new()),
            editors: BTreeMap::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Commit fails if the head moved since the session began.
    Linear,
    /// Commit installs the session's root whatever the head is.
    LastWriterWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Every statement is flushed into the pending root right away.
    Unbatched,
    /// Editors keep buffering until `flush` or `commit`.
    Batched,
}

/// Builds a new root value from a base one, then installs it as the head.
#[derive(Debug)]
pub struct WriteSession {
    base: Address,
    pending: RootValue,
    write: WriteMode,
    batch: BatchMode,
    tracker: Arc<AutoIncrementTracker>,
    editors: BTreeMap<String, TableEditor>,
}

fn not_system(name: &str) -> Result<()> {
    if is_reserved(name) {
        return Err(TabulaError::ReservedName(name.to_string()));
    }
    Ok(())
}

impl WriteSession {
    /// Head address when the session began.
    pub fn base(&self) -> Address { self.base }

    /// Root value including every flushed edit.
    pub fn root(&self) -> &RootValue { &self.pending }

    pub fn write_mode(&self) -> WriteMode { self.write }

    pub fn batch_mode(&self) -> BatchMode { self.batch }

    pub fn auto_increment(&self) -> &Arc<AutoIncrementTracker> { &self.tracker }

    /// Table from the pending root. Edits still buffered in a batched editor
    /// are not visible here.
    pub fn table(&self, ctx: &Ctx, name: &str) -> Result<Table> {
        self.pending.get_table(ctx, name)?.ok_or_else(|| TabulaError::not_found("table", name))
    }

    pub fn table_names(&self, ctx: &Ctx) -> Result<Vec<String>> { self.pending.table_names(ctx) }

    /// Editor for `name`, created on first use.
    pub fn editor(&mut self, ctx: &Ctx, name: &str) -> Result<&mut TableEditor> {
        if !self.editors.contains_key(name) {
            let table = self.table(ctx, name)?;
            let ed = TableEditor::new(ctx, name, table, self.tracker.clone())?;
            self.editors.insert(name.to_string(), ed);
        }
        self.editors.get_mut(name).ok_or_else(|| TabulaError::not_found("table", name))
    }

    /// Flush one table's editor into the pending root and drop it. On error
    /// the editor stays, with whatever it had not yet written.
    fn flush_table(&mut self, ctx: &Ctx, name: &str) -> Result<()> {
        let Some(ed) = self.editors.get_mut(name) else {
            return Ok(());
        };
        let t = ed.flush(ctx)?;
        self.pending = self.pending.put_table(ctx, name, &t)?;
        if let Some(mut ed) = self.editors.remove(name) {
            ed.close();
        }
        Ok(())
    }

    fn statement_done(&mut self, ctx: &Ctx, name: &str) -> Result<()> {
        match self.batch {
            BatchMode::Unbatched => self.flush_table(ctx, name),
            BatchMode::Batched => Ok(()),
        }
    }

    pub fn insert(&mut self, ctx: &Ctx, table: &str, row: Row) -> Result<Row> {
        let row = self.editor(ctx, table)?.insert(ctx, row)?;
        self.statement_done(ctx, table)?;
        Ok(row)
    }

    pub fn delete(&mut self, ctx: &Ctx, table: &str, key: &[Value]) -> Result<bool> {
        let removed = self.editor(ctx, table)?.delete(ctx, key)?;
        self.statement_done(ctx, table)?;
        Ok(removed)
    }

    pub fn update(&mut self, ctx: &Ctx, table: &str, key: &[Value], row: Row) -> Result<Row> {
        let row = self.editor(ctx, table)?.update(ctx, key, row)?;
        self.statement_done(ctx, table)?;
        Ok(row)
    }

    /// Row lookup that sees buffered edits.
    pub fn get(&mut self, ctx: &Ctx, table: &str, key: &[Value]) -> Result<Option<Row>> {
        self.editor(ctx, table)?.get(ctx, key)
    }

    /// Apply every buffered edit to the pending root.
    pub fn flush(&mut self, ctx: &Ctx) -> Result<()> {
        let names: Vec<String> = self.editors.keys().cloned().collect();
        for name in names {
            self.flush_table(ctx, &name)?;
        }
        Ok(())
    }

    // ---- DDL ----

    pub fn create_table(&mut self, ctx: &Ctx, name: &str, schema: Schema) -> Result<()> {
        not_system(name)?;
        if self.pending.has_table(ctx, name)? {
            return Err(TabulaError::exists("table", name));
        }
        let t = Table::new(ctx, self.pending.node_store(), schema)?;
        self.pending = self.pending.put_table(ctx, name, &t)?;
        info!(table = name, "table created");
        Ok(())
    }

    pub fn drop_table(&mut self, ctx: &Ctx, name: &str) -> Result<()> {
        not_system(name)?;
        self.pending = self.pending.remove_table(ctx, name)?;
        self.editors.remove(name);
        self.tracker.forget(name);
        info!(table = name, "table dropped");
        Ok(())
    }

    /// Empty a table; returns how many rows it held.
    pub fn truncate_table(&mut self, ctx: &Ctx, name: &str) -> Result<u64> {
        self.flush_table(ctx, name)?;
        let (t, removed) = self.table(ctx, name)?.truncate(ctx)?;
        self.pending = self.pending.put_table(ctx, name, &t)?;
        self.tracker.forget(name);
        info!(table = name, removed, "table truncated");
        Ok(removed)
    }

    /// Replace a table's schema, re-encoding its rows.
    pub fn alter_table<F>(&mut self, ctx: &Ctx, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&Schema) -> Result<Schema>,
    {
        self.flush_table(ctx, name)?;
        let t = self.table(ctx, name)?;
        let schema = edit(t.schema())?;
        let t = t.rewrite(ctx, name, schema)?;
        self.pending = self.pending.put_table(ctx, name, &t)?;
        Ok(())
    }

    /// Add a secondary index and build it from the table's rows.
    pub fn create_index(&mut self, ctx: &Ctx, table: &str, index: &str, columns: &[&str], unique: bool) -> Result<()> {
        self.flush_table(ctx, table)?;
        let t = self.table(ctx, table)?;
        let schema = t.schema().add_secondary_index(index, columns, unique)?;
        let def = schema.index(index).cloned().ok_or_else(|| TabulaError::not_found("index", index))?;
        let tree = build_index_from(ctx, t.node_store(), &schema, &def, table, t.scan(ctx)?)?;
        let t = t.update_schema(schema).put_index(ctx, index, &tree)?;
        self.pending = self.pending.put_table(ctx, table, &t)?;
        info!(table, index, rows = tree.count(), "index created");
        Ok(())
    }

    pub fn drop_index(&mut self, ctx: &Ctx, table: &str, index: &str) -> Result<()> {
        self.flush_table(ctx, table)?;
        let t = self.table(ctx, table)?;
        let schema = t.schema().drop_index(index)?;
        let t = t.update_schema(schema).delete_index(ctx, index)?;
        self.pending = self.pending.put_table(ctx, table, &t)?;
        Ok(())
    }

    pub fn rename_index(&mut self, ctx: &Ctx, table: &str, from: &str, to: &str) -> Result<()> {
        self.flush_table(ctx, table)?;
        let t = self.table(ctx, table)?;
        let schema = t.schema().rename_index(from, to)?;
        let t = t.update_schema(schema).rename_index(ctx, from, to)?;
        self.pending = self.pending.put_table(ctx, table, &t)?;
        Ok(())
    }

    /// Add a check constraint; returns its name.
    pub fn add_check(
        &mut self,
        ctx: &Ctx,
        table: &str,
        name: Option<&str>,
        expression: &str,
        enforced: bool,
    ) -> Result<String> {
        self.flush_table(ctx, table)?;
        let t = self.table(ctx, table)?;
        let (schema, name) = t.schema().add_check(name, expression, enforced)?;
        self.pending = self.pending.put_table(ctx, table, &t.update_schema(schema))?;
        Ok(name)
    }

    pub fn drop_check(&mut self, ctx: &Ctx, table: &str, name: &str) -> Result<()> {
        self.flush_table(ctx, table)?;
        let t = self.table(ctx, table)?;
        let schema = t.schema().drop_check(name)?;
        self.pending = self.pending.put_table(ctx, table, &t.update_schema(schema))?;
        Ok(())
    }

    /// Flush, make every chunk durable and move the head to the pending root.
    /// A linear session fails with `Conflict` when another writer moved the
    /// head first; the head is then left as that writer set it.
    pub fn commit(mut self, ctx: &Ctx, db: &Database) -> Result<Address> {
        self.flush(ctx)?;
        let new = self.pending.address();
        let store = db.chunk_store();
        store.flush()?;
        match self.write {
            WriteMode::Linear => {
                if !store.set_root(self.base, new)? {
                    let found = store.root()?;
                    warn!(expected = %self.base, found = %found, "commit conflict");
                    return Err(TabulaError::Conflict { expected: self.base, found });
                }
            }
            WriteMode::LastWriterWins => loop {
                ctx.check()?;
                let cur = store.root()?;
                if store.set_root(cur, new)? {
                    break;
                }
            },
        }
        info!(base = %self.base, head = %new, "session committed");
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::{Chunk, MemoryChunkStore};
    use crate::schema::Column;
    use crate::tuple::Encoding;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Memory store that can refuse puts and can have another writer move
    /// the head just before a compare-and-set.
    #[derive(Debug, Default)]
    struct Interfering {
        inner: MemoryChunkStore,
        refuse_puts: AtomicBool,
        race_to: Mutex<Option<Address>>,
        set_root_calls: AtomicUsize,
        flushes: AtomicUsize,
    }

    impl ChunkStore for Interfering {
        fn get(&self, addr: &Address) -> Result<Option<Chunk>> { self.inner.get(addr) }

        fn put(&self, bytes: &[u8]) -> Result<Address> {
            if self.refuse_puts.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.put(bytes)
        }

        fn root(&self) -> Result<Address> { self.inner.root() }

        fn set_root(&self, expected: Address, new: Address) -> Result<bool> {
            self.set_root_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(other) = self.race_to.lock().unwrap().take() {
                let cur = self.inner.root()?;
                self.inner.set_root(cur, other)?;
            }
            self.inner.set_root(expected, new)
        }

        fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn people() -> Schema {
        Schema::new(vec![
            Column::new("id", 1, Encoding::Int).primary_key().auto_increment(),
            Column::new("name", 2, Encoding::Text),
        ])
        .unwrap()
    }

    fn row(id: i64, name: &str) -> Row { vec![Value::Int(id), Value::Text(name.into())] }

    #[test]
    fn unbatched_statements_land_in_the_pending_root() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        s.insert(&ctx, "people", row(0, "ann")).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().count(), 1);
        let head = s.commit(&ctx, &db).unwrap();
        assert_eq!(db.head().unwrap(), head);
        assert_eq!(db.root(&ctx).unwrap().get_table(&ctx, "people").unwrap().unwrap().count(), 1);
    }

    #[test]
    fn batched_statements_wait_for_flush() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Batched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        s.insert(&ctx, "people", row(0, "ann")).unwrap();
        s.insert(&ctx, "people", row(0, "bob")).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().count(), 0);
        assert_eq!(s.get(&ctx, "people", &[Value::Int(2)]).unwrap(), Some(row(2, "bob")));
        s.flush(&ctx).unwrap();
        let t = s.table(&ctx, "people").unwrap();
        assert_eq!(t.count(), 2);
        assert_eq!(t.auto_increment_value(), Some(3));
    }

    #[test]
    fn linear_commit_detects_a_moved_head() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut a = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched).unwrap();
        let mut b = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched).unwrap();
        a.create_table(&ctx, "a", people()).unwrap();
        b.create_table(&ctx, "b", people()).unwrap();
        let head = a.commit(&ctx, &db).unwrap();
        match b.commit(&ctx, &db) {
            Err(TabulaError::Conflict { expected, found }) => {
                assert_eq!(expected, Address::EMPTY);
                assert_eq!(found, head);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(db.head().unwrap(), head);
    }

    #[test]
    fn last_writer_wins_overrides() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut a = db.begin(&ctx, WriteMode::Linear, BatchMode::Unbatched).unwrap();
        let mut b = db.begin(&ctx, WriteMode::LastWriterWins, BatchMode::Unbatched).unwrap();
        a.create_table(&ctx, "a", people()).unwrap();
        b.create_table(&ctx, "b", people()).unwrap();
        a.commit(&ctx, &db).unwrap();
        let head = b.commit(&ctx, &db).unwrap();
        assert_eq!(db.head().unwrap(), head);
        assert_eq!(db.root(&ctx).unwrap().table_names(&ctx).unwrap(), vec!["b"]);
    }

    #[test]
    fn ddl_helpers() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Batched).unwrap();
        assert!(matches!(s.create_table(&ctx, "Tabula_x", people()), Err(TabulaError::ReservedName(_))));
        s.create_table(&ctx, "people", people()).unwrap();
        assert!(matches!(s.create_table(&ctx, "people", people()), Err(TabulaError::AlreadyExists { .. })));
        s.insert(&ctx, "people", row(0, "ann")).unwrap();
        s.insert(&ctx, "people", row(0, "ann")).unwrap();

        // the buffered rows are flushed before the index is built
        assert!(matches!(
            s.create_index(&ctx, "people", "u_name", &["name"], true),
            Err(TabulaError::UniqueViolation { .. })
        ));
        s.create_index(&ctx, "people", "by_name", &["name"], false).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().get_index(&ctx, "by_name").unwrap().count(), 2);
        s.rename_index(&ctx, "people", "by_name", "names").unwrap();
        let t = s.table(&ctx, "people").unwrap();
        assert!(t.schema().index("names").is_some());
        assert_eq!(t.index_names(&ctx).unwrap(), vec!["names"]);
        s.drop_index(&ctx, "people", "names").unwrap();
        assert!(s.table(&ctx, "people").unwrap().index_names(&ctx).unwrap().is_empty());

        let chk = s.add_check(&ctx, "people", None, "id > 0", true).unwrap();
        assert!(chk.starts_with("chk_"));
        s.drop_check(&ctx, "people", &chk).unwrap();

        s.alter_table(&ctx, "people", |sc| sc.add_column(Column::new("age", 3, Encoding::Int), None)).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().scan(&ctx).unwrap().count(), 2);

        assert_eq!(s.truncate_table(&ctx, "people").unwrap(), 2);
        s.insert(&ctx, "people", vec![Value::Null, Value::Text("cy".into()), Value::Null]).unwrap();
        assert_eq!(s.get(&ctx, "people", &[Value::Int(1)]).unwrap().map(|r| r[1].clone()), Some(Value::Text("cy".into())));

        s.drop_table(&ctx, "people").unwrap();
        assert!(s.table(&ctx, "people").unwrap_err().is_not_found());
    }

    #[test]
    fn oversized_row_in_a_batch_leaves_the_rest() {
        let ctx = Ctx::new();
        let db = Database::in_memory();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Batched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        s.insert(&ctx, "people", row(1, "a")).unwrap();
        s.insert(&ctx, "people", row(2, "b")).unwrap();
        let err = s.insert(&ctx, "people", row(3, &"x".repeat(30_000))).unwrap_err();
        assert!(matches!(err, TabulaError::InvalidInput(_)));

        s.flush(&ctx).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().count(), 2);
        assert_eq!(s.get(&ctx, "people", &[Value::Int(1)]).unwrap(), Some(row(1, "a")));
    }

    #[test]
    fn failed_flush_keeps_the_buffer() {
        let ctx = Ctx::new();
        let store = Arc::new(Interfering::default());
        let db = Database::open(store.clone(), &EngineConfig::default()).unwrap();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Batched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        s.insert(&ctx, "people", row(1, "a")).unwrap();
        s.insert(&ctx, "people", row(2, "b")).unwrap();

        store.refuse_puts.store(true, Ordering::SeqCst);
        assert!(matches!(s.flush(&ctx), Err(TabulaError::Io(_))));
        assert_eq!(s.get(&ctx, "people", &[Value::Int(2)]).unwrap(), Some(row(2, "b")));

        store.refuse_puts.store(false, Ordering::SeqCst);
        let head = s.commit(&ctx, &db).unwrap();
        let t = db.root(&ctx).unwrap().get_table(&ctx, "people").unwrap().unwrap();
        assert_eq!(t.count(), 2);
        assert_eq!(db.head().unwrap(), head);
    }

    #[test]
    fn last_writer_wins_retries_without_reflushing() {
        let ctx = Ctx::new();
        let store = Arc::new(Interfering::default());
        let db = Database::open(store.clone(), &EngineConfig::default()).unwrap();
        let mut s = db.begin(&ctx, WriteMode::LastWriterWins, BatchMode::Batched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        for name in ["a", "b", "c"] {
            s.insert(&ctx, "people", row(0, name)).unwrap();
        }

        // another writer lands between our read of the head and our swap
        *store.race_to.lock().unwrap() = Some(Address::of(b"elsewhere"));
        let head = s.commit(&ctx, &db).unwrap();
        assert_eq!(store.set_root_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(db.head().unwrap(), head);

        let t = db.root(&ctx).unwrap().get_table(&ctx, "people").unwrap().unwrap();
        assert_eq!(t.count(), 3);
        assert_eq!(t.auto_increment_value(), Some(4));
    }

    #[test]
    fn failed_drop_keeps_the_tables_edits() {
        let ctx = Ctx::new();
        let store = Arc::new(Interfering::default());
        let db = Database::open(store.clone(), &EngineConfig::default()).unwrap();
        let mut s = db.begin(&ctx, WriteMode::Linear, BatchMode::Batched).unwrap();
        s.create_table(&ctx, "people", people()).unwrap();
        s.create_table(&ctx, "pets", people()).unwrap();
        s.insert(&ctx, "people", row(1, "a")).unwrap();

        assert!(s.drop_table(&ctx, "ghosts").unwrap_err().is_not_found());
        store.refuse_puts.store(true, Ordering::SeqCst);
        assert!(s.drop_table(&ctx, "people").is_err());
        store.refuse_puts.store(false, Ordering::SeqCst);

        s.flush(&ctx).unwrap();
        assert_eq!(s.table(&ctx, "people").unwrap().count(), 1);
        assert_eq!(s.auto_increment().current("people"), Some(2));
    }
}
