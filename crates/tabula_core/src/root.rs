//! Root values: the table name -> table address map a database head points at.

use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::message::MessageKind;
use crate::prolly::{Edits, NodeStore, ProllyMap};
use crate::table::Table;
use tracing::trace;

#[derive(Clone, Debug)]
pub struct RootValue {
    tables: ProllyMap,
}

impl RootValue {
    pub fn empty(ns: &NodeStore) -> Self {
        RootValue { tables: ProllyMap::empty(ns, MessageKind::AddressMap) }
    }

    /// Root value stored at `addr`; `Address::EMPTY` is the empty root.
    pub fn load(ctx: &Ctx, ns: &NodeStore, addr: Address) -> Result<Self> {
        Ok(RootValue { tables: ProllyMap::load(ctx, ns, MessageKind::AddressMap, addr)? })
    }

    /// Every node is written as it is built, so the address is all a head
    /// pointer needs.
    pub fn address(&self) -> Address { self.tables.address() }

    pub fn node_store(&self) -> &NodeStore { self.tables.node_store() }

    pub fn table_count(&self) -> u64 { self.tables.count() }

    pub fn table_names(&self, ctx: &Ctx) -> Result<Vec<String>> {
        self.tables
            .iter_all(ctx)?
            .map(|r| {
                let (k, _) = r?;
                String::from_utf8(k).map_err(|_| TabulaError::Corrupt("table name is not utf-8".into()))
            })
            .collect()
    }

    pub fn has_table(&self, ctx: &Ctx, name: &str) -> Result<bool> { self.tables.has(ctx, name.as_bytes()) }

    pub fn table_address(&self, ctx: &Ctx, name: &str) -> Result<Option<Address>> {
        match self.tables.get(ctx, name.as_bytes())? {
            Some(raw) => Ok(Some(Address::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_table(&self, ctx: &Ctx, name: &str) -> Result<Option<Table>> {
        match self.table_address(ctx, name)? {
            Some(addr) => Ok(Some(Table::load(ctx, self.node_store(), addr)?)),
            None => Ok(None),
        }
    }

    /// Write `table` and point `name` at it, replacing any previous table.
    pub fn put_table(&self, ctx: &Ctx, name: &str, table: &Table) -> Result<RootValue> {
        if name.is_empty() {
            return Err(TabulaError::InvalidInput("table name is empty".into()));
        }
        let addr = table.write(ctx)?;
        let mut edits = Edits::new();
        edits.insert(name.as_bytes().to_vec(), Some(addr.as_bytes().to_vec()));
        trace!(table = name, addr = %addr, "table placed in root");
        Ok(RootValue { tables: self.tables.mutate(ctx, &edits)? })
    }

    pub fn remove_table(&self, ctx: &Ctx, name: &str) -> Result<RootValue> {
        if !self.has_table(ctx, name)? {
            return Err(TabulaError::not_found("table", name));
        }
        let mut edits = Edits::new();
        edits.insert(name.as_bytes().to_vec(), None);
        Ok(RootValue { tables: self.tables.mutate(ctx, &edits)? })
    }

    /// Visit every chunk reachable from this root: the table map first, then
    /// each table in name order.
    pub fn walk_addresses<F>(&self, ctx: &Ctx, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address) -> Result<()>,
    {
        self.tables.walk_addresses(ctx, &mut visit)?;
        for name in self.table_names(ctx)? {
            if let Some(addr) = self.table_address(ctx, &name)? {
                visit(&addr)?;
                Table::load(ctx, self.node_store(), addr)?.walk_addresses(ctx, &mut visit)?;
            }
        }
        Ok(())
    }
}
