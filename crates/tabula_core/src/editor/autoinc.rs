use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::table::Table;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Next auto-increment value per table, shared by every editor of one write
/// session. Counters only move up unless `reset` says otherwise.
#[derive(Debug, Default)]
pub struct AutoIncrementTracker {
    next: Mutex<HashMap<String, u64>>,
}

impl AutoIncrementTracker {
    pub fn new() -> Self { Self::default() }

    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.next.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed the counter for `name` unless it is already tracked: the table's
    /// stored value, else one past the largest value in the column.
    pub fn init(&self, ctx: &Ctx, name: &str, table: &Table) -> Result<()> {
        let Some(pos) = table.schema().auto_increment_position() else {
            return Ok(());
        };
        if self.counters().contains_key(name) {
            return Ok(());
        }
        let start = match table.auto_increment_value() {
            Some(v) => v.max(1),
            None => max_value(ctx, table, pos)?.map_or(1, |m| m.saturating_add(1)),
        };
        trace!(table = name, start, "auto-increment seeded");
        self.counters().entry(name.to_string()).or_insert(start);
        Ok(())
    }

    /// Hand out the next value.
    pub fn next(&self, name: &str) -> Result<u64> {
        let mut c = self.counters();
        let slot = c.get_mut(name).ok_or_else(|| TabulaError::NoAutoIncrement(name.to_string()))?;
        let v = *slot;
        *slot = v.saturating_add(1);
        Ok(v)
    }

    /// Note an explicitly supplied value; later values start above it.
    pub fn observe(&self, name: &str, value: u64) {
        let mut c = self.counters();
        let slot = c.entry(name.to_string()).or_insert(1);
        *slot = (*slot).max(value.saturating_add(1));
    }

    pub fn reset(&self, name: &str, next: u64) {
        self.counters().insert(name.to_string(), next);
    }

    /// Value the next insert would receive, if `name` is tracked.
    pub fn current(&self, name: &str) -> Option<u64> { self.counters().get(name).copied() }

    pub fn forget(&self, name: &str) {
        self.counters().remove(name);
    }

    pub fn rename(&self, from: &str, to: &str) {
        let mut c = self.counters();
        if let Some(v) = c.remove(from) {
            c.insert(to.to_string(), v);
        }
    }
}

/// Largest non-negative value stored in column `pos`. A leading key column
/// is read off the last row; anything else needs a scan.
fn max_value(ctx: &Ctx, table: &Table, pos: usize) -> Result<Option<u64>> {
    let n = table.count();
    if n == 0 {
        return Ok(None);
    }
    if table.schema().pk_positions().first() == Some(&(pos as u16)) {
        let mut last = table.partition_rows(ctx, &crate::table::Partition::new(n - 1, n))?;
        return match last.next() {
            Some(row) => Ok(row?[pos].as_u64()),
            None => Ok(None),
        };
    }
    let mut max = None;
    for row in table.scan(ctx)? {
        if let Some(v) = row?[pos].as_u64() {
            max = Some(max.map_or(v, |m: u64| m.max(v)));
        }
    }
    Ok(max)
}
