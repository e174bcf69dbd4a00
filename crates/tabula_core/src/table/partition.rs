use crate::config::PartitionConfig;
use std::fmt;
use std::sync::Mutex;

/// Half-open ordinal range `[start, end)` of a table's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    start: u64,
    end: u64,
}

impl Partition {
    pub fn new(start: u64, end: u64) -> Self { Partition { start, end: end.max(start) } }

    pub fn start(&self) -> u64 { self.start }

    pub fn end(&self) -> u64 { self.end }

    pub fn len(&self) -> u64 { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.start == self.end }

    /// Identifier unique among the partitions of one scan.
    pub fn key(&self) -> String { self.to_string() }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >= i < {}", self.start, self.end)
    }
}

/// Split `rows` into contiguous ranges, about `multiplier x workers` of them,
/// none longer than `max_rows_per_partition`. Small tables get one range; an
/// empty table gets one empty range.
pub fn partition_rows(rows: u64, cfg: &PartitionConfig) -> Vec<Partition> {
    if rows < cfg.min_rows_per_partition.max(1) {
        return vec![Partition::new(0, rows)];
    }
    let wanted = cfg.multiplier.max(1).saturating_mul(cfg.worker_count() as u64);
    let per = rows.div_ceil(wanted).clamp(1, cfg.max_rows_per_partition.max(1));
    (0..rows.div_ceil(per))
        .map(|i| Partition::new(i * per, ((i + 1) * per).min(rows)))
        .collect()
}

/// Hands partitions out to scan workers, one at a time.
#[derive(Debug)]
pub struct PartitionIter {
    parts: Mutex<std::vec::IntoIter<Partition>>,
}

impl PartitionIter {
    pub fn new(parts: Vec<Partition>) -> Self { PartitionIter { parts: Mutex::new(parts.into_iter()) } }

    /// Next unclaimed partition; safe to call from many threads.
    pub fn next_partition(&self) -> Option<Partition> {
        self.parts.lock().unwrap_or_else(|p| p.into_inner()).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(workers: usize) -> PartitionConfig {
        PartitionConfig { workers: Some(workers), ..PartitionConfig::default() }
    }

    fn assert_tiles(parts: &[Partition], rows: u64) {
        assert!(!parts.is_empty());
        assert_eq!(parts[0].start(), 0);
        assert_eq!(parts.last().map(|p| p.end()), Some(rows));
        for w in parts.windows(2) {
            assert_eq!(w[0].end(), w[1].start());
        }
        if rows > 0 {
            assert!(parts.iter().all(|p| !p.is_empty()));
        }
    }

    #[test]
    fn ranges_tile_the_table() {
        for rows in [0u64, 1, 1023, 1024, 1025, 4096, 10_000, 65_537, 1_000_003] {
            for workers in [1usize, 2, 3, 8, 64] {
                let c = cfg(workers);
                let parts = partition_rows(rows, &c);
                assert_tiles(&parts, rows);
                assert!(parts.iter().all(|p| p.len() <= c.max_rows_per_partition), "{rows}/{workers}");
            }
        }
    }

    #[test]
    fn small_and_empty_tables_get_one_partition() {
        assert_eq!(partition_rows(0, &cfg(8)), vec![Partition::new(0, 0)]);
        assert_eq!(partition_rows(1000, &cfg(8)), vec![Partition::new(0, 1000)]);
    }

    #[test]
    fn count_follows_workers() {
        assert_eq!(partition_rows(16_000, &cfg(4)).len(), 8);
        // capped by max rows per partition
        assert_eq!(partition_rows(1_000_000, &cfg(1)).len(), 31);
    }

    #[test]
    fn keys_are_rendered_as_ranges() {
        assert_eq!(Partition::new(5, 9).key(), "5 >= i < 9");
    }

    #[test]
    fn iter_hands_out_each_partition_once() {
        let it = std::sync::Arc::new(PartitionIter::new(partition_rows(100_000, &cfg(4))));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let it = it.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(p) = it.next_partition() {
                        got.push(p);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<Partition> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_by_key(|p| p.start());
        assert_tiles(&all, 100_000);
    }
}
