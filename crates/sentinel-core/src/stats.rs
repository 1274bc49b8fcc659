use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide write counters, shared by the gate and the backup manager.
///
/// The fields only ever grow and are reset by process restart. Relaxed
/// ordering is fine: exact values are only reported in the shutdown summary.
#[derive(Debug, Default)]
pub struct WriteStats {
    total_writes: AtomicU64,
    blocked_writes: AtomicU64,
    backups_created: AtomicU64,
}

impl WriteStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup(&self) {
        self.backups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            blocked_writes: self.blocked_writes.load(Ordering::Relaxed),
            backups_created: self.backups_created.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, used for the shutdown report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_writes: u64,
    pub blocked_writes: u64,
    pub backups_created: u64,
}

impl StatsSnapshot {
    /// Share of writes that were blocked, as a percentage. `0.0` when no
    /// write was seen.
    pub fn blocked_percent(&self) -> f64 {
        if self.total_writes == 0 {
            0.0
        } else {
            100.0 * self.blocked_writes as f64 / self.total_writes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = WriteStats::new();
        stats.record_write();
        stats.record_write();
        stats.record_blocked();
        stats.record_backup();
        let snap = stats.snapshot();
        assert_eq!(snap.total_writes, 2);
        assert_eq!(snap.blocked_writes, 1);
        assert_eq!(snap.backups_created, 1);
    }

    #[test]
    fn blocked_never_exceeds_total_under_contention() {
        use std::sync::Arc;

        let stats = Arc::new(WriteStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    stats.record_write();
                    if i % 3 == 0 {
                        stats.record_blocked();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_writes, 8000);
        assert!(snap.blocked_writes <= snap.total_writes);
    }

    #[test]
    fn zero_total_reports_zero_percent() {
        let snap = WriteStats::new().snapshot();
        assert_eq!(snap.blocked_percent(), 0.0);
        assert_eq!(format!("{:.2}%", snap.blocked_percent()), "0.00%");
    }

    #[test]
    fn percentage_is_computed_from_the_counters() {
        let stats = WriteStats::new();
        for _ in 0..4 {
            stats.record_write();
        }
        stats.record_blocked();
        assert_eq!(stats.snapshot().blocked_percent(), 25.0);
    }
}
