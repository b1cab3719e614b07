use core::sync::atomic::{AtomicI64, Ordering};

use log::info;

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current_value(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak_value(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Instance-owned OS and protocol counters. Relaxed: these are telemetry,
/// never part of the allocation protocol.
#[derive(Default)]
pub struct Stats {
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub mmap_calls: StatCount,
    pub expansions: StatCount,
    pub reclaims: StatCount,
}

impl Stats {
    pub fn print(&self) {
        info!(
            "reserved: current {}, peak {}",
            self.reserved.current_value(),
            self.reserved.peak_value()
        );
        info!(
            "committed: current {}, peak {}",
            self.committed.current_value(),
            self.committed.peak_value()
        );
        info!("reset: total {}", self.reset.allocated.load(Ordering::Relaxed));
        info!(
            "mmap calls: {}",
            self.mmap_calls.allocated.load(Ordering::Relaxed)
        );
        info!(
            "pages published: {}, pages reclaimed: {}",
            self.expansions.allocated.load(Ordering::Relaxed),
            self.reclaims.allocated.load(Ordering::Relaxed)
        );
    }
}
