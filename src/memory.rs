// SPDX-License-Identifier: MPL-2.0

//! Accounting of memory held by live decoded frame sequences.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicI64, Ordering},
    },
};

static GLOBAL: OnceLock<MemoryUsage> = OnceLock::new();

#[derive(Debug, Default)]
struct Counters {
    sequences: AtomicI64,
    bytes: AtomicI64,
}

/// Shared counter of live sequences and the bytes they hold.
///
/// Cloning yields another handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsage {
    counters: Arc<Counters>,
}

/// Point-in-time view of a [`MemoryUsage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub sequences: i64,
    pub bytes: i64,
}

impl MemoryUsage {
    /// A fresh tracker, independent from the process-wide one.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker used by the default configuration.
    #[must_use]
    pub fn global() -> &'static MemoryUsage {
        GLOBAL.get_or_init(MemoryUsage::new)
    }

    /// Account for `bytes` until the returned reservation is released or dropped.
    #[must_use]
    pub fn reserve(&self, bytes: usize) -> Reservation {
        let bytes = bytes as i64;
        self.counters.sequences.fetch_add(1, Ordering::AcqRel);
        self.counters.bytes.fetch_add(bytes, Ordering::AcqRel);
        Reservation {
            usage: self.clone(),
            bytes,
            released: false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            sequences: self.counters.sequences.load(Ordering::Acquire),
            bytes: self.counters.bytes.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> i64 {
        self.counters.bytes.load(Ordering::Acquire)
    }
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        write!(
            f,
            "{} frame sequences holding {}",
            snapshot.sequences,
            human_readable_bytes(snapshot.bytes)
        )
    }
}

/// Bytes held by one sequence. Released exactly once.
#[derive(Debug)]
pub struct Reservation {
    usage: MemoryUsage,
    bytes: i64,
    released: bool,
}

impl Reservation {
    pub fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.usage.counters.sequences.fetch_sub(1, Ordering::AcqRel);
        self.usage
            .counters
            .bytes
            .fetch_sub(self.bytes, Ordering::AcqRel);
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes as usize
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

fn human_readable_bytes(bytes: i64) -> String {
    const UNIT: f64 = 1024.0;
    const PREFIXES: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes.abs() < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / UNIT;
    let mut prefix = PREFIXES[0];
    for next in &PREFIXES[1..] {
        if value.abs() < UNIT {
            break;
        }
        value /= UNIT;
        prefix = next;
    }
    format!("{value:.1} {prefix}")
}
