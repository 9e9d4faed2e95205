use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Byte progress of one intent, shared by its insertion workers.
#[derive(Debug)]
pub struct Progress {
    name: String,
    total: u64,
    done: AtomicU64,
    /// last reported decile.
    reported: AtomicU64,
}

impl Progress {
    /// create progress for `name`, which has `total` bytes to restore.
    pub fn new(name: impl Into<String>, total: u64) -> Self {
        Progress {
            name: name.into(),
            total,
            done: AtomicU64::new(0),
            reported: AtomicU64::new(0),
        }
    }

    /// Record `bytes` more bytes restored, logs every time another 10% is reached.
    pub fn add(&self, bytes: u64) {
        let done = self.done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.total == 0 {
            return;
        }
        let decile = (done.min(self.total) * 10 / self.total).min(10);
        let reported = self.reported.fetch_max(decile, Ordering::Relaxed);
        if decile > reported {
            info!(ns = %self.name, done, total = self.total, "{}% restored.", decile * 10);
        }
    }

    /// bytes restored so far.
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// bytes to restore.
    pub fn total(&self) -> u64 {
        self.total
    }
}
