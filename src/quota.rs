use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

/// Receives per-origin storage usage changes.
pub trait QuotaClient: Send + Sync {
    /// `delta` is positive when bytes were committed and negative when a
    /// committed entry was deleted.
    fn notify_storage_modified(&self, origin: &str, delta: i64);
}

/// Running usage totals keyed by origin.
#[derive(Debug, Default)]
pub struct UsageLedger {
    usage: Mutex<HashMap<String, i64>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self, origin: &str) -> i64 {
        self.usage.lock().get(origin).copied().unwrap_or(0)
    }
}

impl QuotaClient for UsageLedger {
    fn notify_storage_modified(&self, origin: &str, delta: i64) {
        let mut usage = self.usage.lock();
        let total = usage.entry(origin.to_string()).or_insert(0);
        *total = total.saturating_add(delta);
        trace!(origin, delta, total = *total, "storage usage updated");
    }
}

/// Converts a byte count into a signed usage delta.
pub(crate) fn delta(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
