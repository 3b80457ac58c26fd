use crate::domain::purchase::PurchaseRecord;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PurchaseCacheEntry {
    pub records: Vec<PurchaseRecord>,
    pub fetched_at: Instant,
}

/// Last successful purchase query, valid for `ttl`.
///
/// An empty snapshot is a real answer ("nothing owned") and is served like any
/// other until it expires.
#[derive(Debug)]
pub struct PurchaseCache {
    entry: Option<PurchaseCacheEntry>,
    ttl: Duration,
}

impl PurchaseCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    pub fn lookup(&self, now: Instant, force: bool) -> Option<&[PurchaseRecord]> {
        if force {
            return None;
        }
        self.entry
            .as_ref()
            .filter(|entry| now.saturating_duration_since(entry.fetched_at) < self.ttl)
            .map(|entry| entry.records.as_slice())
    }

    pub fn store(&mut self, records: Vec<PurchaseRecord>, now: Instant) {
        self.entry = Some(PurchaseCacheEntry {
            records,
            fetched_at: now,
        });
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn entry(&self) -> Option<&PurchaseCacheEntry> {
        self.entry.as_ref()
    }
}
