//! Per-message size and latency accounting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framed_rpc_proto::MessageType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One finished message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub elapsed: Duration,
    pub size: u64,
}

/// Sink for [`Record`]s, keyed by `"<message type> <method>"`.
pub trait InstrumentationStorage: Send + Sync + 'static {
    fn put(&self, tag: &str, record: Record);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentationStorage;

impl InstrumentationStorage for NoopInstrumentationStorage {
    fn put(&self, _tag: &str, _record: Record) {}
}

/// Keeps running totals per tag in memory.
#[derive(Debug, Default)]
pub struct MemoryInstrumentationStorage {
    inner: Mutex<BTreeMap<String, TagStats>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TagStats {
    count: u64,
    total_bytes: u64,
    total_duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSnapshot {
    pub count: u64,
    pub total_bytes: u64,
    pub total_duration_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationSnapshot {
    pub tags: BTreeMap<String, TagSnapshot>,
}

impl InstrumentationStorage for MemoryInstrumentationStorage {
    fn put(&self, tag: &str, record: Record) {
        let mut inner = self.inner.lock();
        let stats = inner.entry(tag.to_owned()).or_default();
        stats.count = stats.count.saturating_add(1);
        stats.total_bytes = stats.total_bytes.saturating_add(record.size);
        stats.total_duration = stats.total_duration.saturating_add(record.elapsed);
    }
}

impl MemoryInstrumentationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InstrumentationSnapshot {
        let inner = self.inner.lock();
        let tags = inner
            .iter()
            .map(|(tag, stats)| {
                (
                    tag.clone(),
                    TagSnapshot {
                        count: stats.count,
                        total_bytes: stats.total_bytes,
                        total_duration_us: stats.total_duration.as_micros().min(u64::MAX as u128)
                            as u64,
                    },
                )
            })
            .collect();
        InstrumentationSnapshot { tags }
    }
}

/// Accumulates the size of one message and records it once.
pub struct NetworkInstrumenter {
    storage: Arc<dyn InstrumentationStorage>,
    tag: String,
    start: Instant,
    size: u64,
    recorded: bool,
}

impl std::fmt::Debug for NetworkInstrumenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInstrumenter")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("recorded", &self.recorded)
            .finish()
    }
}

impl NetworkInstrumenter {
    pub fn new(storage: Arc<dyn InstrumentationStorage>, typ: MessageType, method: &str) -> Self {
        Self {
            storage,
            tag: format!("{typ} {method}"),
            start: Instant::now(),
            size: 0,
            recorded: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn increment_size(&mut self, n: usize) {
        self.size = self.size.saturating_add(n as u64);
    }

    /// Adds `n` bytes and records elapsed time and total size. Later calls do nothing.
    pub fn record_and_finish(&mut self, n: usize) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        self.increment_size(n);
        self.storage.put(
            &self.tag,
            Record {
                elapsed: self.start.elapsed(),
                size: self.size,
            },
        );
    }
}
