use serde::Serialize;

use crate::writer::WriterCounters;

/// Diagnostics snapshot taken by [`crate::LocationManager::metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocationMetrics {
    pub cycles: u64,
    pub total_cycle_nanos: u64,
    pub avg_cycle_nanos: u64,
    pub loaded_worlds: usize,
    pub registered_blocks: usize,
    pub active_tickers: usize,
    pub pending_changes: usize,
    /// Records queued for the writer but not yet taken by it.
    pub queued_records: usize,
    pub flushes: u64,
    pub deferred_types: Vec<String>,
    pub writer: WriterCounters,
}

impl LocationMetrics {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
