//! Progress tracking for wallet synchronization.
//!
//! This module provides two trackers. `FetchTracker` counts remote fetches currently in flight and
//! exposes the aggregate "is syncing" signal; decrements are debounced so a burst of short fetches
//! reads as one continuous sync. `SyncProgressTracker` accumulates per-session statistics that are
//! logged when a session finishes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Shared counter of in-flight fetches.
#[derive(Debug, Clone)]
pub struct FetchTracker {
    in_flight: Arc<watch::Sender<usize>>,
    debounce: Duration,
}

impl FetchTracker {
    /// Create a tracker that keeps finished fetches counted for `debounce`.
    pub fn new(debounce: Duration) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            in_flight: Arc::new(in_flight),
            debounce,
        }
    }

    /// Count a fetch as started. The returned guard ends it when dropped.
    pub fn begin(&self) -> FetchGuard {
        self.in_flight.send_modify(|count| *count += 1);
        FetchGuard {
            in_flight: self.in_flight.clone(),
            debounce: self.debounce,
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight() > 0
    }

    /// Watch the in-flight count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }
}

/// Marks one in-flight fetch.
#[derive(Debug)]
pub struct FetchGuard {
    in_flight: Arc<watch::Sender<usize>>,
    debounce: Duration,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let in_flight = self.in_flight.clone();
        let release = move || in_flight.send_modify(|count| *count = count.saturating_sub(1));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.debounce.is_zero() => {
                let debounce = self.debounce;
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    release();
                });
            }
            _ => release(),
        }
    }
}

/// Service for tracking synchronization progress
///
/// Counts fetched addresses, scanned block windows and merged transactions for one session.
#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
    addresses_fetched: usize,
    fetch_failures: usize,
    transactions_merged: usize,
    windows_scanned: usize,
    logs_processed: usize,
    lowest_scanned_height: Option<u64>,
    highest_scanned_height: Option<u64>,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed address fetch and how many records it changed
    pub fn record_address_fetch(&mut self, merged: usize) {
        self.addresses_fetched += 1;
        self.transactions_merged += merged;
    }

    pub fn record_fetch_failure(&mut self) {
        self.fetch_failures += 1;
    }

    /// Record a scanned block window `[from, to]`
    pub fn record_window(&mut self, from: u64, to: u64, logs: usize, merged: usize) {
        self.windows_scanned += 1;
        self.logs_processed += logs;
        self.transactions_merged += merged;
        self.lowest_scanned_height = Some(self.lowest_scanned_height.map_or(from, |h| h.min(from)));
        self.highest_scanned_height = Some(self.highest_scanned_height.map_or(to, |h| h.max(to)));
        debug!("Scanned window [{}, {}]: {} logs", from, to, logs);
    }

    pub fn log_progress(&self) {
        info!("Sync progress: {}", self.get_stats().summary());
    }

    /// Get sync statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            addresses_fetched: self.addresses_fetched,
            fetch_failures: self.fetch_failures,
            transactions_merged: self.transactions_merged,
            windows_scanned: self.windows_scanned,
            logs_processed: self.logs_processed,
            scanned_range: self.lowest_scanned_height.zip(self.highest_scanned_height),
        }
    }
}

/// Statistics about the sync progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub addresses_fetched: usize,
    pub fetch_failures: usize,
    pub transactions_merged: usize,
    pub windows_scanned: usize,
    pub logs_processed: usize,
    pub scanned_range: Option<(u64, u64)>,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "{} addresses fetched, {} windows scanned, {} logs, {} transactions merged{}{}",
            self.addresses_fetched,
            self.windows_scanned,
            self.logs_processed,
            self.transactions_merged,
            match self.scanned_range {
                Some((from, to)) => format!(" (blocks {}..={})", from, to),
                None => String::new(),
            },
            if self.fetch_failures == 0 {
                String::new()
            } else {
                format!(" ({} failed fetches)", self.fetch_failures)
            }
        )
    }
}
