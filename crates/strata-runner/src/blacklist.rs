//! Per-worker failure tracking and blacklist control.
//!
//! A worker accumulating `max_retries_before_blacklist` consecutive failures
//! is suspended for `backoff`, subject to a cluster-wide cap: the number of
//! simultaneously blacklisted workers never exceeds
//! `alive_workers * max_percentage / 100` (integer arithmetic, so small
//! clusters with low percentages never blacklist anyone).
//!
//! Blacklisting is advisory: a blacklisted worker's in-flight tasks
//! continue; only new assignments are withheld.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Failure-tracking state for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistEntry {
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Suspension deadline, when blacklisted.
    pub blacklisted_until: Option<DateTime<Utc>>,
}

/// Tracks consecutive per-worker failures and suspends repeat offenders.
#[derive(Debug)]
pub struct BlacklistController {
    entries: Mutex<HashMap<String, BlacklistEntry>>,
    max_retries: u32,
    max_percentage: u8,
    backoff: Duration,
}

impl BlacklistController {
    /// Creates a controller with the given thresholds.
    #[must_use]
    pub fn new(max_retries: u32, max_percentage: u8, backoff: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_retries,
            max_percentage,
            backoff,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, BlacklistEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a successful completion on `host`.
    ///
    /// Resets the consecutive-failure counter and lifts any suspension
    /// immediately. Returns true when the worker had been blacklisted.
    pub fn record_success(&self, host: &str) -> bool {
        let mut entries = self.entries();
        let entry = entries.entry(host.to_string()).or_default();
        let was_blacklisted = entry.blacklisted_until.is_some();
        entry.consecutive_failures = 0;
        entry.blacklisted_until = None;
        was_blacklisted
    }

    /// Records a failed completion on `host`.
    ///
    /// Returns true when this failure pushed the worker onto the blacklist.
    /// The worker is suspended only if its consecutive failures reach the
    /// threshold and the cluster cap still has room.
    pub fn record_failure(&self, host: &str, alive_workers: usize, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries();
        let blacklisted_count = entries
            .values()
            .filter(|entry| entry.blacklisted_until.is_some())
            .count();

        let entry = entries.entry(host.to_string()).or_default();
        entry.consecutive_failures += 1;

        if entry.blacklisted_until.is_some() || entry.consecutive_failures < self.max_retries {
            return false;
        }

        let limit = alive_workers * usize::from(self.max_percentage) / 100;
        if blacklisted_count >= limit {
            tracing::warn!(
                host,
                consecutive_failures = entry.consecutive_failures,
                blacklisted_count,
                limit,
                "worker exceeded failure threshold but blacklist cap is reached"
            );
            return false;
        }

        entry.blacklisted_until = Some(
            now + chrono::Duration::from_std(self.backoff)
                .unwrap_or_else(|_| chrono::Duration::zero()),
        );
        tracing::warn!(
            host,
            consecutive_failures = entry.consecutive_failures,
            "worker blacklisted"
        );
        true
    }

    /// Returns true when `host` is currently suspended.
    #[must_use]
    pub fn is_blacklisted(&self, host: &str) -> bool {
        let entries = self.entries();
        entries
            .get(host)
            .is_some_and(|entry| entry.blacklisted_until.is_some())
    }

    /// Returns the consecutive-failure count for `host`.
    #[must_use]
    pub fn consecutive_failures(&self, host: &str) -> u32 {
        let entries = self.entries();
        entries
            .get(host)
            .map_or(0, |entry| entry.consecutive_failures)
    }

    /// Returns the currently blacklisted hosts, sorted.
    #[must_use]
    pub fn blacklisted_hosts(&self) -> Vec<String> {
        let entries = self.entries();
        let mut hosts: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.blacklisted_until.is_some())
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Re-admits workers whose suspension has expired as of `now`.
    ///
    /// Re-admission also resets the consecutive-failure counter. Returns the
    /// re-admitted hosts.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries();
        let mut readmitted = Vec::new();
        for (host, entry) in entries.iter_mut() {
            if entry.blacklisted_until.is_some_and(|until| until <= now) {
                entry.blacklisted_until = None;
                entry.consecutive_failures = 0;
                readmitted.push(host.clone());
            }
        }
        if !readmitted.is_empty() {
            readmitted.sort();
            tracing::info!(hosts = ?readmitted, "re-admitted workers after blacklist backoff");
        }
        readmitted
    }

    /// Drops tracking state for a departed worker.
    pub fn forget(&self, host: &str) {
        let mut entries = self.entries();
        entries.remove(host);
    }
}
