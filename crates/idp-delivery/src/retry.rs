//! Failure capture and redelivery
//!
//! Failed sends are recorded with their first-failure time. A background
//! task wakes every `retry_interval`, regenerates each payload and tries
//! again:
//! - delivered records are removed
//! - records older than `max_age` are dropped as unrecoverable
//! - everything else stays, unchanged, for the next cycle
//!
//! Shutdown wakes the task, which exits after the send in flight completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use idp_common::FailedDelivery;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};
use crate::regenerator::PayloadRegenerator;
use crate::sender::DeliverySender;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep between retry cycles
    pub retry_interval: Duration,
    /// Age after which a failed delivery is abandoned
    pub max_age: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Counts from one pass over the recorded failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub delivered: usize,
    pub dropped: usize,
    pub retained: usize,
    pub skipped: usize,
}

enum Verdict {
    Delivered,
    Drop,
    Retain,
    Skip,
}

pub struct RetryingDelivery {
    name: String,
    policy: RetryPolicy,
    max_age: chrono::Duration,
    regenerator: Arc<dyn PayloadRegenerator>,
    sender: Arc<dyn DeliverySender>,
    failures: Mutex<IndexMap<u64, FailedDelivery>>,
    next_key: AtomicU64,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl RetryingDelivery {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        regenerator: Arc<dyn PayloadRegenerator>,
        sender: Arc<dyn DeliverySender>,
    ) -> Result<Self> {
        let name = name.into();
        if policy.retry_interval.is_zero() {
            return Err(DeliveryError::configuration(format!(
                "{}: retry interval must be greater than zero",
                name
            )));
        }
        if policy.max_age.is_zero() {
            return Err(DeliveryError::configuration(format!(
                "{}: max age must be greater than zero",
                name
            )));
        }
        let max_age = chrono::Duration::from_std(policy.max_age)
            .map_err(|e| DeliveryError::configuration(format!("{}: max age out of range: {}", name, e)))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            name,
            policy,
            max_age,
            regenerator,
            sender,
            failures: Mutex::new(IndexMap::new()),
            next_key: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> &Arc<dyn DeliverySender> {
        &self.sender
    }

    pub fn record(&self, endpoint: impl Into<String>, payload: Vec<u8>) {
        self.record_at(endpoint, payload, Utc::now());
    }

    pub fn record_at(&self, endpoint: impl Into<String>, payload: Vec<u8>, first_failure: DateTime<Utc>) {
        let failure = FailedDelivery::new(endpoint, payload, first_failure);
        debug!(delivery = %self.name, endpoint = %failure.endpoint, "Recording failed delivery");
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.failures.lock().insert(key, failure);
    }

    pub fn pending(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn snapshot(&self) -> Vec<FailedDelivery> {
        self.failures.lock().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One retry pass over a snapshot of the recorded failures
    pub async fn process_failures(&self, now: DateTime<Utc>) -> CycleReport {
        let snapshot: Vec<(u64, FailedDelivery)> = self
            .failures
            .lock()
            .iter()
            .map(|(key, failure)| (*key, failure.clone()))
            .collect();

        let mut report = CycleReport::default();
        if snapshot.is_empty() {
            return report;
        }
        debug!(delivery = %self.name, count = snapshot.len(), "Processing failed deliveries");

        for (key, failure) in snapshot {
            match self.retry_one(&failure, now).await {
                Verdict::Delivered => {
                    self.failures.lock().shift_remove(&key);
                    report.delivered += 1;
                }
                Verdict::Drop => {
                    self.failures.lock().shift_remove(&key);
                    report.dropped += 1;
                }
                Verdict::Retain => report.retained += 1,
                Verdict::Skip => report.skipped += 1,
            }
        }

        info!(
            delivery = %self.name,
            delivered = report.delivered,
            dropped = report.dropped,
            retained = report.retained,
            skipped = report.skipped,
            "Retry cycle complete"
        );
        report
    }

    async fn retry_one(&self, failure: &FailedDelivery, now: DateTime<Utc>) -> Verdict {
        if failure.endpoint.is_empty() || failure.payload.is_empty() {
            warn!(delivery = %self.name, "Dropping failed delivery with no endpoint or payload");
            return Verdict::Drop;
        }

        if failure.age(now) > self.max_age {
            error!(
                delivery = %self.name,
                endpoint = %failure.endpoint,
                first_failure = %failure.first_failure,
                "Giving up on delivery, max age exceeded"
            );
            return Verdict::Drop;
        }

        let payload = match self.regenerator.regenerate(&failure.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(delivery = %self.name, endpoint = %failure.endpoint, error = %e, "Could not regenerate payload, skipping");
                return Verdict::Skip;
            }
        };

        match self.sender.send(&failure.endpoint, &payload).await {
            Ok(()) => {
                info!(delivery = %self.name, endpoint = %failure.endpoint, "Redelivered");
                Verdict::Delivered
            }
            Err(e) if failure.age(now) > self.max_age => {
                error!(delivery = %self.name, endpoint = %failure.endpoint, error = %e, "Redelivery failed and max age exceeded, dropping");
                Verdict::Drop
            }
            Err(e) => {
                warn!(delivery = %self.name, endpoint = %failure.endpoint, error = %e, "Redelivery failed, will retry");
                Verdict::Retain
            }
        }
    }

    /// Spawn the retry loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.policy.retry_interval;

        info!(delivery = %self.name, interval_secs = period.as_secs(), "Starting retry loop");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!(delivery = %this.name, "Retry loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !this.running.load(Ordering::SeqCst) {
                            break;
                        }
                        this.process_failures(Utc::now()).await;
                    }
                }
            }

            this.running.store(false, Ordering::SeqCst);
        })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
