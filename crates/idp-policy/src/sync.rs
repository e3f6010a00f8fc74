//! Policy cache synchronizer
//!
//! Polls the durable store on a fixed interval:
//! - first successful tick: full load, replacing the cache
//! - later ticks: apply changes with a sequence id above the last one seen
//!
//! Every service whose policies changed is pushed a signed cache-clear
//! request on each of its cache-clear endpoints. Pushes that fail are
//! handed to the cache-invalidation [`RetryingDelivery`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use idp_common::protocol::{ClearCacheRequest, MessageHeader};
use idp_common::{
    IdentifierGenerator, MetadataResolver, PolicyAction, PolicyChange, PolicyDurableStore,
    ProtocolMessage, SignedMessageCodec, SigningIdentity,
};
use idp_delivery::RetryingDelivery;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedPolicy, PolicyCache};
use crate::error::{PolicyError, Result};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    /// Reason text carried in cache-clear requests
    pub clear_cache_reason: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            clear_cache_reason: "Authorization policy changed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub full_load: bool,
    pub applied: usize,
    pub skipped: usize,
    pub modified_services: Vec<String>,
    pub notified: usize,
    pub notify_failures: usize,
}

/// Signing context shared by outbound cache-clear requests
pub struct ClearCacheSigner {
    pub codec: Arc<dyn SignedMessageCodec>,
    pub identity: SigningIdentity,
    pub issuer: String,
    pub identifiers: Arc<dyn IdentifierGenerator>,
}

pub struct PolicyCacheSynchronizer {
    config: SyncConfig,
    cache: Arc<PolicyCache>,
    store: Arc<dyn PolicyDurableStore>,
    metadata: Arc<dyn MetadataResolver>,
    signer: ClearCacheSigner,
    retry: Arc<RetryingDelivery>,
    last_sequence_id: AtomicI64,
    initialized: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PolicyCacheSynchronizer {
    pub fn new(
        config: SyncConfig,
        cache: Arc<PolicyCache>,
        store: Arc<dyn PolicyDurableStore>,
        metadata: Arc<dyn MetadataResolver>,
        signer: ClearCacheSigner,
        retry: Arc<RetryingDelivery>,
    ) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(PolicyError::configuration(
                "policy poll interval must be greater than zero",
            ));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            cache,
            store,
            metadata,
            signer,
            retry,
            last_sequence_id: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn last_sequence_id(&self) -> i64 {
        self.last_sequence_id.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One synchronization cycle
    pub async fn poll_once(&self) -> Result<SyncReport> {
        let mut report = if self.is_initialized() {
            self.incremental_load().await?
        } else {
            self.full_load().await?
        };

        if !report.modified_services.is_empty() {
            let (notified, failures) = self.notify_modified(&report.modified_services).await;
            report.notified = notified;
            report.notify_failures = failures;
        }
        Ok(report)
    }

    async fn full_load(&self) -> Result<SyncReport> {
        let max_sequence_id = self.store.max_sequence_id().await?;
        if max_sequence_id <= 0 {
            return Err(PolicyError::EmptyStore(max_sequence_id));
        }

        let entries = self.store.fetch_all().await?;
        let mut report = SyncReport {
            full_load: true,
            ..Default::default()
        };

        let mut policies = Vec::with_capacity(entries.len());
        for entry in entries {
            let (service_id, policy_id) = (entry.service_id.clone(), entry.policy_id.clone());
            match CachedPolicy::from_entry(entry) {
                Ok(policy) => {
                    policies.push(policy);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(service_id = %service_id, policy_id = %policy_id, error = %e, "Skipping unparseable policy");
                    report.skipped += 1;
                }
            }
        }

        let touched = self.cache.replace_all(policies);
        report.modified_services = touched.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        self.last_sequence_id.store(max_sequence_id, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            sequence_id = max_sequence_id,
            policies = report.applied,
            skipped = report.skipped,
            "Policy cache fully loaded"
        );
        Ok(report)
    }

    async fn incremental_load(&self) -> Result<SyncReport> {
        let last = self.last_sequence_id();
        let latest = self.store.max_sequence_id().await?;
        if latest <= last {
            return Ok(SyncReport::default());
        }

        let changes = self.store.fetch_changes_since(last).await?;
        let mut report = SyncReport::default();
        let mut modified = BTreeSet::new();
        let mut observed = latest;

        for change in changes {
            observed = observed.max(change.entry.sequence_id);
            let service_id = change.entry.service_id.clone();
            if self.apply_change(change) {
                report.applied += 1;
                modified.insert(service_id);
            } else {
                report.skipped += 1;
            }
        }

        self.last_sequence_id.store(observed, Ordering::SeqCst);
        report.modified_services = modified.into_iter().collect();

        info!(
            from = last,
            to = observed,
            applied = report.applied,
            skipped = report.skipped,
            "Policy cache updated"
        );
        Ok(report)
    }

    /// Apply one change record, `false` if it left the cache untouched
    pub fn apply_change(&self, change: PolicyChange) -> bool {
        let PolicyChange { entry, action } = change;
        let (service_id, policy_id) = (entry.service_id.clone(), entry.policy_id.clone());

        match action {
            PolicyAction::Delete => {
                let removed = self.cache.remove(&service_id, &policy_id);
                if !removed {
                    debug!(service_id = %service_id, policy_id = %policy_id, "Delete of uncached policy ignored");
                }
                removed
            }
            PolicyAction::Add | PolicyAction::Update => {
                let policy = match CachedPolicy::from_entry(entry) {
                    Ok(policy) => policy,
                    Err(e) => {
                        warn!(service_id = %service_id, policy_id = %policy_id, error = %e, "Skipping unparseable policy");
                        return false;
                    }
                };
                if action == PolicyAction::Update {
                    self.cache.upsert(policy);
                    return true;
                }
                match self.cache.add(policy) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "Policy add anomaly, cache unchanged");
                        false
                    }
                }
            }
            PolicyAction::Unknown => {
                warn!(service_id = %service_id, policy_id = %policy_id, "Unknown policy change action, ignoring");
                false
            }
        }
    }

    async fn notify_modified(&self, services: &[String]) -> (usize, usize) {
        let mut notified = 0;
        let mut failures = 0;

        for service_id in services {
            let endpoints = match self.metadata.resolve_cache_clear_endpoints(service_id) {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "No cache-clear endpoints for modified service");
                    continue;
                }
            };

            for endpoint in endpoints.values() {
                match self.push_clear_cache(service_id, endpoint).await {
                    NotifyOutcome::Success => notified += 1,
                    NotifyOutcome::Failure => failures += 1,
                }
            }
        }
        (notified, failures)
    }

    fn build_clear_cache(&self, service_id: &str) -> Result<Vec<u8>> {
        let message = ProtocolMessage::ClearCacheRequest(ClearCacheRequest {
            header: MessageHeader::new(
                self.signer.identifiers.generate_message_id(),
                self.signer.issuer.clone(),
                Utc::now(),
            ),
            reason: self.config.clear_cache_reason.clone(),
            group_targets: self.cache.group_targets(service_id),
        });
        Ok(self.signer.codec.serialize(&message, &self.signer.identity)?)
    }

    async fn push_clear_cache(&self, service_id: &str, endpoint: &str) -> NotifyOutcome {
        let payload = match self.build_clear_cache(service_id) {
            Ok(payload) => payload,
            Err(e) => {
                error!(service_id, endpoint, error = %e, "Could not build cache-clear request");
                return NotifyOutcome::Failure;
            }
        };

        match self.retry.sender().send(endpoint, &payload).await {
            Ok(()) => {
                info!(service_id, endpoint, "Cache-clear delivered");
                NotifyOutcome::Success
            }
            Err(e) => {
                warn!(service_id, endpoint, error = %e, "Cache-clear failed, queued for retry");
                self.retry.record(endpoint, payload);
                NotifyOutcome::Failure
            }
        }
    }

    /// Explicit cache-clear push requested by a starting service
    pub async fn notify_service_starting(&self, service_id: &str, endpoint_index: u32) -> NotifyOutcome {
        let endpoint = match self.metadata.resolve_cache_clear_endpoints(service_id) {
            Ok(endpoints) => match endpoints.get(&endpoint_index) {
                Some(endpoint) => endpoint.clone(),
                None => {
                    warn!(service_id, endpoint_index, "Unknown cache-clear endpoint index");
                    return NotifyOutcome::Failure;
                }
            },
            Err(e) => {
                warn!(service_id, error = %e, "Cannot resolve cache-clear endpoints");
                return NotifyOutcome::Failure;
            }
        };

        info!(service_id, endpoint = %endpoint, "Service starting, pushing cache clear");
        self.push_clear_cache(service_id, &endpoint).await
    }

    /// Spawn the polling loop; the first tick runs immediately
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.config.poll_interval;

        info!(interval_secs = period.as_secs(), "Starting policy cache synchronizer");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("Policy cache synchronizer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !this.running.load(Ordering::SeqCst) {
                            break;
                        }
                        match this.poll_once().await {
                            Ok(report) => debug!(?report, "Policy sync cycle complete"),
                            Err(PolicyError::EmptyStore(seq)) => {
                                error!(sequence_id = seq, "Policy store is empty, cache not initialized");
                            }
                            Err(e) => error!(error = %e, "Policy sync cycle failed"),
                        }
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
