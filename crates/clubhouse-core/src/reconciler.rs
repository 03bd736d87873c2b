//! Periodic expiry reconciliation.

use crate::authority::{EntitlementAuthority, StripOutcome};
use crate::entitlement::EntitlementRegistry;
use crate::error::ClubhouseError;
use crate::types::{GuildId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// When a reconciled user's registry record is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Only after every attached scope stripped the role (or had nothing to strip).
    /// Failed users stay expired in the registry and are retried next tick.
    #[default]
    OnStripSuccess,
    /// Drop the record after the strip attempt regardless of its result.
    Always,
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between reconciliation passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on a single strip call
    #[serde(default = "default_strip_timeout_secs")]
    pub strip_timeout_secs: u64,

    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_strip_timeout_secs() -> u64 {
    10
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            strip_timeout_secs: default_strip_timeout_secs(),
            removal_policy: RemovalPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Reconciling,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub as_of: DateTime<Utc>,
    pub expired: Vec<UserId>,
    /// Users whose strip failed or timed out in at least one scope.
    pub failed: Vec<UserId>,
    /// Users whose registry record was removed.
    pub removed: Vec<UserId>,
}

impl ReconcileReport {
    fn empty(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            expired: Vec::new(),
            failed: Vec::new(),
            removed: Vec::new(),
        }
    }
}

pub struct ExpiryReconciler {
    registry: Arc<EntitlementRegistry>,
    authority: Arc<dyn EntitlementAuthority>,
    config: ReconcilerConfig,
    /// Held for the whole of a pass; at most one pass runs at a time.
    pass: Mutex<()>,
    state: RwLock<ReconcilerState>,
    last_report: RwLock<Option<ReconcileReport>>,
}

impl ExpiryReconciler {
    pub fn new(
        registry: Arc<EntitlementRegistry>,
        authority: Arc<dyn EntitlementAuthority>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            authority,
            config,
            pass: Mutex::new(()),
            state: RwLock::new(ReconcilerState::Idle),
            last_report: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> ReconcilerState {
        *self.state.read().await
    }

    pub async fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().await.clone()
    }

    /// Run a single pass: strip every expired user in every scope, then drop
    /// reconciled records with one persist. Waits for an in-flight pass first.
    ///
    /// Authority failures are logged per user and never abort the batch. A
    /// persistence failure is returned; the affected users are still expired and
    /// get picked up again on the next tick.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ClubhouseError> {
        let _pass = self.pass.lock().await;
        self.run_pass().await
    }

    /// Like [`reconcile_once`](Self::reconcile_once), but returns `Ok(None)`
    /// instead of waiting when another pass is in flight.
    pub async fn try_reconcile_once(&self) -> Result<Option<ReconcileReport>, ClubhouseError> {
        let Ok(_pass) = self.pass.try_lock() else {
            return Ok(None);
        };
        self.run_pass().await.map(Some)
    }

    async fn run_pass(&self) -> Result<ReconcileReport, ClubhouseError> {
        *self.state.write().await = ReconcilerState::Reconciling;

        let as_of = self.registry.now();
        let expired = self.registry.list_expired(as_of).await;
        let result = if expired.is_empty() {
            Ok(ReconcileReport::empty(as_of))
        } else {
            self.reconcile_batch(as_of, expired).await
        };

        *self.state.write().await = ReconcilerState::Idle;
        if let Ok(report) = &result {
            if !report.expired.is_empty() {
                *self.last_report.write().await = Some(report.clone());
            }
        }
        result
    }

    async fn reconcile_batch(
        &self,
        as_of: DateTime<Utc>,
        expired: Vec<UserId>,
    ) -> Result<ReconcileReport, ClubhouseError> {
        tracing::info!(count = expired.len(), "reconciling expired entitlements");

        let mut failed = BTreeSet::new();
        let mut renewed = BTreeSet::new();
        match self.authority.scopes().await {
            Ok(scopes) if scopes.is_empty() => {
                tracing::warn!("no authority scopes attached; strips deferred");
                failed.extend(expired.iter().copied());
            }
            Ok(scopes) => {
                for user in &expired {
                    let _guard = self.registry.lock_user(*user).await;
                    // Re-granted since the batch was listed: the fresh role stays.
                    if self
                        .registry
                        .query(*user)
                        .await
                        .map_or(true, |expiry| expiry > as_of)
                    {
                        tracing::debug!(
                            user_id = %user,
                            "entitlement changed mid-batch; skipping strip"
                        );
                        renewed.insert(*user);
                        continue;
                    }

                    for scope in &scopes {
                        if let Err(e) = self.strip_with_timeout(*scope, *user).await {
                            tracing::warn!(
                                guild_id = %scope,
                                user_id = %user,
                                error = %e,
                                "entitlement strip failed"
                            );
                            failed.insert(*user);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "listing authority scopes failed");
                failed.extend(expired.iter().copied());
            }
        }

        let removable: Vec<UserId> = expired
            .iter()
            .copied()
            .filter(|user| !renewed.contains(user))
            .filter(|user| {
                self.config.removal_policy == RemovalPolicy::Always || !failed.contains(user)
            })
            .collect();

        let removed = self
            .registry
            .remove_expired(&removable, as_of)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "persisting reconciled entitlements failed");
                e
            })?;

        tracing::info!(
            expired = expired.len(),
            failed = failed.len(),
            renewed = renewed.len(),
            removed = removed.len(),
            "reconciliation pass complete"
        );

        Ok(ReconcileReport {
            as_of,
            expired,
            failed: failed.into_iter().collect(),
            removed,
        })
    }

    async fn strip_with_timeout(
        &self,
        scope: GuildId,
        user: UserId,
    ) -> Result<StripOutcome, ClubhouseError> {
        let limit = Duration::from_secs(self.config.strip_timeout_secs.max(1));
        match tokio::time::timeout(limit, self.authority.strip(scope, user)).await {
            Ok(result) => result,
            Err(_) => Err(ClubhouseError::AuthorityTimeout {
                operation: "strip",
                user,
            }),
        }
    }

    /// Start the periodic loop. The first pass runs immediately.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = Duration::from_secs(self.config.interval_secs.max(1));

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "expiry reconciler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            tracing::error!(error = %e, "reconciliation pass failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("expiry reconciler stopped");
        });

        ReconcilerHandle { shutdown_tx, join }
    }
}

/// Owner handle for the background reconciler task.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop scheduling passes and wait for the task. An in-flight pass finishes first.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(true);
        self.join.await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
