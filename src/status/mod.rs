//! Status write-back with conflict-safe retries
//!
//! The graph builder computes a [`StatusResult`] for every owned object it
//! observes; this module carries those verdicts back to the source store.
//! Guarantees:
//!
//! - **Deduplication**: a verdict equal to the last applied one (ignoring
//!   timestamps) is skipped entirely - no store write occurs.
//! - **Optimistic concurrency**: writes are preconditioned on the resource
//!   version the verdict was computed against. A conflict re-fetches the
//!   live object, skips if the live condition already matches, and retries
//!   with bounded backoff otherwise.
//! - **Per-object ordering**: each reconcile pass carries a cycle number;
//!   a pending write abandons itself once a newer cycle has enqueued a
//!   verdict for the same object. Combined with the resource-version
//!   precondition (every applied write bumps the version, forcing the
//!   straggler into the conflict path) an older verdict can never
//!   overwrite a newer one.
//! - **Bounded concurrency**: writes for different objects are dispatched
//!   concurrently up to a fixed limit; exhausted retries are logged and
//!   abandoned, never escalated - the next rebuild cycle self-heals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::cache::{Kind, ObjectKey};
use crate::crd::{
    Condition, ConditionStatus, TrellisCertificateDelegation, TrellisProxy,
};
use crate::retry::RetryConfig;
use crate::Error;

// =============================================================================
// Verdicts
// =============================================================================

/// Validity verdict for one object, computed each rebuild cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The object is well-formed and all cross-object invariants hold
    Valid,
    /// The object violates an invariant; reasons say which
    Invalid,
    /// The object declares routing intent but no root reaches it
    Orphaned,
}

impl Verdict {
    /// One-word summary for the status description field
    pub fn description(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Orphaned => "orphaned",
        }
    }
}

/// One object's verdict plus the evidence behind it
#[derive(Clone, Debug, PartialEq)]
pub struct StatusResult {
    /// The object this verdict belongs to
    pub key: ObjectKey,
    /// Resource version the verdict was computed against
    pub resource_version: String,
    /// The verdict
    pub verdict: Verdict,
    /// Human-readable reasons; empty for Valid
    pub reasons: Vec<String>,
}

impl StatusResult {
    /// Create a status result
    pub fn new(
        key: ObjectKey,
        resource_version: impl Into<String>,
        verdict: Verdict,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            key,
            resource_version: resource_version.into(),
            verdict,
            reasons,
        }
    }

    /// Render the verdict as a status condition
    pub fn condition(&self) -> Condition {
        match self.verdict {
            Verdict::Valid => Condition::new(
                "Valid",
                ConditionStatus::True,
                "Valid",
                format!("valid {}", self.key.kind),
            ),
            Verdict::Invalid => Condition::new(
                "Valid",
                ConditionStatus::False,
                "Invalid",
                self.reasons.join("; "),
            ),
            Verdict::Orphaned => Condition::new(
                "Valid",
                ConditionStatus::False,
                "Orphaned",
                "not delegated from any root proxy",
            ),
        }
    }
}

// =============================================================================
// Store seam
// =============================================================================

/// Outcome of a conditional status write. Conflict and NotFound are
/// ordinary values, not errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied
    Applied,
    /// The precondition failed; the object moved underneath us
    Conflict,
    /// The object no longer exists; treated as a no-op
    NotFound,
}

/// Trait abstracting conditional status writes against the source store
///
/// This trait allows mocking the store in tests while using the real
/// Kubernetes client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write `condition` to the object's status iff its resource version
    /// still equals `expected_resource_version`
    async fn update_status(
        &self,
        key: &ObjectKey,
        expected_resource_version: &str,
        description: &str,
        condition: &Condition,
    ) -> Result<WriteOutcome, Error>;

    /// Fetch the live object's resource version and current condition;
    /// None if the object is gone
    async fn get_current(&self, key: &ObjectKey)
        -> Result<Option<(String, Option<Condition>)>, Error>;
}

/// Real store implementation backed by the Kubernetes API
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn status_patch(
        expected_resource_version: &str,
        description: &str,
        condition: &Condition,
    ) -> serde_json::Value {
        serde_json::json!({
            "metadata": { "resourceVersion": expected_resource_version },
            "status": {
                "description": description,
                "conditions": [condition],
            }
        })
    }

    fn classify(err: kube::Error) -> Result<WriteOutcome, Error> {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => Ok(WriteOutcome::Conflict),
            kube::Error::Api(ref ae) if ae.code == 404 => Ok(WriteOutcome::NotFound),
            other => Err(other.into()),
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn update_status(
        &self,
        key: &ObjectKey,
        expected_resource_version: &str,
        description: &str,
        condition: &Condition,
    ) -> Result<WriteOutcome, Error> {
        let patch = Self::status_patch(expected_resource_version, description, condition);
        let params = PatchParams::default();
        let outcome = match key.kind {
            Kind::Proxy => {
                let api: Api<TrellisProxy> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                api.patch_status(&key.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            Kind::Delegation => {
                let api: Api<TrellisCertificateDelegation> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                api.patch_status(&key.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            other => {
                return Err(Error::validation(format!(
                    "status writes are not supported for kind {other}"
                )))
            }
        };
        match outcome {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(e) => Self::classify(e),
        }
    }

    async fn get_current(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<(String, Option<Condition>)>, Error> {
        match key.kind {
            Kind::Proxy => {
                let api: Api<TrellisProxy> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                let obj = api.get_opt(&key.name).await?;
                Ok(obj.map(|o| {
                    (
                        o.metadata.resource_version.unwrap_or_default(),
                        o.status.and_then(|s| s.conditions.into_iter().next()),
                    )
                }))
            }
            Kind::Delegation => {
                let api: Api<TrellisCertificateDelegation> =
                    Api::namespaced(self.client.clone(), &key.namespace);
                let obj = api.get_opt(&key.name).await?;
                Ok(obj.map(|o| {
                    (
                        o.metadata.resource_version.unwrap_or_default(),
                        o.status.and_then(|s| s.conditions.into_iter().next()),
                    )
                }))
            }
            other => Err(Error::validation(format!(
                "status reads are not supported for kind {other}"
            ))),
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Writes rebuild verdicts back to the source store
pub struct StatusReconciler<S: StatusStore> {
    store: Arc<S>,
    retry: RetryConfig,
    concurrency: usize,
    /// Last condition known applied per object, for write dedup
    last_applied: Mutex<HashMap<ObjectKey, Condition>>,
    /// Newest cycle that enqueued a verdict per object
    latest_cycle: Mutex<HashMap<ObjectKey, u64>>,
    cycle: AtomicU64,
}

impl<S: StatusStore> StatusReconciler<S> {
    /// Default number of concurrent status writes
    pub const DEFAULT_CONCURRENCY: usize = 8;

    /// Create a reconciler over the given store
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            concurrency: Self::DEFAULT_CONCURRENCY,
            last_applied: Mutex::new(HashMap::new()),
            latest_cycle: Mutex::new(HashMap::new()),
            cycle: AtomicU64::new(0),
        }
    }

    /// Apply one rebuild cycle's verdicts.
    ///
    /// Never fails: transient store errors are retried with backoff and
    /// ultimately logged and abandoned. Safe to run concurrently with the
    /// next rebuild's input gathering.
    pub async fn reconcile(&self, statuses: Vec<StatusResult>) {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;

        let pending: Vec<StatusResult> = {
            let last = self.last_applied.lock().expect("last_applied poisoned");
            statuses
                .into_iter()
                .filter(|s| match last.get(&s.key) {
                    Some(applied) => !applied.same_verdict(&s.condition()),
                    None => true,
                })
                .collect()
        };

        {
            let mut latest = self.latest_cycle.lock().expect("latest_cycle poisoned");
            for status in &pending {
                latest.insert(status.key.clone(), cycle);
            }
        }

        if pending.is_empty() {
            debug!(cycle, "no status changes to reconcile");
            return;
        }

        debug!(cycle, writes = pending.len(), "reconciling status results");
        futures::stream::iter(pending)
            .for_each_concurrent(self.concurrency, |status| self.apply_one(status, cycle))
            .await;
    }

    fn superseded(&self, key: &ObjectKey, cycle: u64) -> bool {
        self.latest_cycle
            .lock()
            .expect("latest_cycle poisoned")
            .get(key)
            .is_some_and(|latest| *latest > cycle)
    }

    fn record_applied(&self, key: &ObjectKey, condition: Condition) {
        self.last_applied
            .lock()
            .expect("last_applied poisoned")
            .insert(key.clone(), condition);
    }

    async fn apply_one(&self, status: StatusResult, cycle: u64) {
        let condition = status.condition();
        let description = status.verdict.description();
        let mut expected = status.resource_version.clone();
        let mut attempt = 0u32;

        loop {
            if self.superseded(&status.key, cycle) {
                debug!(object = %status.key, cycle, "status write superseded, abandoning");
                return;
            }

            match self
                .store
                .update_status(&status.key, &expected, description, &condition)
                .await
            {
                Ok(WriteOutcome::Applied) => {
                    debug!(object = %status.key, verdict = description, "status applied");
                    self.record_applied(&status.key, condition);
                    return;
                }
                Ok(WriteOutcome::NotFound) => {
                    // Deleted concurrently; the watch path will drop it
                    // from the cache and the next cycle forgets it.
                    debug!(object = %status.key, "object gone, skipping status write");
                    self.last_applied
                        .lock()
                        .expect("last_applied poisoned")
                        .remove(&status.key);
                    return;
                }
                Ok(WriteOutcome::Conflict) => {
                    match self.store.get_current(&status.key).await {
                        Ok(Some((live_version, live_condition))) => {
                            if live_condition
                                .as_ref()
                                .is_some_and(|live| live.same_verdict(&condition))
                            {
                                // Someone (often our own racing write) already
                                // landed this verdict.
                                self.record_applied(&status.key, condition);
                                return;
                            }
                            expected = live_version;
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(object = %status.key, error = %e, "re-fetch after conflict failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(object = %status.key, error = %e, "status write failed");
                }
            }

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                warn!(
                    object = %status.key,
                    attempts = attempt,
                    "status write exhausted retries, giving up until next rebuild"
                );
                return;
            }
            tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn proxy_key(namespace: &str, name: &str) -> ObjectKey {
        ObjectKey::new(Kind::Proxy, namespace, name)
    }

    fn valid_result(namespace: &str, name: &str, rv: &str) -> StatusResult {
        StatusResult::new(proxy_key(namespace, name), rv, Verdict::Valid, vec![])
    }

    fn invalid_result(namespace: &str, name: &str, rv: &str, reason: &str) -> StatusResult {
        StatusResult::new(
            proxy_key(namespace, name),
            rv,
            Verdict::Invalid,
            vec![reason.to_string()],
        )
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_condition_rendering() {
        let valid = valid_result("shop", "storefront", "1").condition();
        assert_eq!(valid.status, ConditionStatus::True);
        assert_eq!(valid.reason, "Valid");

        let invalid =
            invalid_result("shop", "storefront", "1", "hostname conflict: taken").condition();
        assert_eq!(invalid.status, ConditionStatus::False);
        assert!(invalid.message.contains("hostname conflict"));

        let orphaned = StatusResult::new(proxy_key("shop", "x"), "1", Verdict::Orphaned, vec![]);
        assert_eq!(orphaned.condition().reason, "Orphaned");
    }

    #[tokio::test]
    async fn test_write_applied_once_then_deduplicated() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::Applied));

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
        // Same verdict on a later cycle: no further store call (mock would
        // panic on a second invocation).
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "2")])
            .await;
    }

    #[tokio::test]
    async fn test_changed_verdict_is_written_again() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .times(2)
            .returning(|_, _, _, _| Ok(WriteOutcome::Applied));

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
        reconciler
            .reconcile(vec![invalid_result("shop", "storefront", "2", "hostname conflict")])
            .await;
    }

    #[tokio::test]
    async fn test_conflict_refetches_and_retries_with_live_version() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .withf(|_, expected, _, _| expected == "1")
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::Conflict));
        store
            .expect_get_current()
            .times(1)
            .returning(|_| Ok(Some(("7".to_string(), None))));
        store
            .expect_update_status()
            .withf(|_, expected, _, _| expected == "7")
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::Applied));

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
    }

    #[tokio::test]
    async fn test_conflict_skips_rewrite_when_live_condition_matches() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::Conflict));
        store.expect_get_current().times(1).returning(|_| {
            let live = Condition::new(
                "Valid",
                ConditionStatus::True,
                "Valid",
                "valid TrellisProxy",
            );
            Ok(Some(("9".to_string(), Some(live))))
        });

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
        // And the observed live value now counts as applied for dedup.
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "9")])
            .await;
    }

    #[tokio::test]
    async fn test_not_found_is_a_noop() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::NotFound));

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
    }

    #[tokio::test]
    async fn test_persistent_conflict_exhausts_and_gives_up() {
        let mut store = MockStatusStore::new();
        store
            .expect_update_status()
            .times(3)
            .returning(|_, _, _, _| Ok(WriteOutcome::Conflict));
        store
            .expect_get_current()
            .times(3)
            .returning(|_| Ok(Some(("99".to_string(), None))));

        let reconciler = StatusReconciler::new(Arc::new(store), fast_retry(3));
        // Completes despite never applying; exhaustion is logged, not raised.
        reconciler
            .reconcile(vec![valid_result("shop", "storefront", "1")])
            .await;
    }

    /// Hand-rolled store that parks the first write on a gate, so a newer
    /// cycle can overtake it deterministically.
    mod supersession {
        use super::*;
        use std::sync::atomic::AtomicU32;
        use tokio::sync::Notify;

        struct GateStore {
            gate: Arc<Notify>,
            calls: AtomicU32,
            applied_descriptions: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl StatusStore for GateStore {
            async fn update_status(
                &self,
                _key: &ObjectKey,
                _expected: &str,
                description: &str,
                _condition: &Condition,
            ) -> Result<WriteOutcome, Error> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    // First (older-cycle) write stalls, then conflicts.
                    self.gate.notified().await;
                    return Ok(WriteOutcome::Conflict);
                }
                self.applied_descriptions
                    .lock()
                    .expect("lock")
                    .push(description.to_string());
                Ok(WriteOutcome::Applied)
            }

            async fn get_current(
                &self,
                _key: &ObjectKey,
            ) -> Result<Option<(String, Option<Condition>)>, Error> {
                Ok(Some(("42".to_string(), None)))
            }
        }

        #[tokio::test]
        async fn test_older_cycle_abandons_after_supersession() {
            let gate = Arc::new(Notify::new());
            let store = Arc::new(GateStore {
                gate: gate.clone(),
                calls: AtomicU32::new(0),
                applied_descriptions: Mutex::new(Vec::new()),
            });
            let reconciler = Arc::new(StatusReconciler::new(store.clone(), fast_retry(5)));

            let older = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    reconciler
                        .reconcile(vec![valid_result("shop", "storefront", "1")])
                        .await;
                })
            };
            // Let the older write reach the gate before enqueueing cycle 2.
            tokio::task::yield_now().await;

            reconciler
                .reconcile(vec![invalid_result("shop", "storefront", "2", "hostname conflict")])
                .await;

            // Release the stalled older write; it must see itself
            // superseded after its conflict and abandon.
            gate.notify_one();
            older.await.expect("older reconcile task");

            let applied = store.applied_descriptions.lock().expect("lock").clone();
            assert_eq!(applied, vec!["invalid".to_string()]);
        }
    }
}
