//! Retrying create-or-mutate executor
//!
//! Every mutation follows the same loop:
//! 1. Fetch the current snapshot
//! 2. Missing: create `transform(empty)` once, no retry
//! 3. Present: `after = transform(before)`, then submit either a minimal JSON
//!    patch (guarded by `before`'s resource version) or a full update
//! 4. Conflict or any other store failure: pause, then start again from 1
//!
//! The patch is always computed against the snapshot fetched in the same
//! attempt, never a cached copy. An empty patch skips the write entirely.

use kube::Resource;
use tracing::{debug, error, info, warn};

use kmutate_core::{DiffEngine, ResourceIdentity, RetryPolicy};

use crate::error::{KubeError, Result};
use crate::snapshot::Snapshot;
use crate::store::ResourceStore;
use crate::wait::{Backoff, CancelToken, Pause};

/// How a present resource is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Diff and JSON-patch
    Patch,
    /// Full, version-checked replace
    Replace,
}

impl Mode {
    fn verb(self) -> &'static str {
        match self {
            Mode::Patch => "patch",
            Mode::Replace => "update",
        }
    }
}

/// What to do when the fetch reports the resource missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnMissing {
    Create,
    Fail,
}

/// Outcome of a failed attempt
enum Failure {
    /// Try again after a pause
    Retryable(KubeError),
    /// Give up and return this error as-is
    Terminal(KubeError),
}

impl Failure {
    fn into_inner(self) -> KubeError {
        match self {
            Failure::Retryable(e) | Failure::Terminal(e) => e,
        }
    }
}

impl From<KubeError> for Failure {
    fn from(e: KubeError) -> Self {
        if e.is_retryable() {
            Failure::Retryable(e)
        } else {
            Failure::Terminal(e)
        }
    }
}

/// Optimistic-concurrency mutation executor over a [`ResourceStore`]
pub struct MutationExecutor<S: ResourceStore> {
    store: S,
    policy: RetryPolicy,
    diff: DiffEngine,
    cancel: Option<CancelToken>,
}

impl<S: ResourceStore> MutationExecutor<S> {
    /// Create an executor with the default retry policy (50ms apart, 2s overall)
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            diff: DiffEngine::new(),
            cancel: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_diff_engine(mut self, diff: DiffEngine) -> Self {
        self.diff = diff;
        self
    }

    /// Abort retry pauses when `token` fires
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    // ========== Retrying operations ==========

    /// Create the resource, or patch it so it matches `transform(current)`
    ///
    /// Returns the stored result, or the unchanged snapshot when the transform
    /// is a no-op (no write is issued in that case).
    pub async fn ensure<F>(&self, identity: &ResourceIdentity, transform: F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.run(identity, Mode::Patch, OnMissing::Create, &transform)
            .await
    }

    /// Create the resource, or replace it with `transform(current)`
    ///
    /// Always writes when the resource exists, even if nothing changed.
    pub async fn ensure_by_replace<F>(
        &self,
        identity: &ResourceIdentity,
        transform: F,
    ) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.run(identity, Mode::Replace, OnMissing::Create, &transform)
            .await
    }

    /// Patch an existing resource; a missing resource is a `NotFound` error
    pub async fn try_patch<F>(&self, identity: &ResourceIdentity, transform: F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.run(identity, Mode::Patch, OnMissing::Fail, &transform)
            .await
    }

    /// Replace an existing resource; a missing resource is a `NotFound` error
    pub async fn try_update<F>(
        &self,
        identity: &ResourceIdentity,
        transform: F,
    ) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.run(identity, Mode::Replace, OnMissing::Fail, &transform)
            .await
    }

    // ========== Single-shot operations ==========

    /// One fetch then create-or-patch pass, without retries
    pub async fn create_or_patch<F>(
        &self,
        identity: &ResourceIdentity,
        transform: F,
    ) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.attempt(identity, Mode::Patch, OnMissing::Create, &transform)
            .await
            .map_err(Failure::into_inner)
    }

    /// Diff `current` against `transform(current)` and submit the patch
    ///
    /// No fetch and no retry: `current` must be a snapshot the caller just
    /// read, and a conflict is returned as-is.
    pub async fn patch_snapshot<F>(&self, current: &S::Object, transform: F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.submit_patch(current, &transform).await
    }

    // ========== Loop ==========

    async fn run<F>(
        &self,
        identity: &ResourceIdentity,
        mode: Mode,
        on_missing: OnMissing,
        transform: &F,
    ) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        self.policy.validate()?;

        let kind = S::Object::kind_name();
        let mut backoff = Backoff::new(&self.policy, self.cancel.as_ref());

        loop {
            if backoff.is_cancelled() {
                return Err(KubeError::Cancelled {
                    identity: identity.clone(),
                    attempts: backoff.attempts(),
                });
            }

            let attempt = backoff.next_attempt();
            let err = match self.attempt(identity, mode, on_missing, transform).await {
                Ok(obj) => return Ok(obj),
                Err(Failure::Terminal(e)) => return Err(e),
                Err(Failure::Retryable(e)) => e,
            };

            warn!(
                kind = %kind,
                resource = %identity,
                attempt,
                error = %err,
                "attempt to {} failed",
                mode.verb()
            );

            match backoff.wait().await {
                Pause::Retry => {}
                Pause::Exhausted => {
                    error!(
                        kind = %kind,
                        resource = %identity,
                        attempts = backoff.attempts(),
                        elapsed = ?backoff.elapsed(),
                        "giving up on {}",
                        mode.verb()
                    );
                    return Err(KubeError::RetryExhausted {
                        kind,
                        identity: identity.clone(),
                        operation: mode.verb(),
                        attempts: backoff.attempts(),
                        source: Box::new(err),
                    });
                }
                Pause::Cancelled => {
                    return Err(KubeError::Cancelled {
                        identity: identity.clone(),
                        attempts: backoff.attempts(),
                    });
                }
            }
        }
    }

    /// One fetch → (create | transform → submit) pass
    async fn attempt<F>(
        &self,
        identity: &ResourceIdentity,
        mode: Mode,
        on_missing: OnMissing,
        transform: &F,
    ) -> std::result::Result<S::Object, Failure>
    where
        F: Fn(S::Object) -> S::Object,
    {
        let before = match self.store.get(identity).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                return match on_missing {
                    OnMissing::Create => self
                        .create(identity, transform)
                        .await
                        .map_err(Failure::Terminal),
                    OnMissing::Fail => Err(Failure::Terminal(e)),
                };
            }
            // Fetch failures other than NotFound are retried like write failures
            Err(e) => return Err(Failure::Retryable(e)),
        };

        let result = match mode {
            Mode::Patch => self.submit_patch(&before, transform).await,
            Mode::Replace => self.submit_update(&before, transform).await,
        };
        result.map_err(Failure::from)
    }

    async fn create<F>(&self, identity: &ResourceIdentity, transform: &F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        let obj = transform(S::Object::empty(identity));
        ensure_same_identity(identity, &obj)?;

        info!(kind = %S::Object::kind_name(), resource = %identity, "creating");
        self.store.create(&obj).await
    }

    async fn submit_patch<F>(&self, before: &S::Object, transform: &F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        let identity = before.identity();
        let mut after = transform(before.clone());
        ensure_same_identity(&identity, &after)?;

        // The version is carried by the precondition, never by the diff
        after.meta_mut().resource_version = before.version_token();

        let patch = self.diff.compute_patch(before, &after)?;
        if patch.is_empty() {
            debug!(kind = %S::Object::kind_name(), resource = %identity, "no changes, skipping patch");
            return Ok(before.clone());
        }

        debug!(
            kind = %S::Object::kind_name(),
            resource = %identity,
            operations = patch.len(),
            patch = %patch,
            "patching"
        );
        self.store
            .patch(&identity, &patch, before.version_token().as_deref())
            .await
    }

    async fn submit_update<F>(&self, before: &S::Object, transform: &F) -> Result<S::Object>
    where
        F: Fn(S::Object) -> S::Object,
    {
        let identity = before.identity();
        let mut after = transform(before.clone());
        ensure_same_identity(&identity, &after)?;

        // The write is checked against the version that was read
        after.meta_mut().resource_version = before.version_token();

        debug!(kind = %S::Object::kind_name(), resource = %identity, "updating");
        self.store.update(&after).await
    }
}

fn ensure_same_identity<K: Snapshot>(expected: &ResourceIdentity, obj: &K) -> Result<()> {
    let actual = obj.identity();
    if actual != *expected {
        return Err(KubeError::IdentityMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MockStore, Operation};
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id() -> ResourceIdentity {
        ResourceIdentity::new("default", "settings")
    }

    fn seeded() -> MockStore<ConfigMap> {
        let mut cm = ConfigMap::empty(&id());
        cm.data = Some(BTreeMap::from([("mode".to_string(), "a".to_string())]));
        MockStore::with_objects(vec![cm])
    }

    fn set_mode(mode: &'static str) -> impl Fn(ConfigMap) -> ConfigMap {
        move |mut cm| {
            cm.data
                .get_or_insert_with(BTreeMap::new)
                .insert("mode".to_string(), mode.to_string());
            cm
        }
    }

    fn mode_of(cm: &ConfigMap) -> Option<&str> {
        cm.data.as_ref()?.get("mode").map(String::as_str)
    }

    #[tokio::test]
    async fn test_ensure_patches_existing() {
        let store = seeded();
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(3));

        let result = executor.ensure(&id(), set_mode("b")).await.unwrap();
        assert_eq!(mode_of(&result), Some("b"));

        let counts = store.operation_counts();
        assert_eq!(counts.gets, 1);
        assert_eq!(counts.patches, 1);
        assert_eq!(counts.updates, 0);
    }

    #[tokio::test]
    async fn test_ensure_by_replace_writes_even_when_unchanged() {
        let store = seeded();
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(3));

        let result = executor.ensure_by_replace(&id(), |cm| cm).await.unwrap();
        assert_eq!(mode_of(&result), Some("a"));
        assert_eq!(store.operation_counts().updates, 1);
        assert_eq!(store.operation_counts().patches, 0);
    }

    #[tokio::test]
    async fn test_replace_is_checked_against_read_version() {
        let store = seeded();
        // Another writer lands between our read and our write, every time
        store.fail_always(Operation::Get, Fault::ConcurrentWrite);
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(3));

        // A transform that drops the version must not turn the write unconditional
        let result = executor
            .ensure_by_replace(&id(), |mut cm: ConfigMap| {
                cm.metadata.resource_version = None;
                cm
            })
            .await;

        assert!(matches!(result, Err(KubeError::RetryExhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_patch_ignores_version_changes_from_transform() {
        let store = seeded();
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(3));

        // Clearing the version alone is not a change
        let result = executor
            .ensure(&id(), |mut cm: ConfigMap| {
                cm.metadata.resource_version = None;
                cm
            })
            .await
            .unwrap();
        assert!(result.version_token().is_some());
        assert_eq!(store.operation_counts().patches, 0);

        // Nor does rewriting it dodge the version check
        store.fail_always(Operation::Get, Fault::ConcurrentWrite);
        let result = executor
            .ensure(&id(), |cm: ConfigMap| {
                let mut cm = set_mode("b")(cm);
                cm.metadata.resource_version = Some("999999".to_string());
                cm
            })
            .await;
        assert!(matches!(result, Err(KubeError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(store.operation_counts().patches, 3);
    }

    #[tokio::test]
    async fn test_try_patch_missing_is_not_found() {
        let store: MockStore<ConfigMap> = MockStore::new();
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let result = executor.try_patch(&id(), set_mode("b")).await;
        assert!(matches!(result, Err(KubeError::NotFound { .. })));

        let counts = store.operation_counts();
        assert_eq!(counts.gets, 1);
        assert_eq!(counts.writes(), 0);
    }

    #[tokio::test]
    async fn test_try_update_retries_conflicts() {
        let store = seeded();
        store.fail_next(Operation::Update, Fault::Conflict, 2);
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let result = executor.try_update(&id(), set_mode("c")).await.unwrap();
        assert_eq!(mode_of(&result), Some("c"));
        assert_eq!(store.operation_counts().gets, 3);
        assert_eq!(store.operation_counts().updates, 3);
    }

    #[tokio::test]
    async fn test_create_or_patch_does_not_retry() {
        let store = seeded();
        store.fail_next(Operation::Patch, Fault::Conflict, 1);
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let result = executor.create_or_patch(&id(), set_mode("b")).await;
        assert!(matches!(result, Err(KubeError::Conflict { .. })));
        assert_eq!(store.operation_counts().gets, 1);
    }

    #[tokio::test]
    async fn test_create_or_patch_creates() {
        let store: MockStore<ConfigMap> = MockStore::new();
        let executor = MutationExecutor::new(store.clone());

        let created = executor.create_or_patch(&id(), set_mode("new")).await.unwrap();
        assert_eq!(mode_of(&created), Some("new"));
        assert_eq!(created.identity(), id());
    }

    #[tokio::test]
    async fn test_patch_snapshot() {
        let store = seeded();
        let executor = MutationExecutor::new(store.clone());
        let current = store.object(&id()).unwrap();

        let patched = executor.patch_snapshot(&current, set_mode("z")).await.unwrap();
        assert_eq!(mode_of(&patched), Some("z"));
        assert_eq!(store.operation_counts().gets, 0);

        // Stale snapshot: the version guard rejects it
        let result = executor.patch_snapshot(&current, set_mode("y")).await;
        assert!(matches!(result, Err(KubeError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_identity_change_is_fatal() {
        let store = seeded();
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let result = executor
            .ensure(&id(), |mut cm: ConfigMap| {
                cm.metadata.name = Some("renamed".to_string());
                cm
            })
            .await;

        assert!(matches!(result, Err(KubeError::IdentityMismatch { .. })));
        assert_eq!(store.operation_counts().gets, 1);
        assert_eq!(store.operation_counts().writes(), 0);
    }

    #[tokio::test]
    async fn test_transform_sees_fresh_state_each_attempt() {
        let store = seeded();
        store.fail_next(Operation::Get, Fault::ConcurrentWrite, 2);
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let calls = AtomicUsize::new(0);
        let seen_versions = std::sync::Mutex::new(Vec::new());
        let result = executor
            .ensure(&id(), |cm: ConfigMap| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen_versions
                    .lock()
                    .unwrap()
                    .push(cm.metadata.resource_version.clone());
                set_mode("b")(cm)
            })
            .await
            .unwrap();

        assert_eq!(mode_of(&result), Some("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let versions = seen_versions.into_inner().unwrap();
        assert_eq!(versions.len(), 3);
        assert_ne!(versions[0], versions[1]);
        assert_ne!(versions[1], versions[2]);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_retried() {
        let store = seeded();
        store.fail_next(Operation::Get, Fault::Unavailable("connection reset".into()), 2);
        let executor = MutationExecutor::new(store.clone()).with_policy(RetryPolicy::immediate(5));

        let result = executor.ensure(&id(), set_mode("b")).await.unwrap();
        assert_eq!(mode_of(&result), Some("b"));
        assert_eq!(store.operation_counts().gets, 3);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_stops_before_fetch() {
        let store = seeded();
        let token = CancelToken::new();
        token.cancel();
        let executor = MutationExecutor::new(store.clone()).with_cancel(token);

        let result = executor.ensure(&id(), set_mode("b")).await;
        assert!(matches!(result, Err(KubeError::Cancelled { attempts: 0, .. })));
        assert_eq!(store.operation_counts().gets, 0);
    }
}
