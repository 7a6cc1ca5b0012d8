//! Mock store for testing
//!
//! This store keeps objects in memory with real optimistic-concurrency
//! semantics: every write stamps a fresh `resourceVersion`, and stale
//! updates or patches are rejected with a conflict. Faults can be injected
//! per operation to exercise retry paths without a cluster.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kmutate_core::{Patch, ResourceIdentity};

use super::ResourceStore;
use crate::error::{KubeError, Result};
use crate::snapshot::Snapshot;

/// Store operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Create,
    Update,
    Patch,
}

/// Failure injected into a store operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reject with a version conflict
    Conflict,
    /// Report the resource as missing
    NotFound,
    /// Fail with a generic server-side error
    Unavailable(String),
    /// Another writer bumps the stored version: right after a `Get`, or
    /// just before a write is checked
    ConcurrentWrite,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub creates: usize,
    pub updates: usize,
    pub patches: usize,
}

impl OperationCounts {
    /// Creates, updates and patches
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.patches
    }
}

#[derive(Debug, Default)]
struct Faults {
    queued: HashMap<Operation, VecDeque<Fault>>,
    persistent: HashMap<Operation, Fault>,
}

/// In-memory, version-checked store
pub struct MockStore<K> {
    objects: Arc<RwLock<HashMap<ResourceIdentity, K>>>,
    last_version: Arc<AtomicU64>,
    faults: Arc<Mutex<Faults>>,
    operations: Arc<RwLock<OperationCounts>>,
}

impl<K> Clone for MockStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            last_version: Arc::clone(&self.last_version),
            faults: Arc::clone(&self.faults),
            operations: Arc::clone(&self.operations),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Snapshot> MockStore<K> {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            last_version: Arc::new(AtomicU64::new(0)),
            faults: Arc::new(Mutex::new(Faults::default())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
        }
    }

    /// Create with pre-populated objects
    pub fn with_objects(objects: Vec<K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    /// Seed from a multi-document YAML manifest
    pub fn from_manifest(manifest: &str) -> Result<Self> {
        let store = Self::new();

        for (index, doc) in manifest.split("\n---").enumerate() {
            let doc = doc.trim().trim_start_matches("---").trim();
            if doc
                .lines()
                .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
            {
                continue;
            }

            let obj: K = serde_yaml::from_str(doc).map_err(|e| {
                KubeError::Serialization(format!("failed to parse document {}: {}", index, e))
            })?;
            store.insert(obj);
        }

        Ok(store)
    }

    /// Store `obj` directly (no faults, no counting), stamping a fresh version
    pub fn insert(&self, mut obj: K) -> K {
        self.stamp(&mut obj);
        write(&self.objects).insert(obj.identity(), obj.clone());
        obj
    }

    /// Simulate an external writer (controller, another client)
    ///
    /// Returns the new state, or `None` if the object does not exist.
    pub fn modify(&self, identity: &ResourceIdentity, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut objects = write(&self.objects);
        let obj = objects.get_mut(identity)?;
        f(obj);
        self.stamp(obj);
        Some(obj.clone())
    }

    /// Current stored state
    pub fn object(&self, identity: &ResourceIdentity) -> Option<K> {
        read(&self.objects).get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        read(&self.operations).clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        *write(&self.operations) = OperationCounts::default();
    }

    /// Inject `fault` into the next `times` calls of `op`
    pub fn fail_next(&self, op: Operation, fault: Fault, times: usize) {
        let mut faults = lock(&self.faults);
        let queue = faults.queued.entry(op).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    /// Inject `fault` into every call of `op` once queued faults run out
    pub fn fail_always(&self, op: Operation, fault: Fault) {
        lock(&self.faults).persistent.insert(op, fault);
    }

    pub fn clear_faults(&self) {
        let mut faults = lock(&self.faults);
        faults.queued.clear();
        faults.persistent.clear();
    }

    fn stamp(&self, obj: &mut K) {
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    fn bump(&self, identity: &ResourceIdentity) {
        self.modify(identity, |_| {});
    }

    fn count(&self, op: Operation) {
        let mut ops = write(&self.operations);
        match op {
            Operation::Get => ops.gets += 1,
            Operation::Create => ops.creates += 1,
            Operation::Update => ops.updates += 1,
            Operation::Patch => ops.patches += 1,
        }
    }

    /// Count the call and pop the fault that applies to it
    fn begin(&self, op: Operation) -> Option<Fault> {
        self.count(op);
        let mut faults = lock(&self.faults);
        if let Some(fault) = faults.queued.get_mut(&op).and_then(VecDeque::pop_front) {
            return Some(fault);
        }
        faults.persistent.get(&op).cloned()
    }

    fn fault_error(&self, fault: &Fault, identity: &ResourceIdentity) -> Option<KubeError> {
        match fault {
            Fault::Conflict => Some(self.conflict(identity, "injected conflict")),
            Fault::NotFound => Some(self.not_found(identity)),
            Fault::Unavailable(message) => Some(KubeError::Store(message.clone())),
            Fault::ConcurrentWrite => None,
        }
    }

    fn not_found(&self, identity: &ResourceIdentity) -> KubeError {
        KubeError::NotFound {
            kind: K::kind_name(),
            identity: identity.clone(),
        }
    }

    fn conflict(&self, identity: &ResourceIdentity, message: &str) -> KubeError {
        KubeError::Conflict {
            kind: K::kind_name(),
            identity: identity.clone(),
            message: message.to_string(),
        }
    }

    /// Shared prologue of write operations
    fn begin_write(&self, op: Operation, identity: &ResourceIdentity) -> Result<()> {
        match self.begin(op) {
            Some(Fault::ConcurrentWrite) => {
                self.bump(identity);
                Ok(())
            }
            Some(fault) => match self.fault_error(&fault, identity) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn check_version(
        &self,
        identity: &ResourceIdentity,
        stored: &K,
        expected: Option<&str>,
    ) -> Result<()> {
        match (expected, stored.version_token()) {
            (Some(expected), Some(current)) if expected != current => Err(self.conflict(
                identity,
                &format!(
                    "the object has been modified: expected version {}, stored {}",
                    expected, current
                ),
            )),
            _ => Ok(()),
        }
    }
}

impl<K: Snapshot> Default for MockStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Snapshot> ResourceStore for MockStore<K> {
    type Object = K;

    async fn get(&self, identity: &ResourceIdentity) -> Result<K> {
        let fault = self.begin(Operation::Get);
        if let Some(err) = fault.as_ref().and_then(|f| self.fault_error(f, identity)) {
            return Err(err);
        }

        let obj = self
            .object(identity)
            .ok_or_else(|| self.not_found(identity))?;

        if fault == Some(Fault::ConcurrentWrite) {
            self.bump(identity);
        }
        Ok(obj)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let identity = obj.identity();
        self.begin_write(Operation::Create, &identity)?;

        let mut objects = write(&self.objects);
        if objects.contains_key(&identity) {
            return Err(KubeError::AlreadyExists {
                kind: K::kind_name(),
                identity,
            });
        }

        let mut created = obj.clone();
        self.stamp(&mut created);
        objects.insert(identity, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let identity = obj.identity();
        self.begin_write(Operation::Update, &identity)?;

        let mut objects = write(&self.objects);
        let stored = objects
            .get(&identity)
            .ok_or_else(|| self.not_found(&identity))?;
        self.check_version(&identity, stored, obj.version_token().as_deref())?;

        let mut updated = obj.clone();
        self.stamp(&mut updated);
        objects.insert(identity, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        identity: &ResourceIdentity,
        patch: &Patch,
        expected_version: Option<&str>,
    ) -> Result<K> {
        self.begin_write(Operation::Patch, identity)?;

        let mut objects = write(&self.objects);
        let stored = objects
            .get(identity)
            .ok_or_else(|| self.not_found(identity))?;
        self.check_version(identity, stored, expected_version)?;

        let doc = serde_json::to_value(stored)?;
        let patched_doc = patch
            .apply(&doc)
            .map_err(|e| KubeError::Store(format!("patch rejected: {}", e)))?;
        let mut patched: K = serde_json::from_value(patched_doc)?;

        if patched.identity() != *identity {
            return Err(KubeError::Store(format!(
                "patch may not change identity of '{}'",
                identity
            )));
        }

        self.stamp(&mut patched);
        objects.insert(identity.clone(), patched.clone());
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kmutate_core::PatchOperation;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
        let mut cm = ConfigMap::empty(&ResourceIdentity::new(namespace, name));
        cm.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        cm
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MockStore::new();
        let created = store
            .create(&config_map("default", "settings", &[("a", "1")]))
            .await
            .unwrap();
        assert_eq!(created.version_token().as_deref(), Some("1"));

        let fetched = store
            .get(&ResourceIdentity::new("default", "settings"))
            .await
            .unwrap();
        assert_eq!(fetched.data, created.data);

        let counts = store.operation_counts();
        assert_eq!(counts.creates, 1);
        assert_eq!(counts.gets, 1);
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let result = store.create(&config_map("default", "settings", &[])).await;
        assert!(matches!(result, Err(KubeError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store: MockStore<ConfigMap> = MockStore::new();
        let result = store.get(&ResourceIdentity::new("default", "nope")).await;
        assert!(matches!(result, Err(KubeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let id = ResourceIdentity::new("default", "settings");

        let mut current = store.get(&id).await.unwrap();
        store.modify(&id, |cm| cm.data = None);

        current.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let result = store.update(&current).await;
        assert!(matches!(result, Err(KubeError::Conflict { .. })));

        let fresh = store.get(&id).await.unwrap();
        let mut next = fresh.clone();
        next.data = current.data.clone();
        let updated = store.update(&next).await.unwrap();
        assert_ne!(updated.version_token(), fresh.version_token());
    }

    #[tokio::test]
    async fn test_patch_applies_and_bumps_version() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[("a", "1")])]);
        let id = ResourceIdentity::new("default", "settings");
        let before = store.get(&id).await.unwrap();

        let patch = Patch::from(vec![PatchOperation::add("/data/b", json!("2"))]);
        let after = store
            .patch(&id, &patch, before.version_token().as_deref())
            .await
            .unwrap();

        let data = after.data.unwrap();
        assert_eq!(data.get("b").map(String::as_str), Some("2"));
        assert_ne!(after.metadata.resource_version, before.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_patch_with_stale_version_conflicts() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let id = ResourceIdentity::new("default", "settings");

        let patch = Patch::from(vec![PatchOperation::add("/data/b", json!("2"))]);
        let result = store.patch(&id, &patch, Some("999")).await;
        assert!(matches!(result, Err(KubeError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_queued_faults_run_out() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let id = ResourceIdentity::new("default", "settings");
        store.fail_next(Operation::Get, Fault::Unavailable("etcd".into()), 2);

        assert!(matches!(store.get(&id).await, Err(KubeError::Store(_))));
        assert!(matches!(store.get(&id).await, Err(KubeError::Store(_))));
        assert!(store.get(&id).await.is_ok());
        assert_eq!(store.operation_counts().gets, 3);
    }

    #[tokio::test]
    async fn test_persistent_fault() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let id = ResourceIdentity::new("default", "settings");
        store.fail_always(Operation::Patch, Fault::Conflict);

        for _ in 0..3 {
            let result = store.patch(&id, &Patch::new(), None).await;
            assert!(matches!(result, Err(KubeError::Conflict { .. })));
        }

        store.clear_faults();
        assert!(store.patch(&id, &Patch::new(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_write_after_get() {
        let store = MockStore::with_objects(vec![config_map("default", "settings", &[])]);
        let id = ResourceIdentity::new("default", "settings");
        store.fail_next(Operation::Get, Fault::ConcurrentWrite, 1);

        let seen = store.get(&id).await.unwrap();
        let stored = store.object(&id).unwrap();
        assert_ne!(seen.version_token(), stored.version_token());
    }

    #[tokio::test]
    async fn test_from_manifest() {
        let store: MockStore<ConfigMap> = MockStore::from_manifest(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: one
  namespace: default
data:
  key: value
---
# comment only
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: two
  namespace: default
"#,
        )
        .unwrap();

        assert_eq!(store.len(), 2);
        let one = store.object(&ResourceIdentity::new("default", "one")).unwrap();
        assert_eq!(one.data.unwrap().get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_writes_total() {
        let counts = OperationCounts {
            gets: 4,
            creates: 1,
            updates: 2,
            patches: 3,
        };
        assert_eq!(counts.writes(), 6);
    }
}
