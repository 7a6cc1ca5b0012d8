//! Store backed by the Kubernetes API server
//!
//! Patches are submitted as `application/json-patch+json`. When an expected
//! version is given, a `replace /metadata/resourceVersion` operation is put
//! in front of the diff: the API server then treats the write as a
//! preconditioned update and answers 409 if the object moved on.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use kube::api::{Api, Patch as KubePatch, PatchParams, PostParams};
use serde_json::Value as JsonValue;
use std::marker::PhantomData;

use kmutate_core::{Patch, PatchOperation, ResourceIdentity};

use super::ResourceStore;
use crate::error::{KubeError, Result};
use crate::snapshot::Snapshot;

/// Default field manager recorded on every write
pub const FIELD_MANAGER: &str = "kmutate";

/// Pointer to the optimistic-concurrency token
const RESOURCE_VERSION_PATH: &str = "/metadata/resourceVersion";

/// `ResourceStore` over `kube::Api<K>` for a namespaced kind
pub struct ApiStore<K> {
    client: kube::Client,
    field_manager: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for ApiStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            field_manager: self.field_manager.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> ApiStore<K>
where
    K: Snapshot + Resource<Scope = NamespaceResourceScope>,
{
    /// Create a store for kind `K` on an existing client
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            field_manager: FIELD_MANAGER.to_string(),
            _kind: PhantomData,
        }
    }

    /// Create a store using the ambient kubeconfig / in-cluster config
    pub async fn try_default() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Record writes under a different field manager
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Get the underlying Kubernetes client
    pub fn kube_client(&self) -> &kube::Client {
        &self.client
    }

    /// Typed API handle; an empty namespace means the client's default
    fn api(&self, namespace: &str) -> Api<K> {
        if namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl<K> ResourceStore for ApiStore<K>
where
    K: Snapshot + Resource<Scope = NamespaceResourceScope>,
{
    type Object = K;

    async fn get(&self, identity: &ResourceIdentity) -> Result<K> {
        self.api(&identity.namespace)
            .get(&identity.name)
            .await
            .map_err(|e| classify::<K>(e, identity))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let identity = obj.identity();
        self.api(&identity.namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| classify::<K>(e, &identity))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let identity = obj.identity();
        self.api(&identity.namespace)
            .replace(&identity.name, &self.post_params(), obj)
            .await
            .map_err(|e| classify::<K>(e, &identity))
    }

    async fn patch(
        &self,
        identity: &ResourceIdentity,
        patch: &Patch,
        expected_version: Option<&str>,
    ) -> Result<K> {
        let body = guarded_patch(patch, expected_version)?;
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        self.api(&identity.namespace)
            .patch(
                &identity.name,
                &params,
                &KubePatch::<()>::Json(serde_json::from_value(body)?),
            )
            .await
            .map_err(|e| classify::<K>(e, identity))
    }
}

/// Wire body with the version precondition prepended
pub(crate) fn guarded_patch(patch: &Patch, expected_version: Option<&str>) -> Result<JsonValue> {
    let mut ops = Vec::with_capacity(patch.len() + 1);
    if let Some(version) = expected_version {
        ops.push(PatchOperation::replace(
            RESOURCE_VERSION_PATH,
            JsonValue::String(version.to_string()),
        ));
    }
    // The guard must stay the only op touching the version
    ops.extend(
        patch
            .iter()
            .filter(|op| expected_version.is_none() || op.path() != RESOURCE_VERSION_PATH)
            .cloned(),
    );
    Ok(Patch::from(ops).to_value()?)
}

/// Map 404/409 onto the typed variants the executor branches on
fn classify<K: Snapshot>(err: kube::Error, identity: &ResourceIdentity) -> KubeError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            KubeError::AlreadyExists {
                kind: K::kind_name(),
                identity: identity.clone(),
            }
        }
        kube::Error::Api(resp) if resp.code == 404 => KubeError::NotFound {
            kind: K::kind_name(),
            identity: identity.clone(),
        },
        kube::Error::Api(resp) if resp.code == 409 => KubeError::Conflict {
            kind: K::kind_name(),
            identity: identity.clone(),
            message: resp.message,
        },
        other => KubeError::Api(other),
    }
}
