//! Snapshot capability for resource types
//!
//! Any `kube::Resource` with static type information that can round-trip
//! through serde is a snapshot: all `k8s-openapi` types and every
//! `#[derive(CustomResource)]` type qualify without extra code.

use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use kmutate_core::ResourceIdentity;

/// Point-in-time copy of a stored resource
pub trait Snapshot:
    Resource<DynamicType = ()>
    + Clone
    + Default
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Namespace + name of this snapshot
    fn identity(&self) -> ResourceIdentity {
        let meta = self.meta();
        ResourceIdentity::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// Optimistic-concurrency token (`metadata.resourceVersion`)
    fn version_token(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    /// Default-valued resource carrying only `identity`
    fn empty(identity: &ResourceIdentity) -> Self {
        let mut obj = Self::default();
        let meta = obj.meta_mut();
        meta.name = Some(identity.name.clone());
        if identity.is_namespaced() {
            meta.namespace = Some(identity.namespace.clone());
        }
        obj
    }

    /// Kind used in logs and errors
    fn kind_name() -> String {
        Self::kind(&()).into_owned()
    }
}

impl<K> Snapshot for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Default
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}
