//! Store capability set consumed by the executor and the readiness waiter
//!
//! kmutate ships two stores:
//! - **Api** (default): a thin adapter over `kube::Api<K>`
//! - **Mock**: an in-memory, version-checked store for tests
//!
//! Stores report a missing resource as [`KubeError::NotFound`] and a stale
//! write as [`KubeError::Conflict`]; the executor relies on that
//! classification to decide between create, retry and give up.

mod api;
mod mock;

pub use api::{ApiStore, FIELD_MANAGER};
pub use mock::{Fault, MockStore, Operation, OperationCounts};

use async_trait::async_trait;

use kmutate_core::{Patch, ResourceIdentity};

use crate::error::Result;
use crate::snapshot::Snapshot;

/// Versioned, server-authoritative resource store
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Resource type served by this store
    type Object: Snapshot;

    /// Fetch the current state of a resource
    async fn get(&self, identity: &ResourceIdentity) -> Result<Self::Object>;

    /// Create a resource; identity is taken from the object's metadata
    async fn create(&self, obj: &Self::Object) -> Result<Self::Object>;

    /// Replace a resource, rejecting the write if `obj`'s version is stale
    async fn update(&self, obj: &Self::Object) -> Result<Self::Object>;

    /// Apply a JSON patch, rejecting it if the stored version differs from
    /// `expected_version`
    async fn patch(
        &self,
        identity: &ResourceIdentity,
        patch: &Patch,
        expected_version: Option<&str>,
    ) -> Result<Self::Object>;
}
