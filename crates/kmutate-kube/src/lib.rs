//! kmutate Kube - optimistic-concurrency mutation of Kubernetes resources
//!
//! This crate provides:
//! - **Mutation Executor**: create-or-patch and create-or-replace with conflict retries
//! - **Readiness Waiter**: poll a resource until its observed state satisfies a predicate
//! - **Stores**: `kube::Api` adapter and an in-memory, version-checked mock
//! - **Cancellation**: a shared token that cuts retry pauses and polls short
//!
//! ```no_run
//! use k8s_openapi::api::apps::v1::Deployment;
//! use kmutate_kube::readiness::predicates::replicas_ready;
//! use kmutate_kube::{ApiStore, MutationExecutor, ReadinessWaiter, ResourceIdentity, RetryPolicy};
//!
//! # async fn run() -> kmutate_kube::Result<()> {
//! let store: ApiStore<Deployment> = ApiStore::try_default().await?;
//! let id = ResourceIdentity::new("default", "web");
//!
//! MutationExecutor::new(store.clone())
//!     .ensure(&id, |mut deploy| {
//!         deploy.spec.get_or_insert_with(Default::default).replicas = Some(3);
//!         deploy
//!     })
//!     .await?;
//!
//! ReadinessWaiter::new(store)
//!     .wait_until_ready(&id, replicas_ready, &RetryPolicy::readiness())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod readiness;
pub mod snapshot;
pub mod store;
pub mod wait;

pub use error::{KubeError, Result};
pub use executor::MutationExecutor;
pub use readiness::ReadinessWaiter;
pub use snapshot::Snapshot;
pub use store::{
    ApiStore, FIELD_MANAGER, Fault, MockStore, Operation, OperationCounts, ResourceStore,
};
pub use wait::CancelToken;

// Core building blocks callers need alongside the executor
pub use kmutate_core::{DiffEngine, Patch, PatchOperation, ResourceIdentity, RetryPolicy};
