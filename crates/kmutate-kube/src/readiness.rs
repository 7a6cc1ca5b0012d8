//! Readiness polling
//!
//! [`ReadinessWaiter`] re-fetches a resource on the policy's interval until a
//! predicate over the observed state holds. Fetch failures (including a
//! resource that does not exist yet) count as "not ready" rather than
//! aborting the wait.

use tracing::debug;

use kmutate_core::{ResourceIdentity, RetryPolicy};

use crate::error::{KubeError, Result};
use crate::snapshot::Snapshot;
use crate::store::ResourceStore;
use crate::wait::{Backoff, CancelToken, Pause};

/// Polls a store until a resource reaches the desired observed state
pub struct ReadinessWaiter<S: ResourceStore> {
    store: S,
    cancel: Option<CancelToken>,
}

impl<S: ResourceStore> ReadinessWaiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cancel: None,
        }
    }

    /// Abort polling when `token` fires
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Wait until `predicate` holds for the stored resource
    ///
    /// The first poll happens immediately. Returns `Timeout` once the policy's
    /// deadline passes (or its poll count runs out) without the predicate
    /// holding.
    pub async fn wait_until_ready<P>(
        &self,
        identity: &ResourceIdentity,
        predicate: P,
        policy: &RetryPolicy,
    ) -> Result<()>
    where
        P: Fn(&S::Object) -> bool,
    {
        policy.validate()?;

        let kind = S::Object::kind_name();
        let mut backoff = Backoff::new(policy, self.cancel.as_ref());

        loop {
            if backoff.is_cancelled() {
                return Err(KubeError::Cancelled {
                    identity: identity.clone(),
                    attempts: backoff.attempts(),
                });
            }

            let poll = backoff.next_attempt();
            match self.store.get(identity).await {
                Ok(obj) if predicate(&obj) => {
                    debug!(kind = %kind, resource = %identity, polls = poll, "ready");
                    return Ok(());
                }
                Ok(_) => debug!(kind = %kind, resource = %identity, poll, "not ready yet"),
                Err(e) => debug!(
                    kind = %kind,
                    resource = %identity,
                    poll,
                    error = %e,
                    "fetch failed, treating as not ready"
                ),
            }

            match backoff.wait().await {
                Pause::Retry => {}
                Pause::Exhausted => {
                    return Err(KubeError::Timeout {
                        kind,
                        identity: identity.clone(),
                        elapsed: backoff.elapsed(),
                        polls: backoff.attempts(),
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
}

/// Built-in readiness predicates
pub mod predicates {
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
    use k8s_openapi::api::core::v1::ReplicationController;
    use serde::Serialize;
    use serde_json::Value as JsonValue;

    /// Workloads that report desired and ready replica counts
    pub trait ReplicaCounts {
        /// Desired replicas; the API server defaults an unset count to 1
        fn desired_replicas(&self) -> i32;
        fn ready_replicas(&self) -> i32;
    }

    impl ReplicaCounts for Deployment {
        fn desired_replicas(&self) -> i32 {
            self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
        }

        fn ready_replicas(&self) -> i32 {
            self.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
        }
    }

    impl ReplicaCounts for StatefulSet {
        fn desired_replicas(&self) -> i32 {
            self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
        }

        fn ready_replicas(&self) -> i32 {
            self.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
        }
    }

    impl ReplicaCounts for ReplicaSet {
        fn desired_replicas(&self) -> i32 {
            self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
        }

        fn ready_replicas(&self) -> i32 {
            self.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
        }
    }

    impl ReplicaCounts for ReplicationController {
        fn desired_replicas(&self) -> i32 {
            self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
        }

        fn ready_replicas(&self) -> i32 {
            self.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)
        }
    }

    /// Every desired replica reports ready
    pub fn replicas_ready<K: ReplicaCounts>(obj: &K) -> bool {
        obj.ready_replicas() == obj.desired_replicas()
    }

    /// `replicas_ready` specialised for replication controllers
    pub fn replication_controller_ready(rc: &ReplicationController) -> bool {
        replicas_ready(rc)
    }

    /// `status.conditions` carries `condition_type` with status `"True"`
    ///
    /// Works on any serializable resource, including custom resources.
    pub fn condition_true<K: Serialize>(condition_type: &str) -> impl Fn(&K) -> bool + '_ {
        move |obj| {
            let Ok(doc) = serde_json::to_value(obj) else {
                return false;
            };
            doc.pointer("/status/conditions")
                .and_then(JsonValue::as_array)
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(JsonValue::as_str) == Some(condition_type)
                            && c.get("status").and_then(JsonValue::as_str) == Some("True")
                    })
                })
        }
    }

    /// The controller has observed the latest spec generation
    ///
    /// A resource without `metadata.generation` has nothing to observe and
    /// counts as observed.
    pub fn generation_observed<K: Serialize>(obj: &K) -> bool {
        let Ok(doc) = serde_json::to_value(obj) else {
            return false;
        };
        let Some(generation) = doc.pointer("/metadata/generation").and_then(JsonValue::as_i64)
        else {
            return true;
        };
        doc.pointer("/status/observedGeneration")
            .and_then(JsonValue::as_i64)
            .is_some_and(|observed| observed >= generation)
    }
}
