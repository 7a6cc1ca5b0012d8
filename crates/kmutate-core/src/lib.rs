//! kmutate Core - building blocks for optimistic-concurrency resource mutation
//!
//! This crate is free of I/O and provides:
//! - `ResourceIdentity`: namespace + name key of a stored resource
//! - `Patch`: ordered RFC 6902 JSON patch operations, with application
//! - `DiffEngine`: minimal patch between two snapshots
//! - `RetryPolicy`: interval, deadline, attempt bound and backoff shape

pub mod diff;
pub mod error;
pub mod identity;
pub mod patch;
pub mod policy;

pub use diff::DiffEngine;
pub use error::{CoreError, Result};
pub use identity::ResourceIdentity;
pub use patch::{Patch, PatchOperation, escape_token, join_pointer, parse_pointer};
pub use policy::{BackoffKind, RetryPolicy};
