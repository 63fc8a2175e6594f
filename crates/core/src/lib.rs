//! InferMesh Core Types
//!
//! This crate defines the data structures shared by every InferMesh crate:
//! peer records, negotiation wire messages, token stream frames, the failure
//! taxonomy, typed configuration sections and the retry/backoff framework.

pub mod backoff;
pub mod config;
mod error;
mod types;

pub use backoff::{retry_with_backoff, retry_with_backoff_if, AddressBackoff, BackoffPolicy, RetryError};
pub use config::*;
pub use error::*;
pub use types::*;

pub use tokio_util::sync::CancellationToken;
