//! Core types for the Quay runtime
//!
//! This crate defines the foundational types shared by the context and
//! dispatch layers:
//! - Abort: the failure value propagated from request logic to the boundary
//! - FailureKind: classification deciding the boundary's visible behavior
//! - ClientId / ChannelId / PassToken: client channel identifiers
//! - limits: allocation ceilings for the per-request arena

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod types;

pub use error::{Abort, FailureKind, RequestResult};
pub use types::{ChannelId, ClientId, PassToken};
