//! Concurrent dispatch for the Quay runtime
//!
//! This crate hands inbound connections to a fixed pool of worker threads:
//! - queue: the unbounded blocking FIFO shared by all workers
//! - pool: N workers, each owning one long-lived reusable context
//! - clients: identities and ordered outbound channels for push messages
//!
//! The queue and registry are owned objects with explicit construction,
//! passed by handle to whoever needs them — never process-wide statics —
//! so lifetimes and test isolation stay explicit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clients;
pub mod pool;
pub mod queue;

pub use clients::{ClientRegistry, ClientTransport};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use queue::ConnectionQueue;
