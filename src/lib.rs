//! Quay - per-connection execution runtime for request-serving applications
//!
//! For every inbound connection, Quay hands a reusable execution context to
//! one worker thread and guarantees that everything the request touched —
//! arena memory, cleanup actions, transactional participants, partial output
//! — is either fully committed or fully unwound when the connection is done.
//!
//! # Quick Start
//!
//! ```ignore
//! use quay::{Context, WorkerPool};
//!
//! let pool = WorkerPool::new(4, |ctx: &mut Context, conn: &mut std::net::TcpStream| {
//!     ctx.begin("/hello")?;
//!     ctx.activate()?;
//!     ctx.write("<html>hello</html>");
//!     Ok(())
//! });
//!
//! // The accept loop feeds the pool
//! pool.dispatch(accepted_stream);
//! ```
//!
//! # Architecture
//!
//! Request logic runs against a [`Context`] owned by exactly one worker:
//! it allocates from a region arena, registers cleanup actions and
//! transactional hooks, and builds a response buffer. The worker pool
//! supplies the request boundary — commit on success, unwind on failure,
//! reset either way — so no partial effect ever escapes a request.

// Re-export the public API of the runtime crates
pub use quay_core::*;
pub use quay_context::*;
pub use quay_dispatch::*;
