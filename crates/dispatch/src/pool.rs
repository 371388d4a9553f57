//! Fixed pool of worker threads, each owning one reusable context
//!
//! Each worker loops: dequeue a connection, drive it fully to completion
//! against the worker's own [`Context`], reset, repeat. A context is handed
//! to its worker by value at spawn time and never shared — there is no
//! aliased access path, which is what lets the context's arena go unlocked.
//!
//! The request boundary lives here: whatever path the handler takes out —
//! normal return, failure, or panic — the boundary commits or unwinds,
//! delivers the classification-appropriate response, and resets the context
//! before the next connection.
//!
//! There is no cancellation and no deadline: a stalled client occupies its
//! worker for as long as the transport blocks. Deployments should set
//! read/write timeouts on the transport itself.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use quay_context::{Context, ContextState};
use quay_core::limits::MemoryLimits;
use quay_core::{Abort, FailureKind, RequestResult};
use tracing::{debug, error};

use crate::queue::ConnectionQueue;

/// The application entry point driven once per connection.
///
/// The handler owns the excluded glue: it parses the transport into
/// `begin`/`set_input`/`activate` calls, then runs request logic. The pool
/// supplies the boundary around it.
pub type Handler<C> = dyn Fn(&mut Context, &mut C) -> RequestResult<()> + Send + Sync;

/// Pool construction parameters
pub struct PoolConfig {
    /// Number of worker threads, fixed for the pool's lifetime
    pub workers: usize,
    /// Memory limits for each worker's context
    pub memory: MemoryLimits,
    /// Run once against each worker's fresh context at spawn time
    /// (install a database handle, for instance)
    pub context_init: Option<Arc<dyn Fn(&mut Context) + Send + Sync>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: 4,
            memory: MemoryLimits::default(),
            context_init: None,
        }
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker thread count
    pub workers: usize,
    /// Connections waiting in the queue
    pub queued: usize,
    /// Requests that committed and delivered
    pub served: u64,
    /// Requests that unwound
    pub failed: u64,
}

struct Counters {
    served: AtomicU64,
    failed: AtomicU64,
}

/// N worker threads sharing one connection queue
pub struct WorkerPool<C: Send + 'static> {
    queue: Arc<ConnectionQueue<C>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl<C: Read + Write + Send + 'static> WorkerPool<C> {
    /// Spawn `workers` threads with default limits
    pub fn new(
        workers: usize,
        handler: impl Fn(&mut Context, &mut C) -> RequestResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self::with_config(
            PoolConfig {
                workers,
                ..PoolConfig::default()
            },
            handler,
        )
    }

    /// Spawn a pool with explicit configuration
    pub fn with_config(
        config: PoolConfig,
        handler: impl Fn(&mut Context, &mut C) -> RequestResult<()> + Send + Sync + 'static,
    ) -> Self {
        let queue = Arc::new(ConnectionQueue::new());
        let counters = Arc::new(Counters {
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let handler: Arc<Handler<C>> = Arc::new(handler);

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            let handler = Arc::clone(&handler);
            let memory = config.memory;
            let init = config.context_init.clone();
            let handle = std::thread::Builder::new()
                .name(format!("quay-worker-{}", i))
                .spawn(move || {
                    let mut ctx = Context::with_limits(memory);
                    if let Some(init) = init {
                        init(&mut ctx);
                    }
                    worker_loop(&queue, &mut ctx, &*handler, &counters);
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        WorkerPool {
            queue,
            workers,
            counters,
        }
    }

    /// Hand a connection to the pool. Returns false after shutdown.
    pub fn dispatch(&self, conn: C) -> bool {
        self.queue.push(conn)
    }

    /// The shared queue, for producers that push directly
    pub fn queue(&self) -> Arc<ConnectionQueue<C>> {
        Arc::clone(&self.queue)
    }

    /// Counters snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            queued: self.queue.len(),
            served: self.counters.served.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, let workers drain it, and join them all.
    pub fn shutdown(mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<C: Read + Write + Send>(
    queue: &ConnectionQueue<C>,
    ctx: &mut Context,
    handler: &Handler<C>,
    counters: &Counters,
) {
    while let Some(mut conn) = queue.pop() {
        serve_connection(ctx, &mut conn, handler, counters);
        // conn drops here; the transport closes with it
    }
}

/// Drive one connection to completion: handler, then the boundary.
fn serve_connection<C: Read + Write + Send>(
    ctx: &mut Context,
    conn: &mut C,
    handler: &Handler<C>,
    counters: &Counters,
) {
    // A panicking handler must not kill the worker; it is contained and
    // treated as a fatal request failure.
    let outcome = match catch_unwind(AssertUnwindSafe(|| handler(ctx, conn))) {
        Ok(result) => result,
        Err(_) => {
            error!(path = ctx.path().unwrap_or("?"), "request handler panicked");
            Err(Abort::Fatal("request handler panicked".to_string()))
        }
    };

    match outcome.and_then(|()| ctx.commit()) {
        Ok(()) => {
            if let Err(e) = ctx.send(conn) {
                debug!("response delivery failed: {}", e);
            }
            counters.served.fetch_add(1, Ordering::Relaxed);
        }
        Err(abort) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            // A failed commit has already unwound; everything else does so here
            if ctx.state() != ContextState::Unwinding {
                ctx.unwind(&abort);
            }
            match abort.kind() {
                // Structured error response; the worker keeps serving
                FailureKind::Client => {
                    if let Err(e) = ctx.send(conn) {
                        debug!("error response delivery failed: {}", e);
                    }
                }
                // Connection closed without a well-formed response
                FailureKind::Fatal => {
                    error!(
                        path = ctx.path().unwrap_or("?"),
                        "fatal failure: {}",
                        ctx.error_message().unwrap_or("unknown")
                    );
                }
                // Peer is gone; nothing to say
                FailureKind::Disconnect => {}
            }
        }
    }

    ctx.reset();
}
