//! The reusable per-connection execution context
//!
//! A [`Context`] owns one arena, one cleanup stack, one transactional
//! registry, the current request's parsed inputs, and the response being
//! built. It is created once per worker at pool startup, cycles through
//! `begin`/`reset` once per connection, and is dropped only at shutdown.
//! A context is exclusively owned by one worker thread for its whole life —
//! hand it over by value, never share it — which is what makes the
//! lock-free arena safe.
//!
//! State transitions:
//! - `Idle` → `Initializing` (begin: arena/cleanups/registry verified empty)
//! - `Initializing` → `Active` (inputs populated, headers parsed)
//! - `Active` → `Committing` (request logic returned normally)
//! - `Active` → `Unwinding` (a failure reached the boundary)
//! - `Committing` | `Unwinding` → `Idle` (reset)

use std::any::Any;
use std::io::{self, Write};

use quay_core::limits::MemoryLimits;
use quay_core::{Abort, ClientId, FailureKind, RequestResult};
use tracing::{debug, error};

use crate::arena::{Arena, ArenaRef, ArenaStats};
use crate::cleanup::CleanupStack;
use crate::input::{Input, Inputs};
use crate::response::Response;
use crate::transactional::{Transactional, TransactionalRegistry};

/// Where a context is in its per-connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Between connections; everything empty (or deliberately retained)
    Idle,
    /// A connection arrived; the transport layer is populating the request
    Initializing,
    /// Request logic is running
    Active,
    /// Request logic returned normally; transactionals committed
    Committing,
    /// A failure fired; cleanups ran, transactionals rolled back
    Unwinding,
}

/// The unit of reuse: one connection's worth of execution state
pub struct Context {
    state: ContextState,
    arena: Arena,
    cleanups: CleanupStack,
    transactionals: TransactionalRegistry,
    inputs: Inputs,
    response: Response,
    path: Option<String>,
    request_headers: Vec<(String, String)>,
    failure: Option<(FailureKind, String)>,
    client: Option<ClientId>,
    db: Option<Box<dyn Any + Send>>,
}

impl Context {
    /// Create a fresh context with default memory limits
    pub fn new() -> Self {
        Self::with_limits(MemoryLimits::default())
    }

    /// Create a fresh context with the given memory limits
    pub fn with_limits(limits: MemoryLimits) -> Self {
        Context {
            state: ContextState::Idle,
            arena: Arena::with_limits(limits),
            cleanups: CleanupStack::new(),
            transactionals: TransactionalRegistry::new(),
            inputs: Inputs::new(),
            response: Response::new(),
            path: None,
            request_headers: Vec::new(),
            failure: None,
            client: None,
            db: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        self.state
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Begin a new request for `path`.
    ///
    /// Verifies the reset invariant from the prior cycle: arena, cleanup
    /// stack, and registry must all be empty. A violation means a boundary
    /// skipped its reset — unrecoverable for this context.
    pub fn begin(&mut self, path: &str) -> RequestResult<()> {
        if self.state != ContextState::Idle {
            return Err(Abort::Fatal(format!(
                "begin on a context in state {:?}",
                self.state
            )));
        }
        if self.arena.live_bytes() != 0
            || !self.cleanups.is_empty()
            || !self.transactionals.is_empty()
        {
            return Err(Abort::Fatal(
                "begin on a context that was not reset".to_string(),
            ));
        }
        self.state = ContextState::Initializing;
        self.path = Some(path.to_string());
        self.failure = None;
        Ok(())
    }

    /// Inputs populated and headers parsed; request logic may now run.
    pub fn activate(&mut self) -> RequestResult<()> {
        if self.state != ContextState::Initializing {
            return Err(Abort::Fatal(format!(
                "activate on a context in state {:?}",
                self.state
            )));
        }
        self.state = ContextState::Active;
        Ok(())
    }

    /// Request logic returned normally: commit every transactional
    /// participant and move to `Committing`.
    ///
    /// A participant's commit failure converts the request to the unwinding
    /// path — cleanups run, partial output is discarded — and surfaces as
    /// fatal.
    pub fn commit(&mut self) -> RequestResult<()> {
        if self.state != ContextState::Active {
            return Err(Abort::Fatal(format!(
                "commit on a context in state {:?}",
                self.state
            )));
        }
        self.state = ContextState::Committing;
        match self.transactionals.commit_all() {
            Ok(()) => Ok(()),
            Err(abort) => {
                self.record_failure(&abort);
                self.cleanups.unwind();
                self.response.clear_body();
                self.state = ContextState::Unwinding;
                Err(abort)
            }
        }
    }

    /// A failure reached the boundary: run the cleanup stack, roll back
    /// every transactional participant, and discard partial output.
    ///
    /// For a client-caused failure the response becomes a structured error
    /// body; a fatal failure leaves no well-formed response (the boundary
    /// closes the connection) and a disconnect produces nothing at all.
    /// The arena is left intact until reset, so failure handling can still
    /// format with request data.
    pub fn unwind(&mut self, abort: &Abort) {
        // Idle is allowed: a request can fail in the glue before begin()
        // (malformed request line, peer gone) and still needs the boundary
        // to produce its error outcome.
        debug_assert!(
            !matches!(
                self.state,
                ContextState::Committing | ContextState::Unwinding
            ),
            "unwind on a context in state {:?}",
            self.state
        );
        self.state = ContextState::Unwinding;
        self.record_failure(abort);
        self.cleanups.unwind();
        self.transactionals.rollback_all();
        self.response.clear_body();
        if abort.kind() == FailureKind::Client {
            self.response.make_error(FailureKind::Client, &abort.to_string());
        }
    }

    /// Full reset: back to a state indistinguishable from a fresh context
    /// (arena occupancy, cleanup depth, registry size), retaining page
    /// capacity. Cleanup entries never popped execute here, exactly once.
    pub fn reset(&mut self) {
        self.reset_inner(false, false);
    }

    /// Reset, retaining the parsed request (path, headers, inputs) for
    /// chained follow-up processing.
    pub fn reset_keep_request(&mut self) {
        self.reset_inner(true, false);
    }

    /// Reset, retaining the last failure's classification and message for
    /// retrieval while the context is idle.
    pub fn reset_keep_error_message(&mut self) {
        self.reset_inner(false, true);
    }

    fn reset_inner(&mut self, keep_request: bool, keep_error: bool) {
        // An unwind legitimately abandons open regions; on any other path a
        // region still open here is an unmatched begin_region.
        if self.state != ContextState::Unwinding && self.arena.open_regions() > 0 {
            error!(
                open_regions = self.arena.open_regions(),
                "context reset with unmatched begin_region"
            );
            debug_assert!(false, "context reset with unmatched begin_region");
        }
        // Leftover cleanups run exactly once; leftover participants roll
        // back so no partial commit can leak past the reset.
        self.cleanups.unwind();
        if !self.transactionals.is_empty() {
            debug!(
                participants = self.transactionals.len(),
                "reset rolling back unresolved transactional participants"
            );
            self.transactionals.rollback_all();
        }
        self.arena.reset();
        self.response.reset();
        if !keep_request {
            self.path = None;
            self.request_headers.clear();
            self.inputs.clear();
        }
        if !keep_error {
            self.failure = None;
        }
        self.client = None;
        self.state = ContextState::Idle;
    }

    // =========================================================================
    // Failure slot
    // =========================================================================

    /// Record a failure and produce the [`Abort`] that propagates it.
    ///
    /// Request logic uses this as `return Err(ctx.error(kind, msg))`; the
    /// classification and message stay on the context for retrieval at the
    /// boundary.
    pub fn error(&mut self, kind: FailureKind, message: impl Into<String>) -> Abort {
        let abort = Abort::with_kind(kind, message);
        self.record_failure(&abort);
        abort
    }

    /// The last recorded failure message, when one exists
    pub fn error_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|(_, m)| m.as_str())
    }

    /// The last recorded failure classification, when one exists
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|(k, _)| *k)
    }

    fn record_failure(&mut self, abort: &Abort) {
        self.failure = Some((abort.kind(), abort.to_string()));
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Allocate `n` bytes from the request arena
    pub fn alloc(&mut self, n: usize) -> RequestResult<ArenaRef> {
        self.arena.alloc(n)
    }

    /// Copy a string into the request arena
    pub fn copy_str(&mut self, s: &str) -> RequestResult<ArenaRef> {
        self.arena.copy_str(s)
    }

    /// The request arena, for direct access to handles and stats
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The request arena, mutably
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Open a nested allocation region
    pub fn begin_region(&mut self) {
        self.arena.begin_region();
    }

    /// Close the most recently opened region
    pub fn end_region(&mut self) {
        self.arena.end_region();
    }

    /// Arena occupancy, for trace logging
    pub fn memstats(&self) -> ArenaStats {
        self.arena.stats()
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Register an action to run on unwind (or at reset, if never popped)
    pub fn push_cleanup(&mut self, action: impl FnOnce() + Send + 'static) {
        self.cleanups.push(action);
    }

    /// Discard the most recently registered cleanup without running it
    pub fn pop_cleanup(&mut self) {
        self.cleanups.pop();
    }

    /// Depth of the cleanup stack
    pub fn cleanup_depth(&self) -> usize {
        self.cleanups.len()
    }

    // =========================================================================
    // Transactional
    // =========================================================================

    /// Enroll a backend participant for the current request
    pub fn register_transactional(&mut self, hook: Box<dyn Transactional>) {
        self.transactionals.register(hook);
    }

    /// Number of enrolled transactional participants
    pub fn transactional_count(&self) -> usize {
        self.transactionals.len()
    }

    // =========================================================================
    // Request data
    // =========================================================================

    /// The path this request was begun with
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Install the parsed request headers (during initialization)
    pub fn set_request_headers(&mut self, headers: Vec<(String, String)>) {
        self.request_headers = headers;
    }

    /// Look up a request header, case-insensitively
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Read a cookie from the request's Cookie headers
    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| v.split(';'))
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k.trim() == name).then_some(v.trim())
            })
            .next()
    }

    /// Set an input value (during initialization)
    pub fn set_input(&mut self, name: impl Into<String>, value: Input) -> RequestResult<()> {
        self.inputs.set(name, value)
    }

    /// The request's input table and scope
    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// The request's input table and scope, mutably (subform navigation)
    pub fn inputs_mut(&mut self) -> &mut Inputs {
        &mut self.inputs
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Append text to the output buffer
    pub fn write(&mut self, text: &str) {
        debug_assert!(self.state != ContextState::Idle, "write on an idle context");
        self.response.write_str(text);
    }

    /// Append raw bytes to the output buffer
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.state != ContextState::Idle, "write on an idle context");
        self.response.write_bytes(bytes);
    }

    /// Append a response header
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.response.add_header(name, value);
    }

    /// Append a Set-Cookie response header
    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.response.set_cookie(name, value);
    }

    /// Override the success status line
    pub fn set_status(&mut self, status: &str) {
        self.response.set_status(status);
    }

    /// Replace the body with raw bytes of the given MIME type
    pub fn set_blob(&mut self, data: &[u8], mime: &str) {
        self.response.set_blob(data, mime);
    }

    /// The response being built
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Send the built response over a connection
    pub fn send(&self, conn: &mut impl Write) -> io::Result<()> {
        self.response.send(conn)
    }

    /// Stream the built response through a caller-supplied callback
    pub fn write_to(&self, output: impl FnMut(&[u8]) -> io::Result<()>) -> io::Result<()> {
        self.response.write_to(output)
    }

    // =========================================================================
    // Client identity & database handle
    // =========================================================================

    /// Bind the client identity for the current request
    pub fn set_client(&mut self, client: ClientId) {
        self.client = Some(client);
    }

    /// The client identity bound to the currently active request, when one
    /// exists
    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    /// Install the externally supplied database handle. The handle lives
    /// with the context, across requests, until replaced.
    pub fn set_db(&mut self, db: Box<dyn Any + Send>) {
        self.db = Some(db);
    }

    /// The database handle, downcast to its concrete type
    pub fn db<T: Any>(&self) -> Option<&T> {
        self.db.as_ref().and_then(|d| d.downcast_ref())
    }

    /// The database handle, downcast mutably
    pub fn db_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.db.as_mut().and_then(|d| d.downcast_mut())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactional::HookError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct CountingHook {
        commits: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
        fail_commit: bool,
    }

    impl Transactional for CountingHook {
        fn commit(&mut self) -> Result<(), HookError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                Err(HookError::new("backend down"))
            } else {
                Ok(())
            }
        }
        fn rollback(&mut self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&mut self) {}
    }

    fn counting_hook(
        commits: &Arc<AtomicUsize>,
        rollbacks: &Arc<AtomicUsize>,
        fail_commit: bool,
    ) -> Box<dyn Transactional> {
        Box::new(CountingHook {
            commits: Arc::clone(commits),
            rollbacks: Arc::clone(rollbacks),
            fail_commit,
        })
    }

    fn begin_active(ctx: &mut Context, path: &str) {
        ctx.begin(path).unwrap();
        ctx.activate().unwrap();
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut ctx = Context::new();
        assert_eq!(ctx.state(), ContextState::Idle);

        ctx.begin("/hello").unwrap();
        assert_eq!(ctx.state(), ContextState::Initializing);
        ctx.set_request_headers(vec![("Host".to_string(), "example.test".to_string())]);
        ctx.activate().unwrap();
        assert_eq!(ctx.state(), ContextState::Active);

        ctx.write("<html>hello</html>");
        ctx.commit().unwrap();
        assert_eq!(ctx.state(), ContextState::Committing);

        let mut wire = Vec::new();
        ctx.send(&mut wire).unwrap();
        assert!(String::from_utf8(wire).unwrap().contains("hello"));

        ctx.reset();
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_begin_requires_idle() {
        let mut ctx = Context::new();
        ctx.begin("/a").unwrap();
        assert!(matches!(ctx.begin("/b"), Err(Abort::Fatal(_))));
    }

    #[test]
    fn test_client_failure_unwinds_hooks_and_output() {
        // A request that allocates, registers two participants, then fails
        // with a client error: both roll back, nothing commits, and the
        // output buffer is empty after reset.
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));

        let mut ctx = Context::new();
        begin_active(&mut ctx, "/form");
        ctx.alloc(200).unwrap();
        ctx.register_transactional(counting_hook(&commits, &rollbacks, false));
        ctx.register_transactional(counting_hook(&commits, &rollbacks, false));
        ctx.write("partial output that must vanish");

        let abort = ctx.error(FailureKind::Client, "missing input q");
        ctx.unwind(&abort);

        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.state(), ContextState::Unwinding);
        // The error body replaced the partial output
        let body = String::from_utf8(ctx.response().body().to_vec()).unwrap();
        assert!(body.contains("missing input q"));
        assert!(!body.contains("vanish"));

        ctx.reset();
        assert!(ctx.response().body().is_empty());
        assert_eq!(ctx.arena().live_bytes(), 0);
    }

    #[test]
    fn test_cleanups_run_in_reverse_on_unwind() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        for name in ["a", "b", "c"] {
            let o = Arc::clone(&order);
            ctx.push_cleanup(move || o.lock().unwrap().push(name));
        }
        ctx.pop_cleanup(); // c completed normally

        let abort = ctx.error(FailureKind::Client, "boom");
        ctx.unwind(&abort);
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_commit_failure_is_fatal_and_unwinds() {
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        let c = Arc::clone(&cleaned);
        ctx.push_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ctx.register_transactional(counting_hook(&commits, &rollbacks, true));
        ctx.write("almost committed");

        let err = ctx.commit().unwrap_err();
        assert!(matches!(err, Abort::Fatal(_)));
        assert_eq!(ctx.state(), ContextState::Unwinding);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(ctx.response().body().is_empty());
        assert_eq!(ctx.failure_kind(), Some(FailureKind::Fatal));
    }

    #[test]
    fn test_reset_restores_fresh_equivalence() {
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        ctx.alloc(512).unwrap();
        ctx.push_cleanup(|| {});
        ctx.set_input("q", Input::Text("42".to_string())).unwrap();
        ctx.write("junk");
        ctx.set_client(quay_core::ClientId(9));

        ctx.reset();
        assert_eq!(ctx.state(), ContextState::Idle);
        assert_eq!(ctx.arena().live_bytes(), 0);
        assert_eq!(ctx.cleanup_depth(), 0);
        assert_eq!(ctx.transactional_count(), 0);
        assert!(ctx.inputs().is_empty());
        assert!(ctx.response().body().is_empty());
        assert!(ctx.path().is_none());
        assert!(ctx.client().is_none());
        assert!(ctx.error_message().is_none());

        // The context can begin again
        ctx.begin("/y").unwrap();
    }

    #[test]
    fn test_reset_runs_leftover_cleanups_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        let c = Arc::clone(&count);
        ctx.push_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        ctx.commit().unwrap();
        ctx.reset();
        ctx.reset();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_keep_request_retains_parsed_request() {
        let mut ctx = Context::new();
        ctx.begin("/chained").unwrap();
        ctx.set_request_headers(vec![("Cookie".to_string(), "session=s1".to_string())]);
        ctx.set_input("step", Input::Text("one".to_string())).unwrap();
        ctx.activate().unwrap();
        ctx.alloc(64).unwrap();
        ctx.commit().unwrap();

        ctx.reset_keep_request();
        assert_eq!(ctx.state(), ContextState::Idle);
        assert_eq!(ctx.arena().live_bytes(), 0);
        assert_eq!(ctx.path(), Some("/chained"));
        assert_eq!(ctx.get_cookie("session"), Some("s1"));
        assert_eq!(ctx.inputs().text("step").unwrap(), "one");
    }

    #[test]
    fn test_reset_keep_error_message_retains_failure() {
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        let abort = ctx.error(FailureKind::Client, "bad field");
        ctx.unwind(&abort);

        ctx.reset_keep_error_message();
        assert_eq!(ctx.state(), ContextState::Idle);
        assert!(ctx.error_message().unwrap().contains("bad field"));

        // The next begin starts clean
        ctx.begin("/y").unwrap();
        assert!(ctx.error_message().is_none());
    }

    #[test]
    #[should_panic(expected = "unmatched begin_region")]
    fn test_unmatched_region_flagged_at_reset() {
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        ctx.begin_region();
        ctx.commit().unwrap();
        ctx.reset();
    }

    #[test]
    fn test_unwind_abandons_open_regions() {
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        ctx.begin_region();
        ctx.alloc(10).unwrap();

        let abort = ctx.error(FailureKind::Client, "mid-region failure");
        ctx.unwind(&abort);
        ctx.reset();
        assert_eq!(ctx.arena().live_bytes(), 0);
        assert_eq!(ctx.arena().open_regions(), 0);
    }

    #[test]
    fn test_disconnect_produces_no_body() {
        let mut ctx = Context::new();
        begin_active(&mut ctx, "/x");
        ctx.write("partial");
        ctx.unwind(&Abort::Disconnect);
        assert!(ctx.response().body().is_empty());
        assert_eq!(ctx.failure_kind(), Some(FailureKind::Disconnect));
    }

    #[test]
    fn test_cookie_parsing() {
        let mut ctx = Context::new();
        ctx.begin("/x").unwrap();
        ctx.set_request_headers(vec![(
            "Cookie".to_string(),
            "a=1; session=abc; b=2".to_string(),
        )]);
        assert_eq!(ctx.get_cookie("session"), Some("abc"));
        assert_eq!(ctx.get_cookie("a"), Some("1"));
        assert_eq!(ctx.get_cookie("missing"), None);
    }

    #[test]
    fn test_request_header_case_insensitive() {
        let mut ctx = Context::new();
        ctx.begin("/x").unwrap();
        ctx.set_request_headers(vec![("Content-Type".to_string(), "text/plain".to_string())]);
        assert_eq!(ctx.request_header("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_db_handle_survives_reset() {
        struct FakePool(u32);

        let mut ctx = Context::new();
        ctx.set_db(Box::new(FakePool(7)));
        begin_active(&mut ctx, "/x");
        ctx.commit().unwrap();
        ctx.reset();

        assert_eq!(ctx.db::<FakePool>().map(|p| p.0), Some(7));
        assert!(ctx.db::<String>().is_none());
    }
}
