//! Long-lived clients and their outbound message channels
//!
//! A client is an identity that outlives any single request: request logic
//! allocates one, opens channels under it, and pushes messages to those
//! channels from any worker thread. Delivery to the physical connection
//! happens out-of-band — whenever the client attaches a live transport, the
//! buffered outbox drains to it in order. Messages sent to the same channel
//! arrive in send order; across channels there is no guarantee.

use dashmap::DashMap;
use quay_core::{Abort, ChannelId, ClientId, PassToken, RequestResult};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The live half of a client connection
///
/// Implementations wrap whatever transport carries push messages to this
/// client (a long-polling socket, a streaming response). `deliver` failures
/// detach the transport; buffered messages wait for the next attach.
pub trait ClientTransport: Send + Sync {
    /// Deliver one message on one channel, in order
    fn deliver(&mut self, channel: u32, message: &str) -> io::Result<()>;

    /// Tear the transport down; called on replacement and on prune
    fn close(&mut self);
}

struct ClientState {
    pass: PassToken,
    next_channel: u32,
    outbox: VecDeque<(u32, String)>,
    transport: Option<Box<dyn ClientTransport>>,
    last_contact: Instant,
}

impl ClientState {
    /// Drain buffered messages into the live transport, in order. A
    /// delivery failure detaches the transport and keeps the rest queued.
    fn flush(&mut self, client: ClientId) {
        while let Some((channel, message)) = self.outbox.front() {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            match transport.deliver(*channel, message) {
                Ok(()) => {
                    self.outbox.pop_front();
                }
                Err(e) => {
                    debug!(%client, "client transport failed, detaching: {}", e);
                    if let Some(mut t) = self.transport.take() {
                        t.close();
                    }
                    return;
                }
            }
        }
    }
}

/// Mapping from client identity to outbound message channels
///
/// Written from arbitrary worker threads; the map shards its locking per
/// entry, and per-channel ordering holds because a client's outbox is only
/// touched under its entry lock.
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientState>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        ClientRegistry {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a client identity and its secret pass token
    pub fn new_client(&self) -> (ClientId, PassToken) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pass = PassToken(rand::random());
        self.clients.insert(
            id,
            ClientState {
                pass,
                next_channel: 0,
                outbox: VecDeque::new(),
                transport: None,
                last_contact: Instant::now(),
            },
        );
        (id, pass)
    }

    /// Open a new channel under a client
    pub fn new_channel(&self, client: ClientId) -> RequestResult<ChannelId> {
        let mut state = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| Abort::Client(format!("no such client {}", client)))?;
        let index = state.next_channel;
        state.next_channel += 1;
        Ok(ChannelId { client, index })
    }

    /// Append a message to a channel's ordered outbound sequence.
    ///
    /// Observable by any thread; delivered out-of-band once the client has a
    /// live transport.
    pub fn send(&self, channel: ChannelId, message: &str) -> RequestResult<()> {
        let mut state = self
            .clients
            .get_mut(&channel.client)
            .ok_or_else(|| Abort::Client(format!("no such client {}", channel.client)))?;
        if channel.index >= state.next_channel {
            return Err(Abort::Client(format!("no such channel {}", channel)));
        }
        state.outbox.push_back((channel.index, message.to_string()));
        state.flush(channel.client);
        Ok(())
    }

    /// Attach a live connection for a client, verifying its pass token.
    ///
    /// Replaces (and closes) any previous transport, then drains the
    /// buffered outbox to the new one.
    pub fn connect(
        &self,
        client: ClientId,
        pass: PassToken,
        transport: Box<dyn ClientTransport>,
    ) -> RequestResult<()> {
        let mut state = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| Abort::Client(format!("no such client {}", client)))?;
        if state.pass != pass {
            warn!(%client, "client connect with wrong pass token");
            return Err(Abort::Client(format!(
                "wrong pass token for client {}",
                client
            )));
        }
        if let Some(mut old) = state.transport.replace(transport) {
            old.close();
        }
        state.last_contact = Instant::now();
        state.flush(client);
        Ok(())
    }

    /// Detach and close a client's transport, keeping the client
    pub fn disconnect(&self, client: ClientId) {
        if let Some(mut state) = self.clients.get_mut(&client) {
            if let Some(mut t) = state.transport.take() {
                t.close();
            }
        }
    }

    /// Record liveness for a client (a request arrived on its behalf)
    pub fn touch(&self, client: ClientId) {
        if let Some(mut state) = self.clients.get_mut(&client) {
            state.last_contact = Instant::now();
        }
    }

    /// Drop clients silent for longer than `max_age`, closing their
    /// transports. Returns how many were pruned.
    pub fn prune(&self, max_age: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return 0;
        };
        let mut pruned = 0;
        self.clients.retain(|client, state| {
            if state.last_contact >= cutoff {
                return true;
            }
            debug!(%client, "pruning stale client");
            if let Some(mut t) = state.transport.take() {
                t.close();
            }
            pruned += 1;
            false
        });
        pruned
    }

    /// Whether a client identity exists
    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Number of live clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients exist
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Transport that records deliveries, optionally failing
    struct Recorder {
        log: Arc<Mutex<Vec<(u32, String)>>>,
        closed: Arc<Mutex<bool>>,
        fail: bool,
    }

    impl Recorder {
        fn boxed(
            log: &Arc<Mutex<Vec<(u32, String)>>>,
            closed: &Arc<Mutex<bool>>,
            fail: bool,
        ) -> Box<dyn ClientTransport> {
            Box::new(Recorder {
                log: Arc::clone(log),
                closed: Arc::clone(closed),
                fail,
            })
        }
    }

    impl ClientTransport for Recorder {
        fn deliver(&mut self, channel: u32, message: &str) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.log.lock().unwrap().push((channel, message.to_string()));
            Ok(())
        }
        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<(u32, String)>>>,
        Arc<Mutex<bool>>,
    ) {
        (Arc::new(Mutex::new(Vec::new())), Arc::new(Mutex::new(false)))
    }

    #[test]
    fn test_messages_buffer_until_connect() {
        let registry = ClientRegistry::new();
        let (id, pass) = registry.new_client();
        let chan = registry.new_channel(id).unwrap();

        registry.send(chan, "queued-1").unwrap();
        registry.send(chan, "queued-2").unwrap();

        let (log, closed) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log, &closed, false)).unwrap();

        let delivered = log.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![(0, "queued-1".to_string()), (0, "queued-2".to_string())]
        );
    }

    #[test]
    fn test_live_transport_delivers_immediately() {
        let registry = ClientRegistry::new();
        let (id, pass) = registry.new_client();
        let chan = registry.new_channel(id).unwrap();

        let (log, closed) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log, &closed, false)).unwrap();
        registry.send(chan, "direct").unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_pass_token_is_client_error() {
        let registry = ClientRegistry::new();
        let (id, pass) = registry.new_client();

        let (log, closed) = recorder();
        let err = registry
            .connect(id, PassToken(pass.0.wrapping_add(1)), Recorder::boxed(&log, &closed, false))
            .unwrap_err();
        assert!(matches!(err, Abort::Client(_)));
    }

    #[test]
    fn test_send_to_unknown_channel_rejected() {
        let registry = ClientRegistry::new();
        let (id, _pass) = registry.new_client();
        let bogus = ChannelId { client: id, index: 5 };
        assert!(matches!(registry.send(bogus, "x"), Err(Abort::Client(_))));
    }

    #[test]
    fn test_failed_delivery_detaches_and_requeues() {
        let registry = ClientRegistry::new();
        let (id, pass) = registry.new_client();
        let chan = registry.new_channel(id).unwrap();

        let (log, closed) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log, &closed, true)).unwrap();
        registry.send(chan, "lost?").unwrap();
        assert!(*closed.lock().unwrap());

        // Reconnect with a working transport: the message was kept
        let (log2, closed2) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log2, &closed2, false)).unwrap();
        assert_eq!(log2.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_keeps_client_and_buffers() {
        let registry = ClientRegistry::new();
        let (id, pass) = registry.new_client();
        let chan = registry.new_channel(id).unwrap();

        let (log, closed) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log, &closed, false)).unwrap();
        registry.disconnect(id);
        assert!(*closed.lock().unwrap());
        assert!(registry.contains(id));

        // Sends while detached buffer; a reconnect drains them
        registry.send(chan, "while away").unwrap();
        let (log2, closed2) = recorder();
        registry.connect(id, pass, Recorder::boxed(&log2, &closed2, false)).unwrap();
        assert_eq!(log2.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_closes_stale_transports() {
        let registry = ClientRegistry::new();
        let (stale, stale_pass) = registry.new_client();
        let (log, closed) = recorder();
        registry
            .connect(stale, stale_pass, Recorder::boxed(&log, &closed, false))
            .unwrap();

        // A zero-age prune treats everything as stale
        std::thread::sleep(Duration::from_millis(10));
        let pruned = registry.prune(Duration::from_secs(0));
        assert_eq!(pruned, 1);
        assert!(*closed.lock().unwrap());
        assert!(!registry.contains(stale));
    }

    #[test]
    fn test_touch_defers_prune() {
        let registry = ClientRegistry::new();
        let (id, _pass) = registry.new_client();
        registry.touch(id);
        let pruned = registry.prune(Duration::from_secs(3600));
        assert_eq!(pruned, 0);
        assert!(registry.contains(id));
    }
}
