//! Identifier types for client channels
//!
//! This module defines the identifiers used by the client channel registry:
//! - ClientId: numeric identity of a long-lived client
//! - PassToken: the secret presented when a client reconnects
//! - ChannelId: one outbound message channel owned by a client

use std::fmt;

/// Numeric identity of a long-lived client
///
/// Allocated by the registry on first use by request logic; stable across
/// the client's reconnects until the client is pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret pass token a client must present to attach a live connection
///
/// Compared in full against the token issued at client creation; a mismatch
/// is a client-caused failure, not a fatal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassToken(pub u64);

/// One outbound message channel belonging to a client
///
/// Messages sent to the same channel are delivered in send order; there is
/// no ordering guarantee across different channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// The owning client
    pub client: ClientId,
    /// Channel slot within that client
    pub index: u32,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.index)
    }
}
