//! Session and connection-scoped state.
//!
//! A `Session` is the broker-side durable state for one client id. It
//! survives disconnects until its expiry window lapses. The attached
//! `ConnectedClient` is ephemeral connection state: the original CONNECT,
//! the worker death-signal handle, and the topic-alias tables.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::auth::AclRule;
use crate::packet::{Connect, Packet, Publish, SubscriptionOptions, Will};

/// Binary session identifier, taken from the CONNECT client id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Bytes);

impl SessionId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Why a session worker is being told to die.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDeath {
    /// Another connection took over this session id.
    Duplicate(SessionId),
    /// The connection layer detected a keep-alive lapse.
    PingTimeout,
}

/// Signal channel into a connection worker. The worker closes its socket
/// and exits when a `SessionDeath` arrives; the sender never blocks on it.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<SessionDeath>,
}

impl WorkerHandle {
    /// Create a handle plus the receiving end the worker selects on.
    pub fn new() -> (Self, Receiver<SessionDeath>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn signal(&self, death: SessionDeath) {
        // A worker that already exited dropped its receiver; nothing to do.
        let _ = self.tx.try_send(death);
    }
}

/// Connection-scoped mutable state attached to a session.
pub struct ConnectedClient {
    /// The CONNECT request, kept for property lookup.
    pub connect: Connect,
    /// Death-signal channel to the controlling I/O worker.
    pub worker: WorkerHandle,
    /// Monotonically allocated connection id, used to detect stale
    /// unregistrations after a takeover.
    pub client_id: u64,
    /// Inbound topic aliases: alias -> topic.
    inbound_aliases: AHashMap<u16, String>,
    /// Outbound topic aliases: topic -> alias.
    outbound_aliases: AHashMap<String, u16>,
    /// Outbound aliases still available, seeded from the client's
    /// Topic-Alias-Maximum.
    aliases_left: u16,
}

impl ConnectedClient {
    pub fn new(connect: Connect, worker: WorkerHandle, client_id: u64) -> Self {
        let aliases_left = connect.properties.topic_alias_maximum.unwrap_or(0);
        Self {
            connect,
            worker,
            client_id,
            inbound_aliases: AHashMap::new(),
            outbound_aliases: AHashMap::new(),
            aliases_left,
        }
    }

    /// Resolve an inbound publish's topic alias, then strip the property.
    ///
    /// A non-empty topic registers `alias -> topic`; an empty topic is
    /// rewritten to the table's current value for the alias. An unknown
    /// alias leaves the topic empty, which fails authorization downstream.
    pub fn resolve_inbound_alias(&mut self, publish: &mut Publish) {
        if let Some(alias) = publish.properties.topic_alias.take() {
            if !publish.topic.is_empty() {
                self.inbound_aliases.insert(alias, publish.topic.clone());
            } else if let Some(topic) = self.inbound_aliases.get(&alias) {
                publish.topic = topic.clone();
            }
        }
    }

    /// Apply outbound alias substitution to a publish about to be sent.
    ///
    /// A known topic is rewritten to the empty string with its alias set; an
    /// unknown topic gets a fresh alias while any remain, carrying the topic
    /// so the peer learns the mapping.
    pub fn apply_outbound_alias(&mut self, publish: &mut Publish) {
        if let Some(&alias) = self.outbound_aliases.get(&publish.topic) {
            publish.properties.topic_alias = Some(alias);
            publish.topic.clear();
        } else if self.aliases_left > 0 {
            let max = self.connect.properties.topic_alias_maximum.unwrap_or(0);
            let alias = max - self.aliases_left + 1;
            self.aliases_left -= 1;
            self.outbound_aliases.insert(publish.topic.clone(), alias);
            publish.properties.topic_alias = Some(alias);
        }
    }

    #[cfg(test)]
    pub fn outbound_alias_count(&self) -> usize {
        self.outbound_aliases.len()
    }
}

/// Broker-side state for one session id.
pub struct Session {
    /// ACL rules derived from the authorizer at connect time.
    pub acl: Vec<AclRule>,
    /// Attached connection, or `None` while detached in the grace window.
    pub client: Option<ConnectedClient>,
    /// Bounded packet queue drained by the connection writer.
    outbound: Sender<Packet>,
    /// Remaining capacity for unacked QoS>0 deliveries.
    pub in_flight_tokens: i32,
    /// Deliveries awaiting a free in-flight token.
    pub backlog: VecDeque<Publish>,
    backlog_bound: usize,
    /// Messages awaiting QoS 1 ACK or QoS 2 REC/REL/COMP, by packet id.
    pub qos_pending: AHashMap<u16, Publish>,
    /// This session's own view of its subscriptions.
    pub subscriptions: AHashMap<String, SubscriptionOptions>,
    /// When the detached session may be reaped.
    pub expires_at: Option<Instant>,
    /// Last-Will to publish on unclean death.
    pub will: Option<Will>,
}

impl Session {
    /// Build a fresh session around a new outbound queue. The receiver goes
    /// to the connection writer.
    pub fn new(
        acl: Vec<AclRule>,
        client: ConnectedClient,
        outbound_bound: usize,
        backlog_bound: usize,
    ) -> (Self, Receiver<Packet>) {
        let (tx, rx) = crossbeam_channel::bounded(outbound_bound);
        let receive_maximum = client.connect.receive_maximum();
        let will = client.connect.will.clone();
        let session = Self {
            acl,
            client: Some(client),
            outbound: tx,
            in_flight_tokens: i32::from(receive_maximum),
            backlog: VecDeque::new(),
            backlog_bound,
            qos_pending: AHashMap::new(),
            subscriptions: AHashMap::new(),
            expires_at: None,
            will,
        };
        (session, rx)
    }

    /// Build a detached session, as rehydrated from persistence. Its
    /// outbound queue has no consumer until a client attaches.
    pub fn detached(outbound_bound: usize, backlog_bound: usize) -> Self {
        let (tx, _rx) = crossbeam_channel::bounded(outbound_bound);
        Self {
            acl: Vec::new(),
            client: None,
            outbound: tx,
            in_flight_tokens: 0,
            backlog: VecDeque::new(),
            backlog_bound,
            qos_pending: AHashMap::new(),
            subscriptions: AHashMap::new(),
            expires_at: None,
            will: None,
        }
    }

    /// Push a packet onto the outbound queue. Returns false when the queue
    /// is full or the writer is gone; overflow is a deliberate silent drop.
    pub fn enqueue(&self, packet: Packet) -> bool {
        match self.outbound.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Whether the backlog can absorb one more delivery.
    pub fn backlog_has_room(&self) -> bool {
        self.backlog.len() < self.backlog_bound
    }

    /// True when any subscription requests QoS > 0, which keeps a detached
    /// session alive through its grace window.
    pub fn has_qos_subscription(&self) -> bool {
        self.subscriptions
            .values()
            .any(|opts| opts.qos > crate::packet::QoS::AtMostOnce)
    }
}
