//! Broker facade: session registry, lifecycle, and runtime wiring.
//!
//! All invariant-coupled state (the session registry, the subscription
//! index, and each session's mutable fields) lives behind one mutex, the
//! routing core. Register, takeover, expiry, fan-out, and the subscribe
//! paths each run as a single critical section over it, which is what keeps
//! the registry and the index in lockstep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::auth::StaticAuth;
use crate::config::Config;
use crate::error::{Error, ProtocolError, Result};
use crate::fanout::PacketIdSource;
use crate::packet::{Connect, Packet, Publish, PublishProperties, SubscriptionOptions, Will};
use crate::persistence::{self, DbOp, PersistenceHandle, Store, StoreError};
use crate::retained::RetainedStore;
use crate::scheduler::QueueRunner;
use crate::session::{ConnectedClient, Session, SessionDeath, SessionId, WorkerHandle};
use crate::subtree::SubTree;
use crate::sys_tree::{self, BrokerStats};

/// The routing core: every container here mutates under one lock.
pub(crate) struct Core {
    pub sessions: AHashMap<SessionId, Session>,
    pub subscriptions: SubTree<AHashMap<SessionId, SubscriptionOptions>>,
}

/// Whether a CONNECT found prior session state to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    NewSession,
    ExistingSession,
}

/// What the connection layer gets back from a successful CONNECT.
pub struct Registration {
    pub session_id: SessionId,
    /// Connection id; pass it back to `unregister_client` on worker exit.
    pub client_id: u64,
    pub reuse: Reuse,
    /// Consumer side of the session's outbound queue.
    pub outbound: Receiver<Packet>,
}

/// Point-in-time gauges for the $SYS publisher.
pub struct Gauges {
    pub clients_total: u64,
    pub clients_connected: u64,
    pub retained_count: u64,
    pub subscriptions_count: u64,
}

/// The broker core.
pub struct Broker {
    pub(crate) core: Mutex<Core>,
    pub(crate) retained: RetainedStore,
    pub(crate) auth: StaticAuth,
    pub(crate) stats: BrokerStats,
    pub(crate) persistence: PersistenceHandle,
    pub(crate) session_timers: QueueRunner<SessionId>,
    pub(crate) packet_ids: PacketIdSource,
    next_client_id: AtomicU64,
    session_expiry_default: Duration,
    outbound_bound: usize,
    backlog_bound: usize,
    sys_interval: Duration,
}

impl Broker {
    /// Build a broker with persistence disabled and no threads running.
    /// Scheduler drains can be driven manually; `start` wires them up.
    pub fn new(config: Config) -> Self {
        Self::new_with(config, PersistenceHandle::disabled())
    }

    fn new_with(config: Config, persistence: PersistenceHandle) -> Self {
        Self {
            auth: StaticAuth::new(&config),
            core: Mutex::new(Core {
                sessions: AHashMap::new(),
                subscriptions: SubTree::new(),
            }),
            retained: RetainedStore::new(),
            stats: BrokerStats::new(),
            persistence,
            session_timers: QueueRunner::new(),
            packet_ids: PacketIdSource::new(),
            next_client_id: AtomicU64::new(1),
            session_expiry_default: Duration::from_secs(config.session_expiry_default),
            outbound_bound: config.outbound_queue_bound,
            backlog_bound: config.backlog_bound,
            sys_interval: Duration::from_secs(config.sys_interval),
        }
    }

    /// Handle a CONNECT: authenticate, then install or resume the session.
    ///
    /// With `clean_session`, or with no prior state, a fresh session is
    /// installed. Otherwise the prior session's subscriptions and pending
    /// QoS state carry over; its connected client, queues, and flight
    /// window are replaced and the expiry clock is cleared. An evicted
    /// connection is signalled with `Duplicate` and must not be waited on.
    pub fn register_client(&self, connect: Connect, worker: WorkerHandle) -> Result<Registration> {
        if connect.properties.receive_maximum == Some(0) {
            return Err(ProtocolError::ReceiveMaximumZero.into());
        }

        let acl = self
            .auth
            .authenticate(
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .ok_or(Error::BadCredentials)?;

        let session_id = SessionId::new(connect.client_id.clone());
        let clean_session = connect.clean_session;
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = ConnectedClient::new(connect, worker, client_id);
        let (mut session, outbound) =
            Session::new(acl, client, self.outbound_bound, self.backlog_bound);

        let (reuse, evicted) = {
            let mut core = self.core.lock();
            let prior = core.sessions.remove(&session_id);

            let (reuse, evicted) = match prior {
                Some(prior) if !clean_session => {
                    session.subscriptions = prior.subscriptions;
                    session.qos_pending = prior.qos_pending;
                    (Reuse::ExistingSession, prior.client)
                }
                Some(prior) => {
                    for filter in prior.subscriptions.keys() {
                        core.subscriptions.modify(filter, |subs| {
                            subs.remove(&session_id);
                            !subs.is_empty()
                        });
                    }
                    (Reuse::NewSession, prior.client)
                }
                None => (Reuse::NewSession, None),
            };

            core.sessions.insert(session_id.clone(), session);
            (reuse, evicted)
        };

        if let Some(old) = evicted {
            log::info!("session {} taken over, evicting client {}", session_id, old.client_id);
            old.worker.signal(SessionDeath::Duplicate(session_id.clone()));
        }

        Ok(Registration {
            session_id,
            client_id,
            reuse,
            outbound,
        })
    }

    /// Detach a connection from its session. `client_id` guards against a
    /// worker unregistering after a takeover already replaced it. The
    /// session stays in the registry until its grace window lapses.
    pub fn unregister_client(&self, session_id: &SessionId, client_id: u64) {
        let (expires_at, record) = {
            let mut core = self.core.lock();
            let Some(session) = core.sessions.get_mut(session_id) else {
                return;
            };
            match &session.client {
                Some(client) if client.client_id == client_id => {}
                _ => return,
            }
            let client = session.client.take().expect("checked above");

            let grace = client
                .connect
                .properties
                .session_expiry_interval
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(self.session_expiry_default);
            let expires_at = Instant::now() + grace;
            session.expires_at = Some(expires_at);
            (expires_at, persistence::session_record(session))
        };

        log::debug!("session {} detached, expires in {:?}", session_id, expires_at - Instant::now());
        self.persistence
            .send(DbOp::StoreSession(session_id.clone(), record));
        self.session_timers.enqueue(expires_at, session_id.clone());
    }

    /// Expiry drain for one session id.
    ///
    /// A session that reattached, or that still holds QoS > 0 subscriptions
    /// inside its grace window, survives the fire; the latter re-arms the
    /// timer. Everything else is reaped: registry and index entries go,
    /// persistence is told, and the will (if still armed) is published.
    pub fn expire(&self, session_id: &SessionId) {
        let will = {
            let mut core = self.core.lock();
            let Some(session) = core.sessions.get(session_id) else {
                return;
            };
            if session.client.is_some() {
                log::debug!("session {} reconnected before expiry", session_id);
                return;
            }
            if let Some(expires_at) = session.expires_at {
                if session.has_qos_subscription() && expires_at > Instant::now() {
                    self.session_timers.enqueue(expires_at, session_id.clone());
                    return;
                }
            }

            let mut session = core.sessions.remove(session_id).expect("present above");
            for filter in session.subscriptions.keys() {
                core.subscriptions.modify(filter, |subs| {
                    subs.remove(session_id);
                    !subs.is_empty()
                });
            }
            self.stats.incr_clients_expired();
            session.will.take()
        };

        log::info!("session {} expired", session_id);
        self.persistence.send(DbOp::RemoveSession(session_id.clone()));

        if let Some(will) = will {
            self.broadcast(None, will_publish(will));
        }
    }

    /// Atomically mutate a session. Returns `None` for an unknown id.
    pub fn modify_session<R>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut core = self.core.lock();
        core.sessions.get_mut(session_id).map(f)
    }

    /// Gauges for the $SYS publisher.
    pub fn gauges(&self) -> Gauges {
        let core = self.core.lock();
        let clients_total = core.sessions.len() as u64;
        let clients_connected = core
            .sessions
            .values()
            .filter(|s| s.client.is_some())
            .count() as u64;
        let subscriptions_count = core
            .sessions
            .values()
            .map(|s| s.subscriptions.len() as u64)
            .sum();
        Gauges {
            clients_total,
            clients_connected,
            retained_count: self.retained.count() as u64,
            subscriptions_count,
        }
    }

    /// Rehydrate sessions and retained messages from durable storage and
    /// arm an expiry timer for every restored session.
    pub fn restore_from_store(&self, store: &dyn Store) -> std::result::Result<(), StoreError> {
        let restored = store.load_sessions()?;
        let count = restored.len();
        {
            let mut core = self.core.lock();
            for (session_id, record) in restored {
                let mut session =
                    persistence::hydrate_session(record, self.outbound_bound, self.backlog_bound);
                let expires_at = session
                    .expires_at
                    .unwrap_or_else(|| Instant::now() + self.session_expiry_default);
                session.expires_at = Some(expires_at);

                for (filter, opts) in &session.subscriptions {
                    let mut entry = AHashMap::new();
                    entry.insert(session_id.clone(), *opts);
                    core.subscriptions.add(filter, entry);
                }
                self.session_timers.enqueue(expires_at, session_id.clone());
                core.sessions.insert(session_id, session);
            }
        }
        log::info!("restored {} sessions", count);

        let retained = store
            .load_retained()?
            .into_iter()
            .map(|(topic, record)| {
                let entry = persistence::retained_from_record(&topic, record);
                (topic, entry)
            })
            .collect();
        self.retained.restore(retained);
        Ok(())
    }

    /// Start the broker with the configured persistence backend.
    #[cfg(feature = "persistence")]
    pub fn start(config: Config) -> Result<BrokerHandle> {
        let store: Option<Box<dyn Store>> = if config.persistence.enabled {
            Some(Box::new(persistence::FjallStore::open(
                &config.persistence.path,
            )?))
        } else {
            None
        };
        Self::start_with_store(config, store)
    }

    /// Start the broker without durable storage.
    #[cfg(not(feature = "persistence"))]
    pub fn start(config: Config) -> Result<BrokerHandle> {
        Self::start_with_store(config, None)
    }

    /// Start the broker: rehydrate from `store` (if any), then spawn the
    /// expiry runners, the $SYS publisher, and the persistence writer.
    pub fn start_with_store(
        config: Config,
        store: Option<Box<dyn Store>>,
    ) -> Result<BrokerHandle> {
        let mut threads = Vec::new();

        let broker = if let Some(store) = store {
            let (handle, db_rx) = PersistenceHandle::bounded();
            let broker = Broker::new_with(config, handle);
            broker.restore_from_store(store.as_ref())?;
            threads.push(persistence::spawn_writer(store, db_rx));
            broker
        } else {
            Broker::new(config)
        };

        let broker = Arc::new(broker);

        threads.push(broker.session_timers.spawn("mqhive-session-expiry", {
            let broker = Arc::clone(&broker);
            move |session_id| broker.expire(&session_id)
        }));
        threads.push(broker.retained.timers().spawn("mqhive-retained-expiry", {
            let broker = Arc::clone(&broker);
            move |topic| {
                if broker.retained.cleanup(&topic) {
                    broker.persistence.send(DbOp::RemoveRetained(topic));
                }
            }
        }));

        let (sys_stop, sys_stop_rx) = crossbeam_channel::bounded(1);
        threads.push(sys_tree::spawn_sys_publisher(
            Arc::clone(&broker),
            broker.sys_interval,
            sys_stop_rx,
        ));

        Ok(BrokerHandle {
            broker,
            threads,
            sys_stop,
        })
    }
}

/// Shape a will into the publish the router broadcasts at reap time.
fn will_publish(will: Will) -> Publish {
    Publish {
        dup: false,
        qos: will.qos,
        retain: will.retain,
        topic: will.topic,
        packet_id: None,
        payload: will.payload,
        properties: PublishProperties {
            message_expiry_interval: will.properties.message_expiry_interval,
            content_type: will.properties.content_type,
            ..Default::default()
        },
    }
}

/// A running broker and its background threads.
pub struct BrokerHandle {
    broker: Arc<Broker>,
    threads: Vec<JoinHandle<()>>,
    sys_stop: Sender<()>,
}

impl BrokerHandle {
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Stop every background thread and drain the persistence queue.
    pub fn stop(self) {
        self.broker.session_timers.shutdown();
        self.broker.retained.timers().shutdown();
        let _ = self.sys_stop.send(());
        self.broker.persistence.close();
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        reason_code, QoS, RetainHandling, Subscribe, Unsubscribe, WillProperties,
    };
    use bytes::Bytes;
    use crossbeam_channel::TryRecvError;

    fn connect(id: &str) -> Connect {
        Connect {
            client_id: Bytes::copy_from_slice(id.as_bytes()),
            clean_session: true,
            ..Default::default()
        }
    }

    fn register(broker: &Broker, connect: Connect) -> (Registration, Receiver<SessionDeath>) {
        let (worker, death) = WorkerHandle::new();
        let registration = broker.register_client(connect, worker).unwrap();
        (registration, death)
    }

    fn sub_opts(qos: QoS) -> SubscriptionOptions {
        SubscriptionOptions {
            qos,
            ..Default::default()
        }
    }

    fn subscribe(broker: &Broker, reg: &Registration, filter: &str, opts: SubscriptionOptions) {
        broker
            .dispatch(
                &reg.session_id,
                Packet::Subscribe(Subscribe {
                    packet_id: 1,
                    filters: vec![(filter.to_string(), opts)],
                }),
            )
            .unwrap();
        match reg.outbound.try_recv().unwrap() {
            Packet::Suback(suback) => {
                assert_eq!(suback.reason_codes, vec![opts.qos as u8]);
            }
            other => panic!("expected SUBACK, got {}", other.name()),
        }
    }

    fn publish(topic: &str, qos: QoS, body: &'static [u8]) -> Publish {
        Publish {
            qos,
            topic: topic.to_string(),
            packet_id: (qos > QoS::AtMostOnce).then_some(11),
            payload: Bytes::from_static(body),
            ..Default::default()
        }
    }

    fn drain_publishes(rx: &Receiver<Packet>) -> Vec<Publish> {
        rx.try_iter()
            .filter_map(|packet| match packet {
                Packet::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    // S1: QoS 0 fan-out.
    #[test]
    fn test_qos0_fanout() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        let (b, _) = register(&broker, connect("b"));
        subscribe(&broker, &b, "sensors/+/temp", sub_opts(QoS::AtMostOnce));

        broker
            .dispatch(
                &a.session_id,
                Packet::Publish(publish("sensors/1/temp", QoS::AtMostOnce, b"23")),
            )
            .unwrap();

        let delivered = drain_publishes(&b.outbound);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].topic, "sensors/1/temp");
        assert_eq!(delivered[0].qos, QoS::AtMostOnce);
        assert_eq!(delivered[0].payload.as_ref(), b"23");
        assert!(!delivered[0].dup);
        assert!(!delivered[0].retain);
        assert!(drain_publishes(&a.outbound).is_empty());
    }

    // S2: retained delivery on subscribe.
    #[test]
    fn test_retained_delivered_on_subscribe() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));

        let mut retained = publish("status/boiler", QoS::AtLeastOnce, b"on");
        retained.retain = true;
        broker
            .dispatch(&a.session_id, Packet::Publish(retained))
            .unwrap();
        // Publisher gets its PUBACK.
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            Packet::Puback { packet_id: 11, reason: 0 }
        ));

        let (c, _) = register(&broker, connect("c"));
        let opts = SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            retain_as_published: true,
            retain_handling: RetainHandling::SendOnSubscribe,
            ..Default::default()
        };
        subscribe(&broker, &c, "status/#", opts);

        let delivered = drain_publishes(&c.outbound);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].topic, "status/boiler");
        assert_eq!(delivered[0].qos, QoS::AtLeastOnce);
        assert!(delivered[0].retain);
        assert_eq!(delivered[0].payload.as_ref(), b"on");
        assert!(delivered[0].packet_id.is_some());
    }

    // S3: session takeover.
    #[test]
    fn test_session_takeover() {
        let broker = Broker::new(Config::default());
        let mut c1 = connect("x");
        c1.clean_session = false;
        let (first, first_death) = register(&broker, c1);
        assert_eq!(first.reuse, Reuse::NewSession);
        subscribe(&broker, &first, "t/#", sub_opts(QoS::AtMostOnce));

        let mut c2 = connect("x");
        c2.clean_session = false;
        let (second, _) = register(&broker, c2);
        assert_eq!(second.reuse, Reuse::ExistingSession);

        // The evicted worker hears about it exactly once.
        assert_eq!(
            first_death.try_recv().unwrap(),
            SessionDeath::Duplicate(SessionId::from("x"))
        );
        assert_eq!(first_death.try_recv(), Err(TryRecvError::Empty));

        // The subscription survived; delivery goes to the new connection.
        let (b, _) = register(&broker, connect("pub"));
        broker
            .dispatch(
                &b.session_id,
                Packet::Publish(publish("t/1", QoS::AtMostOnce, b"hi")),
            )
            .unwrap();
        assert_eq!(drain_publishes(&second.outbound).len(), 1);
        assert!(drain_publishes(&first.outbound).is_empty());
    }

    // S4: QoS 2 publish, both directions.
    #[test]
    fn test_qos2_flow() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        subscribe(&broker, &a, "q2/#", sub_opts(QoS::ExactlyOnce));
        let (b, _) = register(&broker, connect("b"));

        let mut p = publish("q2/a", QoS::ExactlyOnce, b"x");
        p.packet_id = Some(7);
        broker.dispatch(&b.session_id, Packet::Publish(p)).unwrap();

        assert!(matches!(
            b.outbound.try_recv().unwrap(),
            Packet::Pubrec { packet_id: 7, reason: 0 }
        ));
        // Not routed until the PUBREL arrives.
        assert!(drain_publishes(&a.outbound).is_empty());

        broker
            .dispatch(&b.session_id, Packet::Pubrel { packet_id: 7, reason: 0 })
            .unwrap();
        assert!(matches!(
            b.outbound.try_recv().unwrap(),
            Packet::Pubcomp { packet_id: 7, reason: 0 }
        ));

        let delivered = drain_publishes(&a.outbound);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].qos, QoS::ExactlyOnce);
        assert_eq!(delivered[0].topic, "q2/a");
        assert_eq!(delivered[0].payload.as_ref(), b"x");

        // A second PUBREL finds nothing and says so.
        broker
            .dispatch(&b.session_id, Packet::Pubrel { packet_id: 7, reason: 0 })
            .unwrap();
        assert!(matches!(
            b.outbound.try_recv().unwrap(),
            Packet::Pubcomp {
                packet_id: 7,
                reason: reason_code::PACKET_IDENTIFIER_NOT_FOUND
            }
        ));
        assert!(drain_publishes(&a.outbound).is_empty());
    }

    // S5: Receive-Maximum back-pressure.
    #[test]
    fn test_receive_maximum_backpressure() {
        let broker = Broker::new(Config::default());
        let mut c = connect("a");
        c.properties.receive_maximum = Some(1);
        let (a, _) = register(&broker, c);
        subscribe(&broker, &a, "load/#", sub_opts(QoS::AtLeastOnce));
        let (b, _) = register(&broker, connect("b"));

        for _ in 0..3 {
            let mut p = publish("load/x", QoS::AtLeastOnce, b"m");
            p.packet_id = Some(21);
            broker.dispatch(&b.session_id, Packet::Publish(p)).unwrap();
            let _ = b.outbound.try_recv(); // PUBACK to the publisher
        }

        let first = drain_publishes(&a.outbound);
        assert_eq!(first.len(), 1);
        let (pending, backlog) = broker
            .modify_session(&a.session_id, |s| (s.qos_pending.len(), s.backlog.len()))
            .unwrap();
        assert_eq!(pending, 3);
        assert_eq!(backlog, 2);

        // Acking the first releases exactly one more.
        broker
            .dispatch(
                &a.session_id,
                Packet::Puback {
                    packet_id: first[0].packet_id.unwrap(),
                    reason: 0,
                },
            )
            .unwrap();
        let second = drain_publishes(&a.outbound);
        assert_eq!(second.len(), 1);
        let (pending, backlog) = broker
            .modify_session(&a.session_id, |s| (s.qos_pending.len(), s.backlog.len()))
            .unwrap();
        assert_eq!(pending, 2);
        assert_eq!(backlog, 1);
    }

    // S6: will published on unclean death.
    #[test]
    fn test_will_on_unclean_disconnect() {
        let broker = Broker::new(Config::default());
        let (listener, _) = register(&broker, connect("listener"));
        subscribe(&broker, &listener, "goodbye", sub_opts(QoS::AtMostOnce));

        let mut c = connect("d");
        c.will = Some(Will {
            topic: "goodbye".to_string(),
            payload: Bytes::from_static(b"bye"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: WillProperties::default(),
        });
        let (d, _) = register(&broker, c);

        // Connection drops with no DISCONNECT packet.
        broker.unregister_client(&d.session_id, d.client_id);
        assert_eq!(broker.session_timers.len(), 1);

        // No QoS>0 subscriptions on the session, so the expiry fire reaps.
        broker.expire(&d.session_id);

        let delivered = drain_publishes(&listener.outbound);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].topic, "goodbye");
        assert_eq!(delivered[0].payload.as_ref(), b"bye");
        assert!(broker
            .modify_session(&d.session_id, |_| ())
            .is_none());
    }

    #[test]
    fn test_normal_disconnect_clears_will() {
        let broker = Broker::new(Config::default());
        let (listener, _) = register(&broker, connect("listener"));
        subscribe(&broker, &listener, "goodbye", sub_opts(QoS::AtMostOnce));

        let mut c = connect("d");
        c.will = Some(Will {
            topic: "goodbye".to_string(),
            payload: Bytes::from_static(b"bye"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: WillProperties::default(),
        });
        let (d, _) = register(&broker, c);

        broker
            .dispatch(
                &d.session_id,
                Packet::Disconnect {
                    reason: reason_code::NORMAL_DISCONNECTION,
                },
            )
            .unwrap();
        broker.unregister_client(&d.session_id, d.client_id);
        broker.expire(&d.session_id);

        assert!(drain_publishes(&listener.outbound).is_empty());
    }

    #[test]
    fn test_expiry_rearms_for_qos_subscriptions() {
        let broker = Broker::new(Config::default());
        let mut c = connect("a");
        c.clean_session = false;
        let (a, _) = register(&broker, c);
        subscribe(&broker, &a, "t/#", sub_opts(QoS::AtLeastOnce));

        broker.unregister_client(&a.session_id, a.client_id);
        // Grace window still open and a QoS 1 subscription exists: the
        // session survives the fire and the timer re-arms.
        broker.expire(&a.session_id);
        assert!(broker.modify_session(&a.session_id, |_| ()).is_some());
        assert_eq!(broker.session_timers.len(), 1);
    }

    #[test]
    fn test_expire_skips_connected_session() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        broker.expire(&a.session_id);
        assert!(broker.modify_session(&a.session_id, |_| ()).is_some());
    }

    #[test]
    fn test_receive_maximum_zero_rejected() {
        let broker = Broker::new(Config::default());
        let mut c = connect("a");
        c.properties.receive_maximum = Some(0);
        let (worker, _) = WorkerHandle::new();
        assert!(matches!(
            broker.register_client(c, worker),
            Err(Error::Protocol(ProtocolError::ReceiveMaximumZero))
        ));
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let config = Config {
            allow_anonymous: false,
            ..Default::default()
        };
        let broker = Broker::new(config);
        let (worker, _) = WorkerHandle::new();
        assert!(matches!(
            broker.register_client(connect("a"), worker),
            Err(Error::BadCredentials)
        ));
    }

    #[test]
    fn test_unsubscribe_reason_codes_and_index() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        subscribe(&broker, &a, "t/#", sub_opts(QoS::AtMostOnce));

        broker
            .dispatch(
                &a.session_id,
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: 2,
                    filters: vec!["t/#".to_string(), "unknown".to_string()],
                }),
            )
            .unwrap();
        match a.outbound.try_recv().unwrap() {
            Packet::Unsuback(unsuback) => {
                assert_eq!(
                    unsuback.reason_codes,
                    vec![reason_code::SUCCESS, reason_code::NO_SUBSCRIPTION_EXISTED]
                );
            }
            other => panic!("expected UNSUBACK, got {}", other.name()),
        }

        // Nothing routes to the dropped filter any more.
        let (b, _) = register(&broker, connect("b"));
        broker
            .dispatch(
                &b.session_id,
                Packet::Publish(publish("t/1", QoS::AtMostOnce, b"x")),
            )
            .unwrap();
        assert!(drain_publishes(&a.outbound).is_empty());
        assert_eq!(broker.gauges().subscriptions_count, 0);
    }

    #[test]
    fn test_publish_denied_by_acl_naks() {
        let config = Config {
            allow_anonymous: false,
            users: vec![crate::config::UserConfig {
                name: "u".to_string(),
                password: Some("pw".to_string()),
                password_hash: None,
                acls: vec!["deny secret/#".to_string()],
            }],
            ..Default::default()
        };
        let broker = Broker::new(config);
        let mut c = connect("a");
        c.username = Some("u".to_string());
        c.password = Some(Bytes::from_static(b"pw"));
        let (a, _) = register(&broker, c);

        let mut p = publish("secret/x", QoS::AtLeastOnce, b"x");
        p.packet_id = Some(5);
        broker.dispatch(&a.session_id, Packet::Publish(p)).unwrap();
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            Packet::Puback {
                packet_id: 5,
                reason: reason_code::NOT_AUTHORIZED
            }
        ));

        let mut p = publish("secret/x", QoS::ExactlyOnce, b"x");
        p.packet_id = Some(6);
        broker.dispatch(&a.session_id, Packet::Publish(p)).unwrap();
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            Packet::Pubrec {
                packet_id: 6,
                reason: reason_code::NOT_AUTHORIZED
            }
        ));
    }

    #[test]
    fn test_unknown_alias_fails_acl() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));

        // Alias 4 was never registered; the topic stays empty and the
        // publish is refused rather than killing the session.
        let mut p = publish("", QoS::AtLeastOnce, b"x");
        p.packet_id = Some(9);
        p.properties.topic_alias = Some(4);
        broker.dispatch(&a.session_id, Packet::Publish(p)).unwrap();
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            Packet::Puback {
                packet_id: 9,
                reason: reason_code::NOT_AUTHORIZED
            }
        ));
    }

    #[test]
    fn test_inbound_alias_resolves_before_routing() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        let (b, _) = register(&broker, connect("b"));
        subscribe(&broker, &b, "alias/topic", sub_opts(QoS::AtMostOnce));

        let mut p = publish("alias/topic", QoS::AtMostOnce, b"1");
        p.properties.topic_alias = Some(2);
        broker.dispatch(&a.session_id, Packet::Publish(p)).unwrap();

        let mut p = publish("", QoS::AtMostOnce, b"2");
        p.properties.topic_alias = Some(2);
        broker.dispatch(&a.session_id, Packet::Publish(p)).unwrap();

        let delivered = drain_publishes(&b.outbound);
        assert_eq!(delivered.len(), 2);
        assert!(delivered
            .iter()
            .all(|p| p.topic == "alias/topic" && p.properties.topic_alias.is_none()));
    }

    #[test]
    fn test_outbound_alias_assigned_to_subscriber() {
        let broker = Broker::new(Config::default());
        let mut c = connect("sub");
        c.properties.topic_alias_maximum = Some(5);
        let (sub, _) = register(&broker, c);
        subscribe(&broker, &sub, "t/#", sub_opts(QoS::AtMostOnce));
        let (b, _) = register(&broker, connect("pub"));

        for _ in 0..2 {
            broker
                .dispatch(
                    &b.session_id,
                    Packet::Publish(publish("t/1", QoS::AtMostOnce, b"x")),
                )
                .unwrap();
        }

        let delivered = drain_publishes(&sub.outbound);
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].properties.topic_alias, Some(1));
        assert_eq!(delivered[0].topic, "t/1");
        assert_eq!(delivered[1].properties.topic_alias, Some(1));
        assert_eq!(delivered[1].topic, "");
    }

    #[test]
    fn test_no_local_suppresses_echo() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        let opts = SubscriptionOptions {
            qos: QoS::AtMostOnce,
            no_local: true,
            ..Default::default()
        };
        subscribe(&broker, &a, "loop/#", opts);

        broker
            .dispatch(
                &a.session_id,
                Packet::Publish(publish("loop/x", QoS::AtMostOnce, b"x")),
            )
            .unwrap();
        assert!(drain_publishes(&a.outbound).is_empty());
    }

    #[test]
    fn test_unexpected_packet_is_fatal() {
        let broker = Broker::new(Config::default());
        let (a, _) = register(&broker, connect("a"));
        let err = broker
            .dispatch(&a.session_id, Packet::Connect(connect("a")))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedPacket("CONNECT"))
        ));
    }

    #[test]
    fn test_registry_and_index_stay_in_lockstep() {
        let broker = Broker::new(Config::default());
        let mut c = connect("a");
        c.clean_session = false;
        let (a, _) = register(&broker, c);
        subscribe(&broker, &a, "x/#", sub_opts(QoS::AtMostOnce));
        subscribe(&broker, &a, "y/+", sub_opts(QoS::AtMostOnce));
        assert_eq!(broker.gauges().subscriptions_count, 2);

        // A clean-session reconnect discards both the session's map and
        // the index entries together.
        let (a2, _) = register(&broker, connect("a"));
        assert_eq!(a2.reuse, Reuse::NewSession);
        assert_eq!(broker.gauges().subscriptions_count, 0);
        let subs = broker
            .modify_session(&a2.session_id, |s| s.subscriptions.len())
            .unwrap();
        assert_eq!(subs, 0);
    }

    #[test]
    fn test_start_and_stop_runtime() {
        let handle = Broker::start(Config::default()).unwrap();
        let broker = handle.broker();
        let (a, _) = register(broker, connect("a"));
        subscribe(broker, &a, "t/#", sub_opts(QoS::AtMostOnce));
        handle.stop();
    }
}
