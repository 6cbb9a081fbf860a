//! Publish routing: retained update, subscriber lookup, fan-out.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::broker::Broker;
use crate::engine;
use crate::packet::{Publish, QoS, SubscriptionOptions};
use crate::persistence::{self, DbOp};
use crate::retained::RetainChange;
use crate::session::SessionId;

/// Broker-wide packet id source: monotonic over 1..=65535, wraps to 1,
/// never 0.
pub(crate) struct PacketIdSource {
    next: AtomicU16,
}

impl PacketIdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(0),
        }
    }

    pub fn allocate(&self) -> u16 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let id = if current == u16::MAX { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                id,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return id,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Broker {
    /// Route a publish: update retention, resolve the subscriber set, and
    /// hand a per-subscriber copy to each session's engine.
    ///
    /// `source` marks the publishing session for `no_local` filtering;
    /// broker-originated publishes (wills, `$SYS`) pass `None`. Deliveries
    /// to any one subscriber preserve the arrival order of publishes from a
    /// given source because the whole fan-out runs inside one critical
    /// section.
    pub fn broadcast(&self, source: Option<&SessionId>, publish: Publish) {
        match self.retained.retain(&publish) {
            RetainChange::Stored => {
                self.persistence.send(DbOp::StoreRetained(
                    publish.topic.clone(),
                    persistence::retained_record(&publish),
                ));
            }
            RetainChange::Removed => {
                self.persistence
                    .send(DbOp::RemoveRetained(publish.topic.clone()));
            }
            RetainChange::None => {}
        }

        let mut core = self.core.lock();
        let targets: Vec<(SessionId, SubscriptionOptions)> = core
            .subscriptions
            .find_map(&publish.topic, |subs| {
                subs.iter().map(|(id, opts)| (id.clone(), *opts)).collect()
            });
        if targets.is_empty() {
            return;
        }

        let packet_id = self.packet_ids.allocate();
        for (id, opts) in targets {
            if opts.no_local && source == Some(&id) {
                continue;
            }
            // Sessions reaped between lookup and delivery are skipped.
            let Some(session) = core.sessions.get_mut(&id) else {
                continue;
            };
            let out = subscriber_publish(&publish, &opts, packet_id);
            engine::deliver(session, out, &self.stats);
        }
    }
}

/// Shape a publish for one subscriber: QoS downgraded to `min(pub, sub)`,
/// retain surviving only with Retain-As-Published, the shared packet id
/// attached for QoS > 0.
fn subscriber_publish(publish: &Publish, opts: &SubscriptionOptions, packet_id: u16) -> Publish {
    let qos = publish.qos.downgrade(opts.qos);
    Publish {
        dup: false,
        qos,
        retain: publish.retain && opts.retain_as_published,
        topic: publish.topic.clone(),
        packet_id: (qos > QoS::AtMostOnce).then_some(packet_id),
        payload: publish.payload.clone(),
        properties: publish.properties.clone(),
    }
}
