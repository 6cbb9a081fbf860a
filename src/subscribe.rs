//! SUBSCRIBE / UNSUBSCRIBE handling.
//!
//! The session's own subscription map and the shared index change inside
//! one critical section, so a session appears in the index exactly when its
//! map holds the filter. Retained delivery happens afterwards, outside the
//! routing core.

use ahash::AHashMap;

use crate::auth::authorize_topic;
use crate::broker::Broker;
use crate::error::{ProtocolError, Result};
use crate::packet::{
    reason_code, Packet, Publish, QoS, RetainHandling, Suback, Subscribe, SubscriptionOptions,
    Unsuback, Unsubscribe,
};
use crate::persistence::{self, DbOp};
use crate::session::SessionId;

impl Broker {
    pub(crate) fn handle_subscribe(&self, session_id: &SessionId, req: Subscribe) -> Result<()> {
        let mut retained_wanted: Vec<(String, SubscriptionOptions)> = Vec::new();

        let record = {
            let mut core = self.core.lock();
            let core = &mut *core;
            let session = core
                .sessions
                .get_mut(session_id)
                .ok_or(ProtocolError::UnknownSession)?;

            let mut reason_codes = Vec::with_capacity(req.filters.len());
            for (filter, opts) in req.filters {
                if !authorize_topic(&filter, &session.acl) {
                    log::debug!(
                        "session {} not authorized to subscribe {:?}",
                        session_id,
                        filter
                    );
                    reason_codes.push(reason_code::NOT_AUTHORIZED);
                    continue;
                }

                let newly_added = session
                    .subscriptions
                    .insert(filter.clone(), opts)
                    .is_none();

                let mut entry = AHashMap::new();
                entry.insert(session_id.clone(), opts);
                core.subscriptions.add(&filter, entry);

                reason_codes.push(opts.qos as u8);

                let wants_retained = match opts.retain_handling {
                    RetainHandling::SendOnSubscribe => true,
                    RetainHandling::SendOnSubscribeIfNew => newly_added,
                    RetainHandling::DoNotSendOnSubscribe => false,
                };
                if wants_retained {
                    retained_wanted.push((filter, opts));
                }
            }

            session.enqueue(Packet::Suback(Suback {
                packet_id: req.packet_id,
                reason_codes,
            }));
            persistence::session_record(session)
        };
        self.persistence
            .send(DbOp::StoreSession(session_id.clone(), record));

        for (filter, opts) in retained_wanted {
            self.deliver_retained(session_id, &filter, &opts);
        }
        Ok(())
    }

    /// Deliver the retained messages matching a freshly subscribed filter.
    /// QoS is capped at the granted QoS; the retain flag survives only with
    /// Retain-As-Published. Each message gets a fresh packet id.
    fn deliver_retained(
        &self,
        session_id: &SessionId,
        filter: &str,
        opts: &SubscriptionOptions,
    ) {
        for stored in self.retained.matching(filter) {
            let qos = stored.qos.downgrade(opts.qos);
            let publish = Publish {
                dup: false,
                qos,
                retain: stored.retain && opts.retain_as_published,
                topic: stored.topic.clone(),
                packet_id: (qos > QoS::AtMostOnce).then(|| self.packet_ids.allocate()),
                payload: stored.payload.clone(),
                properties: stored.properties.clone(),
            };

            let mut core = self.core.lock();
            // The session may have been reaped while the store was scanned.
            if let Some(session) = core.sessions.get_mut(session_id) {
                crate::engine::deliver(session, publish, &self.stats);
            }
        }
    }

    pub(crate) fn handle_unsubscribe(&self, session_id: &SessionId, req: Unsubscribe) -> Result<()> {
        let record = {
            let mut core = self.core.lock();
            let core = &mut *core;
            let session = core
                .sessions
                .get_mut(session_id)
                .ok_or(ProtocolError::UnknownSession)?;

            let mut reason_codes = Vec::with_capacity(req.filters.len());
            for filter in req.filters {
                let existed = session.subscriptions.remove(&filter).is_some();
                if existed {
                    core.subscriptions.modify(&filter, |subs| {
                        subs.remove(session_id);
                        !subs.is_empty()
                    });
                    reason_codes.push(reason_code::SUCCESS);
                } else {
                    reason_codes.push(reason_code::NO_SUBSCRIPTION_EXISTED);
                }
            }

            session.enqueue(Packet::Unsuback(Unsuback {
                packet_id: req.packet_id,
                reason_codes,
            }));
            persistence::session_record(session)
        };
        self.persistence
            .send(DbOp::StoreSession(session_id.clone(), record));
        Ok(())
    }
}
