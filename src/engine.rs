//! Per-session QoS state machines and flow control.
//!
//! Two layers: outbound delivery (flight tokens, backlog, alias
//! substitution) and the inbound packet machine driven by `dispatch`. All
//! session mutation happens inside the broker's routing-core critical
//! section; only the follow-up broadcast of a released QoS 2 publish runs
//! after the lock is dropped.

use crate::auth::authorize_topic;
use crate::broker::Broker;
use crate::error::{ProtocolError, Result};
use crate::packet::{reason_code, Packet, Publish, QoS};
use crate::session::{Session, SessionId};
use crate::sys_tree::BrokerStats;

/// Deliver a publish to a subscriber session.
///
/// QoS 0 goes straight to the outbound queue. QoS > 0 is tracked in
/// `qos_pending` first; with no flight token free it waits in the backlog,
/// and a full backlog drops the delivery outright. That drop is the
/// bounded-memory back-pressure contract: a saturated subscriber never
/// stalls the publisher.
pub(crate) fn deliver(session: &mut Session, publish: Publish, stats: &BrokerStats) {
    if publish.qos == QoS::AtMostOnce {
        if session.client.is_some() {
            send_now(session, publish, stats);
        } else {
            stats.incr_publish_dropped();
        }
        return;
    }

    let packet_id = publish.packet_id.unwrap_or(0);
    session.qos_pending.insert(packet_id, publish.clone());

    if session.client.is_none() {
        // Detached session: the message waits in qos_pending for a resume.
        return;
    }

    if session.in_flight_tokens == 0 {
        if session.backlog_has_room() {
            session.backlog.push_back(publish);
        } else {
            session.qos_pending.remove(&packet_id);
            stats.incr_publish_dropped();
        }
        return;
    }

    session.in_flight_tokens -= 1;
    if !send_now(session, publish, stats) {
        session.qos_pending.remove(&packet_id);
        session.in_flight_tokens += 1;
    }
}

/// Return one flight token and, if deliveries are backed up, spend it on
/// the oldest one. Keeps `in_flight_tokens + unacked` at the negotiated
/// Receive-Maximum.
pub(crate) fn release_flight_slot(session: &mut Session, stats: &BrokerStats) {
    session.in_flight_tokens += 1;

    if session.client.is_none() {
        return;
    }
    if let Some(publish) = session.backlog.pop_front() {
        let packet_id = publish.packet_id.unwrap_or(0);
        session.in_flight_tokens -= 1;
        if !send_now(session, publish, stats) {
            session.qos_pending.remove(&packet_id);
            session.in_flight_tokens += 1;
        }
    }
}

/// Apply outbound alias substitution and push onto the outbound queue.
/// Returns false when the queue rejected the packet; the caller unwinds
/// token and pending state.
fn send_now(session: &mut Session, mut publish: Publish, stats: &BrokerStats) -> bool {
    if let Some(client) = session.client.as_mut() {
        client.apply_outbound_alias(&mut publish);
    }
    if session.enqueue(Packet::Publish(publish)) {
        stats.incr_messages_sent();
        true
    } else {
        stats.incr_publish_dropped();
        false
    }
}

impl Broker {
    /// Feed one inbound packet from the connection layer into the session's
    /// state machine. A returned error is fatal to that session; the worker
    /// is expected to exit and unregister.
    pub fn dispatch(&self, session_id: &SessionId, packet: Packet) -> Result<()> {
        // Subscribe paths manage their own locking so retained-message
        // scans happen outside the routing core.
        match packet {
            Packet::Subscribe(req) => return self.handle_subscribe(session_id, req),
            Packet::Unsubscribe(req) => return self.handle_unsubscribe(session_id, req),
            _ => {}
        }

        let mut rebroadcast = None;
        {
            let mut core = self.core.lock();
            let session = core
                .sessions
                .get_mut(session_id)
                .ok_or(ProtocolError::UnknownSession)?;

            match packet {
                Packet::Pingreq => {
                    session.enqueue(Packet::Pingresp);
                }
                Packet::Puback { packet_id, .. } => {
                    session.qos_pending.remove(&packet_id);
                    release_flight_slot(session, &self.stats);
                }
                Packet::Pubrec { packet_id, .. } => {
                    session.qos_pending.remove(&packet_id);
                    session.enqueue(Packet::Pubrel {
                        packet_id,
                        reason: reason_code::SUCCESS,
                    });
                }
                Packet::Pubrel { packet_id, .. } => {
                    let stored = session.qos_pending.remove(&packet_id);
                    let reason = if stored.is_some() {
                        reason_code::SUCCESS
                    } else {
                        reason_code::PACKET_IDENTIFIER_NOT_FOUND
                    };
                    session.enqueue(Packet::Pubcomp { packet_id, reason });
                    rebroadcast = stored;
                }
                Packet::Pubcomp { .. } => {
                    release_flight_slot(session, &self.stats);
                }
                Packet::Publish(publish) => {
                    rebroadcast = self.inbound_publish(session, publish);
                }
                Packet::Disconnect { reason } => {
                    if reason == reason_code::NORMAL_DISCONNECTION {
                        session.will = None;
                    }
                    // DisconnectWithWill (0x04) leaves the will armed.
                }
                other => {
                    return Err(ProtocolError::UnexpectedPacket(other.name()).into());
                }
            }
        }

        if let Some(publish) = rebroadcast {
            self.broadcast(Some(session_id), publish);
        }
        Ok(())
    }

    /// Inbound PUBLISH: alias resolution, ACL, then the per-QoS machine.
    /// Returns a publish that should be broadcast once the core unlocks.
    fn inbound_publish(&self, session: &mut Session, mut publish: Publish) -> Option<Publish> {
        if let Some(client) = session.client.as_mut() {
            client.resolve_inbound_alias(&mut publish);
        }

        if !authorize_topic(&publish.topic, &session.acl) {
            log::debug!("publish to {:?} not authorized", publish.topic);
            let packet_id = publish.packet_id.unwrap_or(0);
            match publish.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    session.enqueue(Packet::Puback {
                        packet_id,
                        reason: reason_code::NOT_AUTHORIZED,
                    });
                }
                QoS::ExactlyOnce => {
                    session.enqueue(Packet::Pubrec {
                        packet_id,
                        reason: reason_code::NOT_AUTHORIZED,
                    });
                }
            }
            return None;
        }

        self.stats.incr_messages_received();
        match publish.qos {
            QoS::AtMostOnce => Some(publish),
            QoS::AtLeastOnce => {
                session.enqueue(Packet::Puback {
                    packet_id: publish.packet_id.unwrap_or(0),
                    reason: reason_code::SUCCESS,
                });
                Some(publish)
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap_or(0);
                session.enqueue(Packet::Pubrec {
                    packet_id,
                    reason: reason_code::SUCCESS,
                });
                // Held until the PUBREL releases it.
                session.qos_pending.insert(packet_id, publish);
                None
            }
        }
    }
}
