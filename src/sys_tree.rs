//! $SYS topic broker statistics.
//!
//! Atomic counters updated on the hot path, published periodically as
//! retained QoS 2 messages with a 60 second expiry. Values are only
//! re-published when they changed since the previous tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, tick, Receiver};

use crate::broker::Broker;
use crate::packet::{Publish, PublishProperties, QoS};

/// $SYS topic paths.
pub mod topics {
    pub const CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const CLIENTS_EXPIRED: &str = "$SYS/broker/clients/expired";
    pub const RETAINED_COUNT: &str = "$SYS/broker/retained messages/count";
    pub const SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";
    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const PUBLISH_DROPPED: &str = "$SYS/broker/publish/messages/dropped";
}

/// How long a published $SYS value stays retained.
const SYS_MESSAGE_EXPIRY: u32 = 60;

/// Broker-wide counters, updated by routing and expiry paths.
pub struct BrokerStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub publish_dropped: AtomicU64,
    pub clients_expired: AtomicU64,
}

impl BrokerStats {
    pub const fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            publish_dropped: AtomicU64::new(0),
            clients_expired: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn incr_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_publish_dropped(&self) {
        self.publish_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_clients_expired(&self) {
        self.clients_expired.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Previous values for change detection.
#[derive(Default)]
struct Previous {
    values: ahash::AHashMap<&'static str, u64>,
}

impl Previous {
    fn changed(&mut self, topic: &'static str, value: u64) -> bool {
        self.values.insert(topic, value) != Some(value)
    }
}

/// Spawn the $SYS publisher thread. Exits when `stop` receives or closes.
pub(crate) fn spawn_sys_publisher(
    broker: Arc<Broker>,
    interval: Duration,
    stop: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("mqhive-sys".to_string())
        .spawn(move || {
            let ticker = tick(interval);
            let mut previous = Previous::default();
            loop {
                select! {
                    recv(stop) -> _ => return,
                    recv(ticker) -> _ => publish_stats(&broker, &mut previous),
                }
            }
        })
        .expect("failed to spawn $SYS publisher")
}

fn publish_stats(broker: &Arc<Broker>, previous: &mut Previous) {
    let gauges = broker.gauges();
    let stats = &broker.stats;
    let values = [
        (topics::CLIENTS_TOTAL, gauges.clients_total),
        (topics::CLIENTS_CONNECTED, gauges.clients_connected),
        (topics::RETAINED_COUNT, gauges.retained_count),
        (topics::SUBSCRIPTIONS_COUNT, gauges.subscriptions_count),
        (
            topics::MESSAGES_RECEIVED,
            stats.messages_received.load(Ordering::Relaxed),
        ),
        (
            topics::MESSAGES_SENT,
            stats.messages_sent.load(Ordering::Relaxed),
        ),
        (
            topics::PUBLISH_DROPPED,
            stats.publish_dropped.load(Ordering::Relaxed),
        ),
        (
            topics::CLIENTS_EXPIRED,
            stats.clients_expired.load(Ordering::Relaxed),
        ),
    ];

    for (topic, value) in values {
        if previous.changed(topic, value) {
            broker.broadcast(None, sys_publish(topic, value));
        }
    }
}

/// A $SYS stat publish: QoS 2, retained, 60 second expiry.
fn sys_publish(topic: &str, value: u64) -> Publish {
    Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: topic.to_string(),
        packet_id: None,
        payload: Bytes::from(value.to_string()),
        properties: PublishProperties {
            message_expiry_interval: Some(SYS_MESSAGE_EXPIRY),
            ..Default::default()
        },
    }
}
