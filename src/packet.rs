//! MQTT v5 packet types as the session engine consumes them.
//!
//! The byte-level codec lives in the connection layer; the broker core works
//! on decoded packets, so properties are kept as typed structs rather than
//! raw property bytes.

use bytes::Bytes;

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Effective delivery QoS: `min(publisher, subscriber)`.
    #[inline]
    pub fn downgrade(self, sub: QoS) -> QoS {
        std::cmp::min(self, sub)
    }

    pub fn from_u8(value: u8) -> Option<QoS> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT v5 reason codes used by the core.
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
}

/// MQTT v5 PUBLISH properties carried through routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    pub content_type: Option<String>,
}

/// A PUBLISH message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: PublishProperties,
}

/// MQTT v5 CONNECT properties the core consumes.
#[derive(Debug, Clone, Default)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
}

/// MQTT v5 Will properties the core consumes.
#[derive(Debug, Clone, Default)]
pub struct WillProperties {
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
}

/// Last-Will message, published when a session dies uncleanly.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: WillProperties,
}

/// A decoded CONNECT request.
#[derive(Debug, Clone, Default)]
pub struct Connect {
    /// Client identifier bytes; doubles as the session id.
    pub client_id: Bytes,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub properties: ConnectProperties,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// Receive-Maximum with the MQTT v5 default of 65535 when absent.
    pub fn receive_maximum(&self) -> u16 {
        self.properties.receive_maximum.unwrap_or(u16::MAX)
    }
}

/// Retain handling option from SUBSCRIBE (MQTT v5 3.8.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendOnSubscribe = 0,
    SendOnSubscribeIfNew = 1,
    DoNotSendOnSubscribe = 2,
}

impl RetainHandling {
    pub fn from_u8(value: u8) -> Option<RetainHandling> {
        match value {
            0 => Some(RetainHandling::SendOnSubscribe),
            1 => Some(RetainHandling::SendOnSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSendOnSubscribe),
            _ => None,
        }
    }
}

/// MQTT v5 subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

/// A SUBSCRIBE request.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

/// SUBACK response with per-filter reason codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

/// An UNSUBSCRIBE request.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK response with per-filter reason codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

/// Decoded control packets exchanged between the connection layer and the
/// session engine. CONNECT is handled by `Broker::register_client` and is a
/// protocol error if it shows up in `dispatch`.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Publish(Publish),
    Puback { packet_id: u16, reason: u8 },
    Pubrec { packet_id: u16, reason: u8 },
    Pubrel { packet_id: u16, reason: u8 },
    Pubcomp { packet_id: u16, reason: u8 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect { reason: u8 },
}

impl Packet {
    /// Packet name for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Publish(_) => "PUBLISH",
            Packet::Puback { .. } => "PUBACK",
            Packet::Pubrec { .. } => "PUBREC",
            Packet::Pubrel { .. } => "PUBREL",
            Packet::Pubcomp { .. } => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::Unsuback(_) => "UNSUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect { .. } => "DISCONNECT",
        }
    }
}
