//! mqhive - In-memory MQTT v5 broker core.
//!
//! Sessions, subscription routing, retained messages, QoS 0/1/2 delivery
//! state machines, topic aliasing, and the expiry scheduling that ties them
//! together. The wire codec, connection I/O, and transports are external
//! collaborators: they call [`Broker::register_client`],
//! [`Broker::dispatch`], and [`Broker::unregister_client`], and drain each
//! session's outbound queue.

pub mod auth;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod packet;
pub mod persistence;
pub mod retained;
pub mod scheduler;
pub mod session;
pub mod subscribe;
pub mod subtree;
pub mod sys_tree;

pub use broker::{Broker, BrokerHandle, Gauges, Registration, Reuse};
pub use config::Config;
pub use error::{Error, ProtocolError, Result};
pub use packet::{Packet, Publish, QoS};
pub use session::{SessionDeath, SessionId, WorkerHandle};
