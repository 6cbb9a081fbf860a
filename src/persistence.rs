//! Persistence facade: write-behind queue and startup rehydration.
//!
//! The core emits session and retained-message changes onto a bounded
//! channel and never waits for the disk. One writer thread drains the
//! channel into a [`Store`]. Failures are logged and dropped; durability is
//! best-effort by design.
//!
//! The default backend is fjall, an LSM-tree embedded database, behind the
//! `persistence` cargo feature.

use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::{Publish, PublishProperties, QoS, RetainHandling, SubscriptionOptions};
use crate::retained::Retained;
use crate::session::{Session, SessionId};

/// Bound of the write-behind queue.
pub const DB_QUEUE_BOUND: usize = 100;

/// Errors from a persistence backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("read error: {0}")]
    Read(String),
}

/// A stored subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

/// A stored publish, used for unacked QoS 1/2 messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub message_expiry_interval: Option<u32>,
}

/// Durable snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subscriptions: Vec<SubscriptionRecord>,
    pub pending: Vec<(u16, PublishRecord)>,
    /// Unix timestamp after which the detached session may be reaped.
    pub expires_at: Option<u64>,
}

/// Durable snapshot of a retained message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainedRecord {
    pub qos: u8,
    pub payload: Vec<u8>,
    /// Unix timestamp when the message was stored.
    pub stored_at: u64,
    pub message_expiry_interval: Option<u32>,
}

/// Operations carried by the write-behind queue.
#[derive(Debug)]
pub enum DbOp {
    StoreSession(SessionId, SessionRecord),
    RemoveSession(SessionId),
    StoreRetained(String, RetainedRecord),
    RemoveRetained(String),
}

/// Durable storage contract. The broker only ever calls this from the
/// writer thread and during startup rehydration.
pub trait Store: Send {
    fn store_session(&self, id: &SessionId, record: &SessionRecord) -> Result<(), StoreError>;
    fn remove_session(&self, id: &SessionId) -> Result<(), StoreError>;
    fn store_retained(&self, topic: &str, record: &RetainedRecord) -> Result<(), StoreError>;
    fn remove_retained(&self, topic: &str) -> Result<(), StoreError>;
    fn load_sessions(&self) -> Result<Vec<(SessionId, SessionRecord)>, StoreError>;
    fn load_retained(&self) -> Result<Vec<(String, RetainedRecord)>, StoreError>;
}

/// Fire-and-forget sender side of the write-behind queue. Disabled handles
/// swallow every op.
pub struct PersistenceHandle {
    tx: Mutex<Option<Sender<DbOp>>>,
}

impl PersistenceHandle {
    pub fn disabled() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    /// Create an active handle plus the receiver the writer thread drains.
    pub fn bounded() -> (Self, Receiver<DbOp>) {
        let (tx, rx) = crossbeam_channel::bounded(DB_QUEUE_BOUND);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Queue an op without ever blocking. Overflow drops the op.
    pub fn send(&self, op: DbOp) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) => {
                log::warn!("persistence queue full, dropping {:?}", op_name(&op));
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Drop the sender so the writer thread drains and exits.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

fn op_name(op: &DbOp) -> &'static str {
    match op {
        DbOp::StoreSession(..) => "session upsert",
        DbOp::RemoveSession(..) => "session delete",
        DbOp::StoreRetained(..) => "retained upsert",
        DbOp::RemoveRetained(..) => "retained delete",
    }
}

/// Spawn the writer thread draining `rx` into `store`. Exits when every
/// sender is gone.
pub fn spawn_writer(store: Box<dyn Store>, rx: Receiver<DbOp>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("mqhive-db".to_string())
        .spawn(move || {
            while let Ok(op) = rx.recv() {
                let result = match &op {
                    DbOp::StoreSession(id, record) => store.store_session(id, record),
                    DbOp::RemoveSession(id) => store.remove_session(id),
                    DbOp::StoreRetained(topic, record) => store.store_retained(topic, record),
                    DbOp::RemoveRetained(topic) => store.remove_retained(topic),
                };
                if let Err(e) = result {
                    log::warn!("persistence {} failed: {}", op_name(&op), e);
                }
            }
        })
        .expect("failed to spawn persistence writer")
}

// ---------------------------------------------------------------------------
// Record conversions
// ---------------------------------------------------------------------------

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map a Unix timestamp onto the monotonic clock, clamping the past to now.
pub fn instant_from_unix(target: u64) -> Instant {
    let now = Instant::now();
    now + Duration::from_secs(target.saturating_sub(unix_now()))
}

pub fn instant_to_unix(at: Instant) -> u64 {
    let now = Instant::now();
    if at <= now {
        unix_now()
    } else {
        unix_now() + (at - now).as_secs()
    }
}

/// Snapshot a session for the write-behind queue.
pub fn session_record(session: &Session) -> SessionRecord {
    SessionRecord {
        subscriptions: session
            .subscriptions
            .iter()
            .map(|(filter, opts)| SubscriptionRecord {
                filter: filter.clone(),
                qos: opts.qos as u8,
                no_local: opts.no_local,
                retain_as_published: opts.retain_as_published,
                retain_handling: opts.retain_handling as u8,
            })
            .collect(),
        pending: session
            .qos_pending
            .iter()
            .map(|(&id, publish)| (id, publish_record(publish)))
            .collect(),
        expires_at: session.expires_at.map(instant_to_unix),
    }
}

fn publish_record(publish: &Publish) -> PublishRecord {
    PublishRecord {
        topic: publish.topic.clone(),
        qos: publish.qos as u8,
        retain: publish.retain,
        payload: publish.payload.to_vec(),
        message_expiry_interval: publish.properties.message_expiry_interval,
    }
}

fn publish_from_record(packet_id: Option<u16>, record: PublishRecord) -> Publish {
    Publish {
        dup: false,
        qos: QoS::from_u8(record.qos).unwrap_or(QoS::AtMostOnce),
        retain: record.retain,
        topic: record.topic,
        packet_id,
        payload: Bytes::from(record.payload),
        properties: PublishProperties {
            message_expiry_interval: record.message_expiry_interval,
            ..Default::default()
        },
    }
}

/// Rebuild a detached session from its durable snapshot.
pub fn hydrate_session(
    record: SessionRecord,
    outbound_bound: usize,
    backlog_bound: usize,
) -> Session {
    let mut session = Session::detached(outbound_bound, backlog_bound);
    for sub in record.subscriptions {
        let opts = SubscriptionOptions {
            qos: QoS::from_u8(sub.qos).unwrap_or(QoS::AtMostOnce),
            no_local: sub.no_local,
            retain_as_published: sub.retain_as_published,
            retain_handling: RetainHandling::from_u8(sub.retain_handling)
                .unwrap_or(RetainHandling::SendOnSubscribe),
        };
        session.subscriptions.insert(sub.filter, opts);
    }
    for (id, publish) in record.pending {
        session
            .qos_pending
            .insert(id, publish_from_record(Some(id), publish));
    }
    session.expires_at = record.expires_at.map(instant_from_unix);
    session
}

/// Snapshot a just-retained publish for the write-behind queue.
pub fn retained_record(publish: &Publish) -> RetainedRecord {
    RetainedRecord {
        qos: publish.qos as u8,
        payload: publish.payload.to_vec(),
        stored_at: unix_now(),
        message_expiry_interval: publish.properties.message_expiry_interval,
    }
}

/// Rebuild a retained entry from its durable snapshot.
pub fn retained_from_record(topic: &str, record: RetainedRecord) -> Retained {
    let now = Instant::now();
    let elapsed = unix_now().saturating_sub(record.stored_at);
    let expires_at = record.message_expiry_interval.map(|secs| {
        now + Duration::from_secs(u64::from(secs).saturating_sub(elapsed))
    });
    Retained {
        publish: Publish {
            dup: false,
            qos: QoS::from_u8(record.qos).unwrap_or(QoS::AtMostOnce),
            retain: true,
            topic: topic.to_string(),
            packet_id: None,
            payload: Bytes::from(record.payload),
            properties: PublishProperties {
                message_expiry_interval: record.message_expiry_interval,
                ..Default::default()
            },
        },
        stored_at: now.checked_sub(Duration::from_secs(elapsed)).unwrap_or(now),
        expires_at,
    }
}

// ---------------------------------------------------------------------------
// fjall-backed store
// ---------------------------------------------------------------------------

#[cfg(feature = "persistence")]
pub use fjall_store::FjallStore;

#[cfg(feature = "persistence")]
mod fjall_store {
    use super::*;
    use std::path::Path;

    use fjall::{Database, Keyspace, KeyspaceCreateOptions};

    /// fjall-backed [`Store`] with `sessions` and `retained` keyspaces.
    /// Session ids key the session keyspace as raw bytes; topics key the
    /// retained keyspace, which gets prefix compression for free.
    pub struct FjallStore {
        #[allow(dead_code)] // Kept alive to maintain the database handle
        db: Database,
        sessions: Keyspace,
        retained: Keyspace,
    }

    impl FjallStore {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
            let db = Database::builder(path)
                .open()
                .map_err(|e| StoreError::Open(e.to_string()))?;

            let sessions = db
                .keyspace("sessions", KeyspaceCreateOptions::default)
                .map_err(|e| StoreError::Open(e.to_string()))?;
            let retained = db
                .keyspace("retained", KeyspaceCreateOptions::default)
                .map_err(|e| StoreError::Open(e.to_string()))?;

            log::info!("persistence store opened");
            Ok(Self {
                db,
                sessions,
                retained,
            })
        }
    }

    impl Store for FjallStore {
        fn store_session(&self, id: &SessionId, record: &SessionRecord) -> Result<(), StoreError> {
            let value = bincode::serialize(record)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            self.sessions
                .insert(id.as_bytes(), value)
                .map_err(|e| StoreError::Write(e.to_string()))
        }

        fn remove_session(&self, id: &SessionId) -> Result<(), StoreError> {
            self.sessions
                .remove(id.as_bytes())
                .map_err(|e| StoreError::Write(e.to_string()))
        }

        fn store_retained(&self, topic: &str, record: &RetainedRecord) -> Result<(), StoreError> {
            let value = bincode::serialize(record)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            self.retained
                .insert(topic, value)
                .map_err(|e| StoreError::Write(e.to_string()))
        }

        fn remove_retained(&self, topic: &str) -> Result<(), StoreError> {
            self.retained
                .remove(topic)
                .map_err(|e| StoreError::Write(e.to_string()))
        }

        fn load_sessions(&self) -> Result<Vec<(SessionId, SessionRecord)>, StoreError> {
            let keys: Vec<_> = self
                .sessions
                .iter()
                .filter_map(|kv| kv.key().ok())
                .collect();

            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let value = match self.sessions.get(&key) {
                    Ok(Some(v)) => v,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("failed to read stored session: {}", e);
                        continue;
                    }
                };
                let record: SessionRecord = match bincode::deserialize(&value) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("failed to decode stored session: {}", e);
                        continue;
                    }
                };
                out.push((SessionId::new(Bytes::copy_from_slice(&key)), record));
            }
            Ok(out)
        }

        fn load_retained(&self) -> Result<Vec<(String, RetainedRecord)>, StoreError> {
            let now = unix_now();
            let keys: Vec<_> = self
                .retained
                .iter()
                .filter_map(|kv| kv.key().ok())
                .collect();

            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let topic = String::from_utf8_lossy(&key).into_owned();
                let value = match self.retained.get(&topic) {
                    Ok(Some(v)) => v,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("failed to read retained message for {}: {}", topic, e);
                        continue;
                    }
                };
                let record: RetainedRecord = match bincode::deserialize(&value) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("failed to decode retained message for {}: {}", topic, e);
                        continue;
                    }
                };

                // Skip (and purge) entries that expired while we were down.
                if let Some(expiry) = record.message_expiry_interval {
                    if now.saturating_sub(record.stored_at) >= u64::from(expiry) {
                        log::debug!("skipping expired retained message on {}", topic);
                        let _ = self.retained.remove(&topic);
                        continue;
                    }
                }

                out.push((topic, record));
            }
            Ok(out)
        }
    }
}
