//! Retained message store with TTL eviction.
//!
//! Keeps the last retained publish per topic. Entries carrying a
//! Message-Expiry-Interval register an absolute deadline with the store's
//! scheduler; the drain re-checks the deadline so a refreshed entry survives
//! a stale fire.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::packet::Publish;
use crate::scheduler::QueueRunner;
use crate::subtree::topic_matches_filter;

/// A stored retained message.
#[derive(Debug, Clone)]
pub struct Retained {
    pub publish: Publish,
    /// When the message was stored, for remaining-TTL rewrites on delivery.
    pub stored_at: Instant,
    /// Absolute expiry computed from the Message-Expiry-Interval.
    pub expires_at: Option<Instant>,
}

/// Outcome of submitting a publish to the store, so the caller can mirror
/// the change to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainChange {
    /// Not a retain-set publish, or a delete of a topic with no entry.
    None,
    Stored,
    Removed,
}

/// Last-retained-message-per-topic store.
pub struct RetainedStore {
    entries: RwLock<AHashMap<String, Retained>>,
    timers: QueueRunner<String>,
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            timers: QueueRunner::new(),
        }
    }

    /// The expiry scheduler, for the owner to spawn a drain thread on.
    pub fn timers(&self) -> &QueueRunner<String> {
        &self.timers
    }

    /// Submit a publish. No-op unless its retain flag is set; an empty body
    /// deletes the entry, anything else inserts or replaces it.
    pub fn retain(&self, publish: &Publish) -> RetainChange {
        if !publish.retain {
            return RetainChange::None;
        }

        let mut entries = self.entries.write();
        if publish.payload.is_empty() {
            return match entries.remove(&publish.topic) {
                Some(_) => RetainChange::Removed,
                None => RetainChange::None,
            };
        }

        let now = Instant::now();
        let expires_at = publish
            .properties
            .message_expiry_interval
            .map(|secs| now + Duration::from_secs(u64::from(secs)));
        entries.insert(
            publish.topic.clone(),
            Retained {
                publish: publish.clone(),
                stored_at: now,
                expires_at,
            },
        );
        drop(entries);

        if let Some(at) = expires_at {
            self.timers.enqueue(at, publish.topic.clone());
        }
        RetainChange::Stored
    }

    /// All retained publishes whose topic matches the filter. Entries that
    /// expired between scheduler fires are skipped, and a remaining TTL is
    /// rewritten into each returned publish.
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(topic, entry)| {
                topic_matches_filter(topic, filter)
                    && entry.expires_at.map_or(true, |at| at > now)
            })
            .map(|(_, entry)| {
                let mut publish = entry.publish.clone();
                if entry.publish.properties.message_expiry_interval.is_some() {
                    let remaining = entry
                        .expires_at
                        .map(|at| at.saturating_duration_since(now).as_secs() as u32);
                    publish.properties.message_expiry_interval = remaining;
                }
                publish
            })
            .collect()
    }

    /// Scheduler drain: remove the topic's entry iff its current expiry has
    /// really passed. Returns whether an entry was removed, so the caller
    /// can mirror the delete to persistence.
    pub fn cleanup(&self, topic: &str) -> bool {
        self.cleanup_at(topic, Instant::now())
    }

    fn cleanup_at(&self, topic: &str, now: Instant) -> bool {
        let mut entries = self.entries.write();
        match entries.get(topic) {
            Some(entry) if entry.expires_at.is_some_and(|at| at <= now) => {
                entries.remove(topic);
                log::debug!("expired retained message on {}", topic);
                true
            }
            // Refreshed or already gone; the fire was stale.
            _ => false,
        }
    }

    /// Rehydrate from persistence at startup, re-registering live TTLs.
    pub fn restore(&self, restored: Vec<(String, Retained)>) {
        let mut entries = self.entries.write();
        for (topic, entry) in restored {
            if let Some(at) = entry.expires_at {
                self.timers.enqueue(at, topic.clone());
            }
            entries.insert(topic, entry);
        }
        log::info!("restored {} retained messages", entries.len());
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}
