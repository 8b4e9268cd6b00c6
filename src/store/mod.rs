//! Subscription store
//!
//! Owns the subscription trie, the retained-message trie and the session
//! registry, and enforces the locking discipline across them.
//!
//! One reader/writer lock guards the subscription trie together with the
//! session registry: publishes read both, while subscribe, unsubscribe,
//! client registration and session removal write both. A second lock guards
//! the retained trie. The subscribe path takes the subscription write lock
//! and then the retained read lock, released in reverse order; no path ever
//! holds both write locks.

mod retained;
mod subscription;

pub use retained::{RetainedMessage, RetainedNode};
pub use subscription::{Subscription, SubscriptionNode};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::protocol::{Publish, QoS};
use crate::session::{QueuedMessage, Session};
use crate::topic::TopicPath;

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Malformed input from a client; the connection should be closed
    Protocol(String),
    /// A subscription filter violating wildcard placement rules
    FilterMalformed(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::FilterMalformed(msg) => write!(f, "malformed topic filter: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Copy of one session for the persistence stream.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    pub queued: Vec<QueuedMessage>,
    pub idle_secs: u64,
}

/// One subscriber of a persisted filter.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub client_id: Arc<str>,
    pub qos: QoS,
}

/// All subscribers of one filter, for the persistence stream.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub filter: String,
    pub entries: Vec<SubscriptionEntry>,
}

/// Subscription trie plus session registry; guarded by one lock because
/// publishes read both and registration mutates both.
struct SubscriptionTree {
    root: SubscriptionNode,
    root_dollar: SubscriptionNode,
    sessions: AHashMap<Arc<str>, Arc<Session>>,
}

/// Retained trie with its own dollar root and a running message count.
struct RetainedTree {
    root: RetainedNode,
    root_dollar: RetainedNode,
    count: i64,
}

pub struct SubscriptionStore {
    tree: RwLock<SubscriptionTree>,
    retained: RwLock<RetainedTree>,
    max_queued_messages: usize,
}

impl SubscriptionStore {
    pub fn new(max_queued_messages: usize) -> Self {
        Self {
            tree: RwLock::new(SubscriptionTree {
                root: SubscriptionNode::new(),
                root_dollar: SubscriptionNode::new(),
                sessions: AHashMap::new(),
            }),
            retained: RwLock::new(RetainedTree {
                root: RetainedNode::new(),
                root_dollar: RetainedNode::new(),
                count: 0,
            }),
            max_queued_messages,
        }
    }

    /// Bind a connection to its session, kicking any existing bearer of the
    /// same client id [MQTT-3.1.4-2]. Returns the number of pending messages
    /// flushed to the new bearer.
    pub fn register_client(&self, client: &Arc<Client>) -> Result<u64, StoreError> {
        if client.client_id().is_empty() {
            return Err(StoreError::Protocol(
                "trying to register a client without an id".into(),
            ));
        }

        let mut tree = self.tree.write();

        let existing = tree.sessions.get(client.client_id()).cloned();

        if let Some(session) = &existing {
            if let Some(prev) = session.active_client() {
                info!(
                    client_id = %client.client_id(),
                    "disconnecting existing client for session takeover"
                );
                prev.set_disconnect_reason("session taken over by a new connection");
                prev.mark_disconnecting();
                if let Some(worker) = prev.worker() {
                    worker.remove_client(prev.fd());
                }
                session.clear_active_client();
            }
        }

        let session = match existing {
            Some(session) if !client.clean_session() => session,
            _ => {
                let fresh = Arc::new(Session::new(
                    client.client_id_arc(),
                    client.clean_session(),
                    self.max_queued_messages,
                ));
                tree.sessions.insert(client.client_id_arc(), fresh.clone());
                fresh
            }
        };

        session.assign_active_client(client);
        client.assign_session(&session);

        let flushed = session.send_pending_messages();
        if flushed > 0 {
            if let Some(worker) = client.worker() {
                worker.add_sent(flushed);
            }
        }
        Ok(flushed)
    }

    /// Whether a session exists for this client id. Touches the session on a
    /// hit so an expiry sweep cannot remove it between this check and its
    /// next use.
    pub fn session_present(&self, client_id: &str) -> bool {
        let tree = self.tree.read();
        match tree.sessions.get(client_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Insert a subscription and deliver matching retained messages to the
    /// subscribing session. Returns the number of retained messages sent.
    pub fn subscribe(
        &self,
        client: &Arc<Client>,
        filter: &str,
        qos: QoS,
    ) -> Result<u64, StoreError> {
        let path = TopicPath::from_filter(filter).map_err(StoreError::FilterMalformed)?;

        let mut guard = self.tree.write();
        let tree = &mut *guard;

        let Some(session) = tree.sessions.get(client.client_id()).cloned() else {
            debug!(
                client_id = %client.client_id(),
                "subscribe from a client without a session ignored"
            );
            return Ok(0);
        };

        let root = if path.is_dollar() {
            &mut tree.root_dollar
        } else {
            &mut tree.root
        };
        root.node_for_filter_mut(path.levels())
            .add_subscriber(&session, qos);
        session.add_filter(filter);

        // Retained walk happens with the subscription lock still held, so the
        // subscription is visible to publishers no later than the retained
        // delivery.
        let retained = self.retained.read();
        let start = if path.is_dollar() {
            &retained.root_dollar
        } else {
            &retained.root
        };

        let mut count = 0;
        start.deliver_matching(path.levels(), false, &mut |msg| {
            let publish = Publish {
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                qos: msg.qos,
                retain: true,
            };
            session.write_packet(&publish, qos, true, &mut count);
        });
        drop(retained);

        if count > 0 {
            if let Some(worker) = client.worker() {
                worker.add_sent(count);
            }
        }
        Ok(count)
    }

    /// Remove the client's subscription for this filter. Silently does
    /// nothing when the filter path or the subscription does not exist.
    pub fn unsubscribe(&self, client: &Arc<Client>, filter: &str) -> Result<(), StoreError> {
        let path = TopicPath::from_filter(filter).map_err(StoreError::FilterMalformed)?;

        let mut guard = self.tree.write();
        let tree = &mut *guard;
        let root = if path.is_dollar() {
            &mut tree.root_dollar
        } else {
            &mut tree.root
        };

        if let Some(node) = root.existing_node_mut(path.levels()) {
            node.remove_subscriber(client.client_id());
        }
        if let Some(session) = tree.sessions.get(client.client_id()) {
            session.remove_filter(filter);
        }
        Ok(())
    }

    /// Route one publish to every matching subscription. Returns the number
    /// of deliveries (direct plus queued counts as queued sessions are not
    /// handed the message yet).
    pub fn publish(&self, publish: &Publish) -> Result<u64, StoreError> {
        let path = TopicPath::from_topic(&publish.topic)
            .map_err(|msg| StoreError::Protocol(format!("invalid publish topic: {}", msg)))?;

        let tree = self.tree.read();
        let start = if path.is_dollar() {
            &tree.root_dollar
        } else {
            &tree.root
        };

        let mut count = 0;
        start.deliver_matching(path.levels(), &mut |sub| {
            // Weak reference expires when the session was dropped by a
            // clean-session connect or an expiry sweep.
            if let Some(session) = sub.session.upgrade() {
                session.write_packet(publish, sub.qos, false, &mut count);
            }
        });
        Ok(count)
    }

    /// Install, replace or clear the retained message for a concrete topic.
    pub fn set_retained(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
    ) -> Result<(), StoreError> {
        let path = TopicPath::from_topic(topic)
            .map_err(|msg| StoreError::Protocol(format!("invalid retained topic: {}", msg)))?;

        let mut guard = self.retained.write();
        let retained = &mut *guard;
        let root = if path.is_dollar() {
            &mut retained.root_dollar
        } else {
            &mut retained.root
        };
        root.node_for_topic_mut(path.levels())
            .set_message(topic, payload, qos, &mut retained.count);
        Ok(())
    }

    /// Drop the session registered under this client id, if any.
    pub fn remove_session(&self, client_id: &str) {
        let mut tree = self.tree.write();
        if let Some(session) = tree.sessions.remove(client_id) {
            debug!(
                %client_id,
                subscriptions = session.subscribed_filters().len(),
                "removed session"
            );
        }
    }

    /// Evict sessions idle for longer than `max_idle`, then compact the
    /// subscription trie so nothing can still reach them.
    pub fn expire_sessions(&self, max_idle: Duration) {
        let mut guard = self.tree.write();
        let tree = &mut *guard;

        let before = tree.sessions.len();
        tree.sessions.retain(|client_id, session| {
            let expired = session.has_expired(max_idle);
            if expired {
                debug!(%client_id, "removing expired session");
            }
            !expired
        });
        let removed = before - tree.sessions.len();

        let live = tree.root.clean_subscriptions() + tree.root_dollar.clean_subscriptions();
        info!(
            removed_sessions = removed,
            live_subscriptions = live,
            "session expiry sweep finished"
        );
    }

    pub fn get_session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.tree.read().sessions.get(client_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.tree.read().sessions.len()
    }

    pub fn retained_count(&self) -> i64 {
        self.retained.read().count
    }

    /// Copy out all retained messages under the retained lock; callers do
    /// their I/O after this returns.
    pub fn retained_snapshot(&self) -> Vec<RetainedMessage> {
        let retained = self.retained.read();
        let mut out = Vec::with_capacity(retained.count.max(0) as usize);
        retained.root.collect(&mut out);
        retained.root_dollar.collect(&mut out);
        out
    }

    /// Re-install persisted retained messages. Invalid topics are dropped
    /// with a warning rather than aborting the load.
    pub fn restore_retained(&self, messages: Vec<RetainedMessage>) {
        for msg in messages {
            if let Err(err) = self.set_retained(&msg.topic, msg.payload, msg.qos) {
                warn!(topic = %msg.topic, %err, "dropping persisted retained message");
            }
        }
    }

    /// Copy out sessions and the filter-to-subscribers mapping under the
    /// subscription lock; callers do their I/O after this returns.
    pub fn sessions_snapshot(&self) -> (Vec<SessionSnapshot>, Vec<SubscriptionSnapshot>) {
        let tree = self.tree.read();

        let sessions = tree
            .sessions
            .values()
            .map(|session| SessionSnapshot {
                client_id: session.client_id_arc(),
                clean_session: session.clean_session(),
                queued: session.queued_snapshot(),
                idle_secs: session.idle_secs(),
            })
            .collect();

        let mut by_filter: AHashMap<String, Vec<SubscriptionEntry>> = AHashMap::new();
        for root in [&tree.root, &tree.root_dollar] {
            root.for_each_subscription("", true, &mut |filter, session, qos| {
                by_filter
                    .entry(filter.to_string())
                    .or_default()
                    .push(SubscriptionEntry {
                        client_id: session.client_id_arc(),
                        qos,
                    });
            });
        }
        let subscriptions = by_filter
            .into_iter()
            .map(|(filter, entries)| SubscriptionSnapshot { filter, entries })
            .collect();

        (sessions, subscriptions)
    }

    /// Re-install persisted sessions, then subscriptions, so each
    /// subscription can resolve its client id to a live session.
    pub fn restore_sessions(
        &self,
        sessions: Vec<SessionSnapshot>,
        subscriptions: Vec<SubscriptionSnapshot>,
    ) {
        let mut guard = self.tree.write();
        let tree = &mut *guard;

        for snap in sessions {
            let session = Arc::new(Session::restore(
                snap.client_id.clone(),
                snap.clean_session,
                self.max_queued_messages,
                snap.queued,
                Duration::from_secs(snap.idle_secs),
            ));
            tree.sessions.insert(snap.client_id, session);
        }

        for sub in subscriptions {
            let path = match TopicPath::from_filter(&sub.filter) {
                Ok(path) => path,
                Err(msg) => {
                    warn!(filter = %sub.filter, %msg, "dropping persisted subscription");
                    continue;
                }
            };
            for entry in sub.entries {
                let Some(session) = tree.sessions.get(entry.client_id.as_ref()).cloned() else {
                    continue;
                };
                let root = if path.is_dollar() {
                    &mut tree.root_dollar
                } else {
                    &mut tree.root
                };
                root.node_for_filter_mut(path.levels())
                    .add_subscriber(&session, entry.qos);
                session.add_filter(&sub.filter);
            }
        }
    }
}
