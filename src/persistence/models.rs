//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode.

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::QoS;
use crate::session::QueuedMessage;
use crate::store::{RetainedMessage, SessionSnapshot, SubscriptionEntry, SubscriptionSnapshot};

/// Stored retained message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

impl StoredRetainedMessage {
    pub fn from_runtime(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: msg.payload.to_vec(),
            qos: msg.qos as u8,
        }
    }

    /// `None` when the stored QoS byte is out of range.
    pub fn into_runtime(self) -> Option<RetainedMessage> {
        Some(RetainedMessage {
            topic: self.topic,
            payload: Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos)?,
        })
    }
}

/// Stored queued message of a session
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredQueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: u16,
}

impl StoredQueuedMessage {
    pub fn from_runtime(msg: &QueuedMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: msg.payload.to_vec(),
            qos: msg.qos as u8,
            retain: msg.retain,
            packet_id: msg.packet_id,
        }
    }

    pub fn into_runtime(self) -> Option<QueuedMessage> {
        Some(QueuedMessage {
            topic: self.topic,
            payload: Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos)?,
            retain: self.retain,
            packet_id: self.packet_id,
        })
    }
}

/// Stored session
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub clean_session: bool,
    pub queued: Vec<StoredQueuedMessage>,
    /// Seconds the session had been idle at save time
    pub idle_secs: u64,
}

impl StoredSession {
    pub fn from_runtime(snapshot: &SessionSnapshot) -> Self {
        Self {
            client_id: snapshot.client_id.to_string(),
            clean_session: snapshot.clean_session,
            queued: snapshot
                .queued
                .iter()
                .map(StoredQueuedMessage::from_runtime)
                .collect(),
            idle_secs: snapshot.idle_secs,
        }
    }

    pub fn into_runtime(self) -> SessionSnapshot {
        SessionSnapshot {
            client_id: self.client_id.into(),
            clean_session: self.clean_session,
            queued: self
                .queued
                .into_iter()
                .filter_map(StoredQueuedMessage::into_runtime)
                .collect(),
            idle_secs: self.idle_secs,
        }
    }
}

/// One subscriber of a stored filter
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscriptionEntry {
    pub client_id: String,
    pub qos: u8,
}

/// All subscribers of one filter
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub entries: Vec<StoredSubscriptionEntry>,
}

impl StoredSubscription {
    pub fn from_runtime(snapshot: &SubscriptionSnapshot) -> Self {
        Self {
            filter: snapshot.filter.clone(),
            entries: snapshot
                .entries
                .iter()
                .map(|entry| StoredSubscriptionEntry {
                    client_id: entry.client_id.to_string(),
                    qos: entry.qos as u8,
                })
                .collect(),
        }
    }

    pub fn into_runtime(self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            filter: self.filter,
            entries: self
                .entries
                .into_iter()
                .filter_map(|entry| {
                    Some(SubscriptionEntry {
                        client_id: entry.client_id.into(),
                        qos: QoS::from_u8(entry.qos)?,
                    })
                })
                .collect(),
        }
    }
}

/// On-disk layout of the retained-messages stream
#[derive(Debug, Clone, Encode, Decode)]
pub struct RetainedMessagesFile {
    pub messages: Vec<StoredRetainedMessage>,
}

/// On-disk layout of the sessions+subscriptions stream
#[derive(Debug, Clone, Encode, Decode)]
pub struct SessionsFile {
    pub sessions: Vec<StoredSession>,
    pub subscriptions: Vec<StoredSubscription>,
}
