//! Retained-message trie
//!
//! Holds the most recent retained payload per concrete topic. Nodes only have
//! literal children (topics carry no wildcards); wildcard handling happens at
//! enumeration time when a new subscription asks for matching retained
//! messages.

use ahash::AHashMap;
use bytes::Bytes;
use compact_str::CompactString;

use crate::protocol::QoS;

/// The last retained publish on one concrete topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Node in the retained trie
#[derive(Debug, Default)]
pub struct RetainedNode {
    children: AHashMap<CompactString, RetainedNode>,
    /// The retained message whose topic ends exactly here. A node maps to one
    /// concrete topic, so one slot suffices.
    message: Option<RetainedMessage>,
}

impl RetainedNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk/create to the leaf for a concrete topic path.
    pub fn node_for_topic_mut(&mut self, levels: &[CompactString]) -> &mut RetainedNode {
        let mut node = self;
        for level in levels {
            node = node.children.entry(level.clone()).or_default();
        }
        node
    }

    /// Install, replace or clear the retained message at this leaf.
    ///
    /// An empty payload is the MQTT clear sentinel: it removes an existing
    /// message and is a no-op otherwise. `total` tracks the store-wide
    /// retained count and never goes below zero.
    pub fn set_message(&mut self, topic: &str, payload: Bytes, qos: QoS, total: &mut i64) {
        if payload.is_empty() {
            if self.message.take().is_some() {
                *total -= 1;
            }
            return;
        }

        if self.message.is_none() {
            *total += 1;
        }
        self.message = Some(RetainedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
    }

    /// Invoke `deliver` for every retained message matching the remaining
    /// filter levels.
    ///
    /// `+` fans out over all children; `#` switches to pound mode, which
    /// visits this node's own message and every descendant's. Missing
    /// children simply end the walk.
    pub fn deliver_matching<F>(&self, levels: &[CompactString], pound_mode: bool, deliver: &mut F)
    where
        F: FnMut(&RetainedMessage),
    {
        let Some((first, rest)) = levels.split_first() else {
            if let Some(message) = &self.message {
                deliver(message);
            }
            if pound_mode {
                for child in self.children.values() {
                    child.deliver_matching(levels, true, deliver);
                }
            }
            return;
        };

        match first.as_str() {
            // `#` is the last level by validation; deliver this node and the
            // whole subtree below it
            "#" => self.deliver_matching(rest, true, deliver),
            "+" => {
                for child in self.children.values() {
                    child.deliver_matching(rest, false, deliver);
                }
            }
            literal => {
                if let Some(child) = self.children.get(literal) {
                    child.deliver_matching(rest, false, deliver);
                }
            }
        }
    }

    /// Copy out every retained message in this subtree.
    pub fn collect(&self, out: &mut Vec<RetainedMessage>) {
        if let Some(message) = &self.message {
            out.push(message.clone());
        }
        for child in self.children.values() {
            child.collect(out);
        }
    }
}
