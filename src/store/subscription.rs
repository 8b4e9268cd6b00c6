//! Subscription trie
//!
//! Stores subscribers keyed by topic filter and matches published topics
//! against them. Filters ending in `#` or containing `+` get dedicated child
//! slots per node; everything else goes through the literal-child map.
//!
//! Subscribers hold weak session references so the trie never keeps a session
//! alive; expired entries are skipped on match and reaped by the periodic
//! compaction sweep.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use compact_str::CompactString;
use tracing::debug;

use crate::protocol::QoS;
use crate::session::Session;

/// A subscriber entry attached at the node where its filter ends.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub session: Weak<Session>,
    pub qos: QoS,
}

impl Subscription {
    /// Identity is the referenced session's client id; QoS is deliberately
    /// excluded so re-subscribing replaces the entry in place.
    fn is_for_client(&self, client_id: &str) -> bool {
        self.session
            .upgrade()
            .map_or(false, |s| s.client_id() == client_id)
    }
}

/// Node in the subscription trie
#[derive(Debug, Default)]
pub struct SubscriptionNode {
    /// Children for literal subtopics
    children: AHashMap<CompactString, SubscriptionNode>,
    /// Single-level wildcard (+) child
    child_plus: Option<Box<SubscriptionNode>>,
    /// Multi-level wildcard (#) child; a leaf for matching purposes
    child_pound: Option<Box<SubscriptionNode>>,
    /// Subscriptions whose filter ends at this node
    subscribers: Vec<Subscription>,
}

impl SubscriptionNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk the filter path from this node, creating nodes as required.
    pub fn node_for_filter_mut(&mut self, levels: &[CompactString]) -> &mut SubscriptionNode {
        let mut node = self;
        for level in levels {
            node = match level.as_str() {
                "#" => &mut **node.child_pound.get_or_insert_with(Default::default),
                "+" => &mut **node.child_plus.get_or_insert_with(Default::default),
                _ => node.children.entry(level.clone()).or_default(),
            };
        }
        node
    }

    /// Walk the filter path without creating nodes; `None` when any step is
    /// missing.
    pub fn existing_node_mut(&mut self, levels: &[CompactString]) -> Option<&mut SubscriptionNode> {
        let mut node = self;
        for level in levels {
            node = match level.as_str() {
                "#" => node.child_pound.as_deref_mut()?,
                "+" => node.child_plus.as_deref_mut()?,
                _ => node.children.get_mut(level.as_str())?,
            };
        }
        Some(node)
    }

    /// Add or replace the subscription for this session at this node.
    pub fn add_subscriber(&mut self, session: &Arc<Session>, qos: QoS) {
        let sub = Subscription {
            session: Arc::downgrade(session),
            qos,
        };
        let client_id = session.client_id();
        match self
            .subscribers
            .iter_mut()
            .find(|s| s.is_for_client(client_id))
        {
            Some(existing) => *existing = sub,
            None => self.subscribers.push(sub),
        }
    }

    /// Remove any subscription of the given client at this node.
    pub fn remove_subscriber(&mut self, client_id: &str) {
        self.subscribers.retain(|s| !s.is_for_client(client_id));
    }

    /// Invoke `deliver` for every subscription matching the remaining topic
    /// levels.
    ///
    /// A `#` child matches regardless of how many levels remain, including
    /// zero, so `a/#` also matches a publish to `a` [MQTT-4.7.1-2]. The walk
    /// reaches each node over at most one path, so a single subscription is
    /// delivered at most once per publish.
    pub fn deliver_matching<F>(&self, levels: &[CompactString], deliver: &mut F)
    where
        F: FnMut(&Subscription),
    {
        if let Some(pound) = &self.child_pound {
            for sub in &pound.subscribers {
                deliver(sub);
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            for sub in &self.subscribers {
                deliver(sub);
            }
            return;
        };

        if let Some(child) = self.children.get(first.as_str()) {
            child.deliver_matching(rest, deliver);
        }

        if let Some(plus) = &self.child_plus {
            plus.deliver_matching(rest, deliver);
        }
    }

    /// Post-order sweep: drop subscriptions whose session is gone, remove
    /// child nodes with no live subscriber anywhere below them, and return
    /// the number of live subscribers in this subtree.
    pub fn clean_subscriptions(&mut self) -> usize {
        let mut remaining = 0;

        self.children.retain(|subtopic, child| {
            let live = child.clean_subscriptions();
            remaining += live;
            if live == 0 {
                debug!(%subtopic, "removing orphaned subscription node");
            }
            live > 0
        });

        for slot in [&mut self.child_plus, &mut self.child_pound] {
            if let Some(child) = slot {
                let live = child.clean_subscriptions();
                remaining += live;
                if live == 0 {
                    debug!("removing empty wildcard node");
                    *slot = None;
                }
            }
        }

        self.subscribers
            .retain(|sub| sub.session.strong_count() > 0);

        remaining + self.subscribers.len()
    }

    /// Visit every live subscription in this subtree together with its
    /// re-composed filter string. `at_root` suppresses the leading separator.
    pub fn for_each_subscription<F>(&self, composed: &str, at_root: bool, visit: &mut F)
    where
        F: FnMut(&str, &Arc<Session>, QoS),
    {
        for sub in &self.subscribers {
            if let Some(session) = sub.session.upgrade() {
                visit(composed, &session, sub.qos);
            }
        }

        for (subtopic, child) in &self.children {
            let next = if at_root {
                subtopic.to_string()
            } else {
                format!("{composed}/{subtopic}")
            };
            child.for_each_subscription(&next, false, visit);
        }

        if let Some(plus) = &self.child_plus {
            let next = if at_root { "+".to_string() } else { format!("{composed}/+") };
            plus.for_each_subscription(&next, false, visit);
        }

        if let Some(pound) = &self.child_pound {
            let next = if at_root { "#".to_string() } else { format!("{composed}/#") };
            pound.for_each_subscription(&next, false, visit);
        }
    }
}
