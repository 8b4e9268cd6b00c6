//! Client sessions
//!
//! A session is the durable server-side state bound to a client id: it
//! outlives the TCP connection that created it. While no connection is bound,
//! QoS 1/2 messages pile up in the pending queue and are flushed in order to
//! the next bearer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use compact_str::CompactString;
use parking_lot::Mutex;

use crate::client::Client;
use crate::protocol::{OutboundMessage, Publish, QoS};

/// A QoS 1/2 message parked while the session has no active connection.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: bytes::Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Broker-assigned packet identifier
    pub packet_id: u16,
}

#[derive(Debug)]
struct SessionQueue {
    pending: VecDeque<QueuedMessage>,
    next_packet_id: u16,
}

impl SessionQueue {
    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }
}

/// Server-side session state for one client id.
#[derive(Debug)]
pub struct Session {
    client_id: Arc<str>,
    clean_session: bool,
    max_queued_messages: usize,
    /// At most one active bearer at any instant
    active_client: Mutex<Weak<Client>>,
    queue: Mutex<SessionQueue>,
    /// Filters this session is subscribed to, for bookkeeping
    filters: Mutex<AHashSet<CompactString>>,
    last_touched: Mutex<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, max_queued_messages: usize) -> Self {
        Self {
            client_id,
            clean_session,
            max_queued_messages,
            active_client: Mutex::new(Weak::new()),
            queue: Mutex::new(SessionQueue {
                pending: VecDeque::new(),
                next_packet_id: 1,
            }),
            filters: Mutex::new(AHashSet::new()),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    /// Rebuild a session from persisted state. `idle` is how long the session
    /// had been untouched at save time.
    pub fn restore(
        client_id: Arc<str>,
        clean_session: bool,
        max_queued_messages: usize,
        pending: Vec<QueuedMessage>,
        idle: Duration,
    ) -> Self {
        let next_packet_id = pending
            .iter()
            .map(|m| m.packet_id)
            .max()
            .map_or(1, |max| max.wrapping_add(1).max(1));
        let touched = Instant::now()
            .checked_sub(idle)
            .unwrap_or_else(Instant::now);
        Self {
            client_id,
            clean_session,
            max_queued_messages,
            active_client: Mutex::new(Weak::new()),
            queue: Mutex::new(SessionQueue {
                pending: pending.into(),
                next_packet_id,
            }),
            filters: Mutex::new(AHashSet::new()),
            last_touched: Mutex::new(touched),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_id_arc(&self) -> Arc<str> {
        self.client_id.clone()
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Refresh the last-used timestamp.
    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    /// A session with a live, non-disconnecting bearer never expires;
    /// otherwise it expires once idle for `max_idle`.
    pub fn has_expired(&self, max_idle: Duration) -> bool {
        if let Some(client) = self.active_client.lock().upgrade() {
            if !client.is_disconnecting() {
                return false;
            }
        }
        self.last_touched.lock().elapsed() >= max_idle
    }

    pub fn assign_active_client(&self, client: &Arc<Client>) {
        *self.active_client.lock() = Arc::downgrade(client);
        self.touch();
    }

    pub fn clear_active_client(&self) {
        *self.active_client.lock() = Weak::new();
        self.touch();
    }

    pub fn active_client(&self) -> Option<Arc<Client>> {
        self.active_client.lock().upgrade()
    }

    /// Route one publish to this session: straight to the bearer when one is
    /// connected, into the pending queue when the effective QoS warrants it,
    /// dropped otherwise.
    pub fn write_packet(&self, publish: &Publish, max_qos: QoS, retain: bool, count: &mut u64) {
        let qos = publish.qos.min(max_qos);

        match self.active_client() {
            Some(client) if !client.is_disconnecting() => {
                let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
                client.enqueue(OutboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos,
                    retain,
                    packet_id,
                });
                *count += 1;
            }
            _ => {
                if qos != QoS::AtMostOnce && !self.clean_session {
                    self.queue_message(publish, qos, retain);
                }
            }
        }
    }

    fn next_packet_id(&self) -> u16 {
        self.queue.lock().take_packet_id()
    }

    fn queue_message(&self, publish: &Publish, qos: QoS, retain: bool) {
        let mut queue = self.queue.lock();
        if queue.pending.len() >= self.max_queued_messages {
            // Drop oldest message
            queue.pending.pop_front();
        }
        let packet_id = queue.take_packet_id();
        queue.pending.push_back(QueuedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos,
            retain,
            packet_id,
        });
    }

    /// Flush the pending queue, in order, to the current bearer. Returns the
    /// number of messages handed over.
    pub fn send_pending_messages(&self) -> u64 {
        let Some(client) = self.active_client() else {
            return 0;
        };

        let drained: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock();
            queue.pending.drain(..).collect()
        };

        let mut count = 0;
        for msg in drained {
            client.enqueue(OutboundMessage {
                topic: msg.topic,
                payload: msg.payload,
                qos: msg.qos,
                retain: msg.retain,
                packet_id: Some(msg.packet_id),
            });
            count += 1;
        }
        count
    }

    pub fn add_filter(&self, filter: &str) {
        self.filters.lock().insert(CompactString::new(filter));
    }

    pub fn remove_filter(&self, filter: &str) {
        self.filters.lock().remove(filter);
    }

    pub fn subscribed_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> =
            self.filters.lock().iter().map(|f| f.to_string()).collect();
        filters.sort();
        filters
    }

    /// Copy of the pending queue, for persistence.
    pub fn queued_snapshot(&self) -> Vec<QueuedMessage> {
        self.queue.lock().pending.iter().cloned().collect()
    }

    /// Seconds since the session was last touched, for persistence.
    pub fn idle_secs(&self) -> u64 {
        self.last_touched.lock().elapsed().as_secs()
    }

    pub fn queued_message_count(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn publish(topic: &str, payload: &str, qos: QoS) -> Publish {
        Publish::new(topic, payload.as_bytes().to_vec(), qos)
    }

    fn client(id: &str) -> Arc<Client> {
        Arc::new(Client::new(3, id.into(), true, Duration::from_secs(60)))
    }

    #[test]
    fn test_queue_while_disconnected() {
        let session = Session::new("alpha".into(), false, 10);
        let mut count = 0;
        session.write_packet(&publish("a", "1", QoS::AtLeastOnce), QoS::ExactlyOnce, false, &mut count);
        session.write_packet(&publish("a", "2", QoS::AtLeastOnce), QoS::ExactlyOnce, false, &mut count);

        assert_eq!(count, 0);
        let queued = session.queued_snapshot();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].payload.as_ref(), b"1");
        assert_eq!(queued[1].payload.as_ref(), b"2");
        assert_ne!(queued[0].packet_id, queued[1].packet_id);
    }

    #[test]
    fn test_qos0_not_queued_while_disconnected() {
        let session = Session::new("alpha".into(), false, 10);
        let mut count = 0;
        session.write_packet(&publish("a", "x", QoS::AtMostOnce), QoS::ExactlyOnce, false, &mut count);
        // effective qos drops to 0 when the subscription caps it
        session.write_packet(&publish("a", "y", QoS::AtLeastOnce), QoS::AtMostOnce, false, &mut count);
        assert_eq!(session.queued_message_count(), 0);
    }

    #[test]
    fn test_clean_session_never_queues() {
        let session = Session::new("alpha".into(), true, 10);
        let mut count = 0;
        session.write_packet(&publish("a", "x", QoS::AtLeastOnce), QoS::ExactlyOnce, false, &mut count);
        assert_eq!(session.queued_message_count(), 0);
    }

    #[test]
    fn test_queue_cap_drops_oldest() {
        let session = Session::new("alpha".into(), false, 3);
        let mut count = 0;
        for i in 0..5 {
            let payload = format!("{i}");
            session.write_packet(
                &publish("a", &payload, QoS::AtLeastOnce),
                QoS::ExactlyOnce,
                false,
                &mut count,
            );
        }
        let queued = session.queued_snapshot();
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[0].payload.as_ref(), b"2");
        assert_eq!(queued[2].payload.as_ref(), b"4");
    }

    #[test]
    fn test_flush_to_new_bearer_in_order() {
        let session = Session::new("alpha".into(), false, 10);
        let mut count = 0;
        for i in 0..3 {
            let payload = format!("{i}");
            session.write_packet(
                &publish("a", &payload, QoS::AtLeastOnce),
                QoS::ExactlyOnce,
                false,
                &mut count,
            );
        }

        let c = client("alpha");
        session.assign_active_client(&c);
        let flushed = session.send_pending_messages();
        assert_eq!(flushed, 3);
        assert_eq!(session.queued_message_count(), 0);

        let out = c.drain_outbound();
        let payloads: Vec<_> = out.iter().map(|m| m.payload.as_ref().to_vec()).collect();
        assert_eq!(payloads, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
        assert!(out.iter().all(|m| m.packet_id.is_some()));
    }

    #[test]
    fn test_direct_delivery_when_connected() {
        let session = Session::new("alpha".into(), false, 10);
        let c = client("alpha");
        session.assign_active_client(&c);

        let mut count = 0;
        session.write_packet(&publish("a/b", "x", QoS::ExactlyOnce), QoS::AtLeastOnce, false, &mut count);
        assert_eq!(count, 1);

        let out = c.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].qos, QoS::AtLeastOnce);
        assert!(out[0].packet_id.is_some());
        assert!(!out[0].retain);
    }

    #[test]
    fn test_packet_id_wraps_skipping_zero() {
        let mut queue = SessionQueue {
            pending: VecDeque::new(),
            next_packet_id: 65535,
        };
        assert_eq!(queue.take_packet_id(), 65535);
        assert_eq!(queue.take_packet_id(), 1);
    }

    #[test]
    fn test_expiry_requires_idle() {
        let session = Session::new("alpha".into(), false, 10);
        assert!(session.has_expired(Duration::from_secs(0)));
        assert!(!session.has_expired(Duration::from_secs(3600)));

        // a live bearer pins the session
        let c = client("alpha");
        session.assign_active_client(&c);
        assert!(!session.has_expired(Duration::from_secs(0)));

        // a disconnecting bearer no longer does
        c.mark_disconnecting();
        assert!(session.has_expired(Duration::from_secs(0)));
    }

    #[test]
    fn test_filter_bookkeeping() {
        let session = Session::new("alpha".into(), false, 10);
        session.add_filter("a/+");
        session.add_filter("b/#");
        session.add_filter("a/+");
        assert_eq!(session.subscribed_filters(), vec!["a/+", "b/#"]);
        session.remove_filter("a/+");
        assert_eq!(session.subscribed_filters(), vec!["b/#"]);
    }
}
