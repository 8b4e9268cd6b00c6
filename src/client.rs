//! Client connection handle
//!
//! The core's view of one accepted connection after its CONNECT has been
//! decoded. Socket reads and writes happen in the I/O layer; the core only
//! pushes framed messages onto the outbound queue and flips the
//! disconnecting flag.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::OutboundMessage;
use crate::session::Session;
use crate::worker::WorkerShared;

#[derive(Debug)]
pub struct Client {
    fd: RawFd,
    client_id: Arc<str>,
    username: Mutex<Option<Arc<str>>>,
    clean_session: bool,
    keep_alive: Duration,
    last_activity: Mutex<Instant>,
    disconnecting: AtomicBool,
    disconnect_reason: Mutex<Option<String>>,
    /// Messages waiting for the I/O layer to frame and write
    outbound: Mutex<VecDeque<OutboundMessage>>,
    session: Mutex<Option<Arc<Session>>>,
    worker: Mutex<Weak<WorkerShared>>,
}

impl Client {
    pub fn new(fd: RawFd, client_id: Arc<str>, clean_session: bool, keep_alive: Duration) -> Self {
        Self {
            fd,
            client_id,
            username: Mutex::new(None),
            clean_session,
            keep_alive,
            last_activity: Mutex::new(Instant::now()),
            disconnecting: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            outbound: Mutex::new(VecDeque::new()),
            session: Mutex::new(None),
            worker: Mutex::new(Weak::new()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
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

    pub fn set_username(&self, username: Option<&str>) {
        *self.username.lock() = username.map(Arc::from);
    }

    pub fn username(&self) -> Option<Arc<str>> {
        self.username.lock().clone()
    }

    /// Called by the I/O layer on any inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Keep-alive with the usual 1.5x grace factor; zero disables the check.
    pub fn keep_alive_expired(&self) -> bool {
        if self.keep_alive.is_zero() {
            return false;
        }
        let timeout = self.keep_alive * 3 / 2;
        self.last_activity.lock().elapsed() > timeout
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn mark_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub fn set_disconnect_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(client_id = %self.client_id, %reason, "client disconnect reason set");
        *self.disconnect_reason.lock() = Some(reason);
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.lock().clone()
    }

    /// Hand a message to the connection. Dropped silently once the client is
    /// disconnecting, matching what a closed socket would do anyway.
    pub fn enqueue(&self, message: OutboundMessage) {
        if self.is_disconnecting() {
            return;
        }
        self.outbound.lock().push_back(message);
    }

    /// Take everything queued for the socket, preserving order.
    pub fn drain_outbound(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn assign_session(&self, session: &Arc<Session>) {
        *self.session.lock() = Some(session.clone());
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub(crate) fn set_worker(&self, worker: &Arc<WorkerShared>) {
        *self.worker.lock() = Arc::downgrade(worker);
    }

    pub(crate) fn worker(&self) -> Option<Arc<WorkerShared>> {
        self.worker.lock().upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn outbound(topic: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: bytes::Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
            retain: false,
            packet_id: None,
        }
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let client = Client::new(5, "alpha".into(), true, Duration::from_secs(60));
        client.enqueue(outbound("a"));
        client.enqueue(outbound("b"));
        let out = client.drain_outbound();
        assert_eq!(out[0].topic, "a");
        assert_eq!(out[1].topic, "b");
        assert_eq!(client.outbound_len(), 0);
    }

    #[test]
    fn test_enqueue_dropped_when_disconnecting() {
        let client = Client::new(5, "alpha".into(), true, Duration::from_secs(60));
        client.mark_disconnecting();
        client.enqueue(outbound("a"));
        assert_eq!(client.outbound_len(), 0);
    }

    #[test]
    fn test_keep_alive_zero_never_expires() {
        let client = Client::new(5, "alpha".into(), true, Duration::ZERO);
        assert!(!client.keep_alive_expired());
    }
}
