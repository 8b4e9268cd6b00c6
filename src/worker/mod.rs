//! Worker threads
//!
//! Each worker runs a dedicated OS thread and owns the clients assigned to
//! it, keyed by file descriptor. The shared subscription store and
//! authenticator are referenced from every worker; publishes routinely cross
//! worker boundaries through the store.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::auth::Authenticator;
use crate::client::Client;
use crate::store::SubscriptionStore;

const KEEP_ALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

enum WorkerCommand {
    Quit,
}

pub(crate) struct WorkerShared {
    id: usize,
    clients: Mutex<AHashMap<RawFd, Arc<Client>>>,
    store: Arc<SubscriptionStore>,
    auth: Arc<Authenticator>,
    running: AtomicBool,
    sent_messages: AtomicU64,
}

impl WorkerShared {
    /// Mark the client disconnecting and drop it from this worker's map.
    pub(crate) fn remove_client(&self, fd: RawFd) {
        if let Some(client) = self.clients.lock().remove(&fd) {
            client.mark_disconnecting();
            debug!(worker = self.id, fd, client_id = %client.client_id(), "client removed");
        }
    }

    pub(crate) fn add_sent(&self, count: u64) {
        self.sent_messages.fetch_add(count, Ordering::Relaxed);
    }

    /// Opportunistic sweep: gives up immediately when the client map is
    /// contended so the owning loop never stalls. Returns whether the sweep
    /// ran.
    fn do_keep_alive_check(&self) -> bool {
        let Some(mut clients) = self.clients.try_lock() else {
            return false;
        };

        clients.retain(|_fd, client| {
            if client.keep_alive_expired() {
                client.set_disconnect_reason("keep-alive expired");
                client.mark_disconnecting();
                false
            } else {
                true
            }
        });
        true
    }
}

/// One broker worker thread.
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
    tx: Sender<WorkerCommand>,
}

impl Worker {
    /// Spawn the worker thread.
    pub fn start(
        id: usize,
        store: Arc<SubscriptionStore>,
        auth: Arc<Authenticator>,
    ) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            id,
            clients: Mutex::new(AHashMap::new()),
            store,
            auth,
            running: AtomicBool::new(true),
            sent_messages: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::channel();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("embermq-worker-{id}"))
            .spawn(move || Self::run(thread_shared, rx))?;

        Ok(Self {
            shared,
            thread: Some(thread),
            tx,
        })
    }

    fn run(shared: Arc<WorkerShared>, rx: Receiver<WorkerCommand>) {
        debug!(worker = shared.id, "worker thread started");
        while shared.running.load(Ordering::Relaxed) {
            match rx.recv_timeout(KEEP_ALIVE_CHECK_INTERVAL) {
                Ok(WorkerCommand::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    shared.do_keep_alive_check();
                }
            }
        }
        debug!(worker = shared.id, "worker thread stopped");
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Adopt a client: it shows up in this worker's map and learns its way
    /// back here for takeover-time removal.
    pub fn give_client(&self, client: Arc<Client>) {
        client.set_worker(&self.shared);
        self.shared.clients.lock().insert(client.fd(), client);
    }

    pub fn get_client(&self, fd: RawFd) -> Option<Arc<Client>> {
        self.shared.clients.lock().get(&fd).cloned()
    }

    pub fn remove_client(&self, client: &Client) {
        self.shared.remove_client(client.fd());
    }

    pub fn remove_client_fd(&self, fd: RawFd) {
        self.shared.remove_client(fd);
    }

    /// Run the keep-alive sweep now; `false` when the map was contended.
    pub fn do_keep_alive_check(&self) -> bool {
        self.shared.do_keep_alive_check()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    pub fn sent_message_count(&self) -> u64 {
        self.shared.sent_messages.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.shared.store
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.shared.auth
    }

    /// Stop the thread and wait for it.
    pub fn quit(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.tx.send(WorkerCommand::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.quit();
    }
}
