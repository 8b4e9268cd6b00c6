//! Broker orchestration
//!
//! Owns the shared subscription store, the authenticator and the worker
//! threads, and runs the background maintenance timers: the password-file
//! change check, the session expiry sweep with trie compaction, and the
//! periodic persistence save.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::auth::{AuthError, Authenticator};
use crate::client::Client;
use crate::config::Settings;
use crate::persistence::{self, PersistenceError};
use crate::store::SubscriptionStore;
use crate::worker::Worker;

const MAINTENANCE_TICK: Duration = Duration::from_millis(500);

/// Startup and shutdown errors.
#[derive(Debug)]
pub enum BrokerError {
    Auth(AuthError),
    Persistence(PersistenceError),
    Io(io::Error),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "auth error: {}", e),
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<AuthError> for BrokerError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub struct Broker {
    settings: Settings,
    store: Arc<SubscriptionStore>,
    auth: Arc<Authenticator>,
    workers: Vec<Worker>,
    maintenance: Option<JoinHandle<()>>,
    maintenance_tx: Option<Sender<()>>,
    next_worker: AtomicUsize,
}

impl Broker {
    /// Build the broker: load the auth plugin, prime the password file and
    /// restore persisted state. Plugin failures abort startup.
    pub fn new(settings: Settings) -> Result<Self, BrokerError> {
        let store = Arc::new(SubscriptionStore::new(settings.session.max_queued_messages));
        let auth = Arc::new(Authenticator::new(&settings)?);

        auth.init()?;
        auth.security_init(false)?;
        auth.load_password_file();

        if let Some(path) = &settings.persistence.retained_path {
            persistence::load_retained_messages(&store, path)?;
        }
        if let Some(path) = &settings.persistence.sessions_path {
            persistence::load_sessions(&store, path)?;
        }

        Ok(Self {
            settings,
            store,
            auth,
            workers: Vec::new(),
            maintenance: None,
            maintenance_tx: None,
            next_worker: AtomicUsize::new(0),
        })
    }

    /// Spawn the worker threads and the maintenance thread.
    pub fn start(&mut self) -> Result<(), BrokerError> {
        if !self.workers.is_empty() {
            return Ok(());
        }

        let worker_count = self.settings.server.effective_workers();
        info!(workers = worker_count, "starting broker");

        for id in 0..worker_count {
            self.workers
                .push(Worker::start(id, self.store.clone(), self.auth.clone())?);
        }

        let (tx, rx) = mpsc::channel();
        let store = self.store.clone();
        let auth = self.auth.clone();
        let settings = self.settings.clone();
        let handle = std::thread::Builder::new()
            .name("embermq-maint".to_string())
            .spawn(move || Self::run_maintenance(store, auth, settings, rx))?;

        self.maintenance = Some(handle);
        self.maintenance_tx = Some(tx);
        Ok(())
    }

    fn run_maintenance(
        store: Arc<SubscriptionStore>,
        auth: Arc<Authenticator>,
        settings: Settings,
        rx: Receiver<()>,
    ) {
        let mut last_password_check = Instant::now();
        let mut last_expiry_sweep = Instant::now();
        let mut last_save = Instant::now();

        loop {
            match rx.recv_timeout(MAINTENANCE_TICK) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_password_check.elapsed()
                >= settings.auth.password_file_check_interval_duration()
            {
                auth.load_password_file();
                last_password_check = Instant::now();
            }

            if last_expiry_sweep.elapsed() >= settings.session.expiry_check_interval_duration() {
                store.expire_sessions(settings.session.expire_after());
                last_expiry_sweep = Instant::now();
            }

            if last_save.elapsed() >= settings.persistence.save_interval_duration() {
                if let Err(err) = Self::save_state_inner(&store, &settings) {
                    error!(%err, "periodic state save failed");
                }
                last_save = Instant::now();
            }
        }
    }

    fn save_state_inner(
        store: &SubscriptionStore,
        settings: &Settings,
    ) -> Result<(), PersistenceError> {
        if let Some(path) = &settings.persistence.retained_path {
            persistence::save_retained_messages(store, path)?;
        }
        if let Some(path) = &settings.persistence.sessions_path {
            persistence::save_sessions(store, path)?;
        }
        Ok(())
    }

    /// Write retained messages and sessions to their configured files now.
    pub fn save_state(&self) -> Result<(), PersistenceError> {
        Self::save_state_inner(&self.store, &self.settings)
    }

    /// Hand a new connection to a worker, round robin.
    pub fn give_client(&self, client: Arc<Client>) {
        if self.workers.is_empty() {
            return;
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].give_client(client);
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.store
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Stop every thread, save state a final time and tear down the plugin.
    pub fn stop(&mut self) {
        if self.workers.is_empty() && self.maintenance.is_none() {
            return;
        }
        info!("stopping broker");

        self.auth.set_quitting();

        if let Some(tx) = self.maintenance_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.join();
        }

        for worker in &mut self.workers {
            worker.quit();
        }
        self.workers.clear();

        if let Err(err) = self.save_state() {
            error!(%err, "error saving state on shutdown");
        }
        self.auth.cleanup();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, QoS};

    fn test_settings(workers: usize) -> Settings {
        let mut settings = Settings::default();
        settings.server.workers = workers;
        settings
    }

    #[test]
    fn test_lifecycle() {
        let mut broker = Broker::new(test_settings(2)).unwrap();
        broker.start().unwrap();
        assert_eq!(broker.workers().len(), 2);

        let client = Arc::new(Client::new(
            9,
            "life".into(),
            true,
            Duration::from_secs(60),
        ));
        broker.give_client(client.clone());
        assert_eq!(
            broker.workers().iter().map(|w| w.client_count()).sum::<usize>(),
            1
        );

        broker.store().register_client(&client).unwrap();
        broker.store().subscribe(&client, "t/#", QoS::AtMostOnce).unwrap();
        broker
            .store()
            .publish(&Publish::new("t/x", b"hello".to_vec(), QoS::AtMostOnce))
            .unwrap();
        assert_eq!(client.drain_outbound().len(), 1);

        broker.stop();
        assert!(broker.workers().is_empty());
    }

    #[test]
    fn test_round_robin_placement() {
        let mut broker = Broker::new(test_settings(2)).unwrap();
        broker.start().unwrap();

        for fd in 0..4 {
            broker.give_client(Arc::new(Client::new(
                fd,
                "rr".into(),
                true,
                Duration::from_secs(60),
            )));
        }
        assert_eq!(broker.workers()[0].client_count(), 2);
        assert_eq!(broker.workers()[1].client_count(), 2);
        broker.stop();
    }

    #[test]
    fn test_state_restored_at_startup() {
        let retained = std::env::temp_dir().join(format!(
            "embermq_broker_retained_{}.db",
            std::process::id()
        ));

        let mut settings = test_settings(1);
        settings.persistence.retained_path = Some(retained.clone());

        let broker = Broker::new(settings.clone()).unwrap();
        broker
            .store()
            .set_retained("boot/msg", bytes::Bytes::from_static(b"v"), QoS::AtMostOnce)
            .unwrap();
        broker.save_state().unwrap();
        drop(broker);

        let rebooted = Broker::new(settings).unwrap();
        assert_eq!(rebooted.store().retained_count(), 1);

        std::fs::remove_file(&retained).ok();
    }
}
