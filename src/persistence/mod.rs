//! Persistence
//!
//! Retained messages and sessions+subscriptions round-trip through two
//! opaque framed byte streams: a magic tag followed by a bincode body. State
//! is copied out under the store's locks and written to disk afterwards, so
//! disk latency never blocks the broker. A missing file on load is only a
//! warning; a failed save propagates.

mod error;
mod models;

pub use error::{PersistenceError, Result};
pub use models::{
    RetainedMessagesFile, SessionsFile, StoredQueuedMessage, StoredRetainedMessage, StoredSession,
    StoredSubscription, StoredSubscriptionEntry,
};

use std::fs;
use std::path::Path;

use bincode::{Decode, Encode};
use tracing::{debug, info, warn};

use crate::store::SubscriptionStore;

const RETAINED_MAGIC: &[u8; 8] = b"EMQRETN1";
const SESSIONS_MAGIC: &[u8; 8] = b"EMQSESS1";

fn write_file<T: Encode>(path: &Path, magic: &[u8; 8], value: &T) -> Result<()> {
    let body = bincode::encode_to_vec(value, bincode::config::standard())?;
    let mut buf = Vec::with_capacity(magic.len() + body.len());
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&body);
    fs::write(path, buf)?;
    Ok(())
}

fn read_file<T: Decode<()>>(path: &Path, magic: &[u8; 8]) -> Result<T> {
    let data = fs::read(path)?;
    let Some(body) = data.strip_prefix(magic.as_slice()) else {
        return Err(PersistenceError::Corruption(format!(
            "unrecognized file header in {}",
            path.display()
        )));
    };
    let (value, _) = bincode::decode_from_slice(body, bincode::config::standard())?;
    Ok(value)
}

/// Save all retained messages to `path`.
pub fn save_retained_messages(store: &SubscriptionStore, path: &Path) -> Result<()> {
    info!(path = %path.display(), "saving retained messages");

    let snapshot = store.retained_snapshot();
    debug!(count = snapshot.len(), "collected retained messages to save");

    let file = RetainedMessagesFile {
        messages: snapshot
            .iter()
            .map(StoredRetainedMessage::from_runtime)
            .collect(),
    };
    write_file(path, RETAINED_MAGIC, &file)
}

/// Load retained messages from `path` into the store. A file that is not
/// there yet is not an error.
pub fn load_retained_messages(store: &SubscriptionStore, path: &Path) -> Result<()> {
    info!(path = %path.display(), "loading retained messages");

    let file: RetainedMessagesFile = match read_file(path, RETAINED_MAGIC) {
        Ok(file) => file,
        Err(PersistenceError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "file is not there (yet)");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let count = file.messages.len();
    let messages = file
        .messages
        .into_iter()
        .filter_map(|stored| {
            let topic = stored.topic.clone();
            let runtime = stored.into_runtime();
            if runtime.is_none() {
                warn!(%topic, "dropping retained message with invalid qos");
            }
            runtime
        })
        .collect();
    store.restore_retained(messages);
    debug!(count, "restored retained messages");
    Ok(())
}

/// Save all sessions and the subscription mapping to `path`.
pub fn save_sessions(store: &SubscriptionStore, path: &Path) -> Result<()> {
    info!(path = %path.display(), "saving sessions and subscriptions");

    let (sessions, subscriptions) = store.sessions_snapshot();
    debug!(
        sessions = sessions.len(),
        subscriptions = subscriptions.len(),
        "collected sessions and subscriptions to save"
    );

    let file = SessionsFile {
        sessions: sessions.iter().map(StoredSession::from_runtime).collect(),
        subscriptions: subscriptions
            .iter()
            .map(StoredSubscription::from_runtime)
            .collect(),
    };
    write_file(path, SESSIONS_MAGIC, &file)
}

/// Load sessions and subscriptions from `path` into the store. Sessions are
/// inserted first so each subscription can resolve its client id to a live
/// session. A file that is not there yet is not an error.
pub fn load_sessions(store: &SubscriptionStore, path: &Path) -> Result<()> {
    info!(path = %path.display(), "loading sessions and subscriptions");

    let file: SessionsFile = match read_file(path, SESSIONS_MAGIC) {
        Ok(file) => file,
        Err(PersistenceError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "file is not there (yet)");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let sessions = file
        .sessions
        .into_iter()
        .map(StoredSession::into_runtime)
        .collect();
    let subscriptions = file
        .subscriptions
        .into_iter()
        .map(StoredSubscription::into_runtime)
        .collect();
    store.restore_sessions(sessions, subscriptions);
    Ok(())
}
