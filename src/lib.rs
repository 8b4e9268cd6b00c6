//! EmberMQ - multithreaded MQTT publish/subscribe broker core
//!
//! Implements the topic-matching and session model of an MQTT broker:
//! a wildcard subscription trie, a retained-message trie, durable sessions
//! with client takeover, and a password-file/plugin authentication layer.
//! Wire-protocol framing and socket I/O live outside this crate; the core
//! operates on decoded topics, payloads and QoS levels.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;
pub mod worker;

pub use auth::{AclAccess, AuthError, AuthResult, Authenticator};
pub use broker::{Broker, BrokerError};
pub use client::Client;
pub use config::{ConfigError, Settings};
pub use persistence::PersistenceError;
pub use protocol::{OutboundMessage, Publish, QoS};
pub use session::Session;
pub use store::{RetainedMessage, StoreError, SubscriptionStore};
pub use topic::TopicPath;
pub use worker::Worker;
