//! Channel registry: one connection per channel name.
//!
//! The registry is an injected dependency, never process-global state.
//! Components that need a channel receive the registry (or the channel
//! itself) from their constructor, which keeps tests hermetic and lets two
//! registries with different transports coexist in one process.
//!
//! `get_or_create` is the only way a connection comes into existence, so
//! the at-most-one-connection-per-name invariant holds by construction:
//! a read-lock fast path for the common hit, then a write lock with a
//! second lookup to settle races.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backoff::{BackoffSchedule, DEFAULT_MAX_RETRIES};
use crate::channel::{ChannelConfig, ChannelConnection};
use crate::protocol::ChannelName;
use crate::transport::Transport;

/// Authentication context for one app session.
///
/// Fixed for the registry's lifetime: a login or logout builds a fresh
/// registry rather than mutating a live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: Option<Uuid>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn authenticated(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }
}

/// Registry-wide connection settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base endpoint; each channel appends its own path segment.
    pub base_url: String,
    /// Retry budget applied to every channel.
    pub max_retries: u32,
    /// Backoff schedule applied to every channel.
    pub backoff: BackoffSchedule,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://live.agora.example".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffSchedule::default(),
        }
    }
}

impl RegistryConfig {
    /// Config for tests: in-memory endpoint, short backoff.
    pub fn for_testing() -> Self {
        Self {
            base_url: "memory://local".to_string(),
            max_retries: 3,
            backoff: BackoffSchedule::for_testing(),
        }
    }
}

/// Owns every channel connection for one session.
pub struct ChannelRegistry {
    config: RegistryConfig,
    session: Session,
    transport: Arc<dyn Transport>,
    channels: RwLock<HashMap<ChannelName, Arc<ChannelConnection>>>,
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig, session: Session, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            session,
            transport,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Fetch the connection for a channel, creating and starting it on
    /// first use. Concurrent callers for the same name all receive the
    /// same connection.
    pub async fn get_or_create(&self, name: ChannelName) -> Arc<ChannelConnection> {
        {
            let channels = self.channels.read().await;
            if let Some(existing) = channels.get(&name) {
                return Arc::clone(existing);
            }
        }

        let mut channels = self.channels.write().await;
        // Second lookup under the write lock: another caller may have won.
        if let Some(existing) = channels.get(&name) {
            return Arc::clone(existing);
        }

        let config = ChannelConfig {
            url: format!("{}/{}", self.config.base_url, name.as_str()),
            requires_auth: name.requires_auth(),
            max_retries: self.config.max_retries,
            backoff: self.config.backoff.clone(),
        };
        let connection = ChannelConnection::new(name, config, Arc::clone(&self.transport));
        connection.start(&self.session);
        log::info!("registry: created channel {name}");
        channels.insert(name, Arc::clone(&connection));
        connection
    }

    /// Existing connection for a channel, if one was ever created.
    pub async fn channel(&self, name: ChannelName) -> Option<Arc<ChannelConnection>> {
        self.channels.read().await.get(&name).cloned()
    }

    /// Restart a channel that went terminal. Returns `false` when the
    /// channel was never created.
    pub async fn restart(&self, name: ChannelName) -> bool {
        match self.channel(name).await {
            Some(connection) => {
                connection.restart(&self.session);
                true
            }
            None => false,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
