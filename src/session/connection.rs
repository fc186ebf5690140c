//! Connection state and the per-session connection record

use super::reconnect::ReconnectConfig;
use crate::config::SessionConfig;
use crate::transport::{ConnectOptions, Credentials, LastWill};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of a session's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the delay before `attempt`
    Reconnecting { attempt: u32 },
    /// Torn down; no further operations are accepted
    Disposed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, ConnectionState::Disposed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Disposed => f.write_str("disposed"),
        }
    }
}

/// Everything the session knows about its one connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub state: ConnectionState,
    pub client_id: String,
    pub options: ConnectOptions,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
    /// Attempts made in the current reconnection cycle
    pub attempts: u32,
    pub connected_since: Option<Instant>,
    pub successful_connects: u64,
    /// Environment variables holding broker credentials
    pub username_env: Option<String>,
    pub password_env: Option<String>,
}

impl Connection {
    pub fn from_config(config: &SessionConfig) -> Self {
        let client_id = config.resolve_client_id();

        let last_will = config.last_will.as_ref().map(|will| LastWill {
            topic: will.topic.replace("{client_id}", &client_id),
            payload: will.payload.clone().into(),
            qos: will.qos,
            retained: will.retain,
        });

        let options = ConnectOptions {
            broker_url: config.broker.url.clone(),
            client_id: client_id.clone(),
            credentials: None,
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            clean_session: config.broker.clean_session,
            last_will,
        };

        let mut connection = Self {
            state: ConnectionState::Disconnected,
            client_id,
            options,
            reconnect: config.reconnect_config(),
            connect_timeout: config.connect_timeout(),
            attempts: 0,
            connected_since: None,
            successful_connects: 0,
            username_env: config.broker.username_env.clone(),
            password_env: config.broker.password_env.clone(),
        };
        connection.refresh_credentials();
        connection
    }

    /// Re-read credentials from the environment; called before every connect attempt
    pub fn refresh_credentials(&mut self) {
        let username = SessionConfig::get_env_var_optional(self.username_env.as_ref());
        self.options.credentials = username.map(|username| Credentials {
            username,
            password: SessionConfig::get_env_var_optional(self.password_env.as_ref()).unwrap_or_default(),
        });
    }

    /// Record a successful connection; the attempt counter starts over
    pub fn mark_connected(&mut self) {
        self.attempts = 0;
        self.connected_since = Some(Instant::now());
        self.successful_connects += 1;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected_since = None;
    }

    /// Successful connections after the first
    pub fn total_reconnects(&self) -> u64 {
        self.successful_connects.saturating_sub(1)
    }
}
