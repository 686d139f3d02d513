//! Broker facade: owns the backend and hands accepted connections to the
//! per-connection machinery.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::backend::{Backend, MemoryBackend};
use crate::client;
use crate::config::Config;

/// How long an accepted connection may take to send its CONNECT.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Broker {
    backend: Arc<dyn Backend>,
    connect_timeout: Duration,
}

impl Broker {
    /// A broker backed by a fresh in-memory backend.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let backend: Arc<dyn Backend> = if config.auth.logins.is_empty() {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(MemoryBackend::with_logins(
                config
                    .auth
                    .logins
                    .iter()
                    .map(|(user, password)| (user.clone(), password.clone())),
            ))
        };

        Self {
            backend,
            connect_timeout: config.broker.connect_timeout(),
        }
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Take over responsibility for an accepted connection.
    pub fn handle(&self, stream: TcpStream) {
        if let Err(e) = client::spawn(self.backend.clone(), self.connect_timeout, stream) {
            warn!("failed to start connection threads: {}", e);
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
