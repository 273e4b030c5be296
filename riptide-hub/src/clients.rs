//! Registry of live remote clients.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::content::ClientKey;

/// Live clients keyed by their self-chosen key, with the time each was
/// last heard from.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientKey, Instant>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client_key` or refreshes its heartbeat.
    ///
    /// Returns true if the client was not known before.
    pub fn touch(&mut self, client_key: &ClientKey, now: Instant) -> bool {
        match self.clients.get_mut(client_key) {
            Some(last_seen) => {
                *last_seen = now;
                false
            }
            None => {
                tracing::debug!("Registering client {}", client_key);
                self.clients.insert(client_key.clone(), now);
                true
            }
        }
    }

    /// Refreshes the heartbeat of a known client.
    ///
    /// Returns false, leaving the registry untouched, for unknown clients.
    pub fn refresh(&mut self, client_key: &ClientKey, now: Instant) -> bool {
        match self.clients.get_mut(client_key) {
            Some(last_seen) => {
                *last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Removes and returns every client silent for longer than `timeout`.
    ///
    /// A zero `timeout` disables expiry.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ClientKey> {
        if timeout.is_zero() {
            return Vec::new();
        }

        let mut expired: Vec<ClientKey> = self
            .clients
            .iter()
            .filter(|(_, last_seen)| now.saturating_duration_since(**last_seen) > timeout)
            .map(|(client_key, _)| client_key.clone())
            .collect();
        expired.sort();

        for client_key in &expired {
            self.clients.remove(client_key);
        }
        expired
    }

    /// Removes a client regardless of its heartbeat.
    pub fn remove(&mut self, client_key: &ClientKey) -> bool {
        self.clients.remove(client_key).is_some()
    }

    pub fn contains(&self, client_key: &ClientKey) -> bool {
        self.clients.contains_key(client_key)
    }

    /// Keys of every live client, sorted.
    pub fn keys(&self) -> Vec<ClientKey> {
        let mut keys: Vec<ClientKey> = self.clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
