//! Periodic liveness sweep.
//!
//! Every tick expires clients whose last heartbeat is older than the
//! configured timeout, tears down what only they kept alive, and pushes an
//! `update` snapshot for every remaining session.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::HubConfig;
use crate::content::ClientKey;
use crate::hub::Hub;

/// Ticker driving [`Hub::sweep`] from the actor loop.
pub struct Sweeper {
    interval: Option<Interval>,
}

impl Sweeper {
    /// Creates a sweeper; a zero `sweep_interval` yields one that never ticks.
    pub fn new(config: &HubConfig) -> Self {
        Self::with_period(config.sweep_interval)
    }

    pub fn with_period(period: Duration) -> Self {
        let interval = (!period.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next tick. Pends forever when disabled.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Clients dropped for missing heartbeats
    pub expired: Vec<ClientKey>,
    /// Sessions that received an `update`
    pub updated: usize,
}

impl Hub {
    pub(crate) fn sweep(&mut self, now: Instant) -> SweepReport {
        let expired = self.clients.expire(now, self.config.heartbeat_timeout);
        for client_key in &expired {
            tracing::info!("Client {} missed its heartbeat, disconnecting", client_key);
            self.disconnect(client_key);
        }

        let sessions = self.sessions.sessions();
        for session in &sessions {
            self.relay.send_update(session);
        }

        SweepReport {
            expired,
            updated: sessions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::{AddOptions, MockEngineFactory};
    use crate::protocol::{ClientMessage, HubMessage, channel_sink};

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    fn hub(timeout: Duration) -> (Hub, mpsc::UnboundedReceiver<HubMessage>) {
        let (sink_tx, outbox) = mpsc::unbounded_channel();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let config = HubConfig {
            heartbeat_timeout: timeout,
            ..HubConfig::for_testing()
        };
        let hub = Hub::new(
            config,
            Arc::new(MockEngineFactory::new()),
            channel_sink(sink_tx),
            events_tx,
        );
        (hub, outbox)
    }

    fn add(hub: &mut Hub, client: &str, now: Instant) {
        hub.handle_message(
            ClientMessage::AddTorrent {
                client_key: client.into(),
                torrent_key: "t1".into(),
                torrent_id: HASH.to_string(),
                options: AddOptions::default(),
            },
            now,
        );
    }

    #[test]
    fn test_sweep_expires_silent_clients_and_updates_the_rest() {
        let (mut hub, mut outbox) = hub(Duration::from_secs(1));
        let start = Instant::now();
        add(&mut hub, "a", start);
        add(&mut hub, "b", start);
        hub.handle_message(
            ClientMessage::Heartbeat {
                client_key: "b".into(),
            },
            start + Duration::from_millis(800),
        );
        while outbox.try_recv().is_ok() {}

        let report = hub.sweep(start + Duration::from_millis(1500));

        assert_eq!(report.expired, vec![ClientKey::from("a")]);
        assert_eq!(report.updated, 1);
        let update = outbox.try_recv().unwrap();
        assert_eq!(update.kind(), "update");
        assert_eq!(update.client_key(), &ClientKey::from("b"));
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn test_sweep_tears_down_engine_with_last_client() {
        let (mut hub, _outbox) = hub(Duration::from_secs(1));
        let start = Instant::now();
        add(&mut hub, "a", start);

        let report = hub.sweep(start + Duration::from_secs(2));

        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.updated, 0);
        assert!(hub.sessions.is_empty());
        assert!(!hub.sessions.engine_running());
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let (mut hub, _outbox) = hub(Duration::ZERO);
        let start = Instant::now();
        add(&mut hub, "a", start);

        let report = hub.sweep(start + Duration::from_secs(3600));

        assert!(report.expired.is_empty());
        assert_eq!(hub.clients.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_after_one_period() {
        let mut sweeper = Sweeper::with_period(Duration::from_millis(100));
        let start = Instant::now();

        let first = sweeper.tick().await;
        let second = sweeper.tick().await;

        assert_eq!(first - start, Duration::from_millis(100));
        assert_eq!(second - first, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_period_disables_sweeper() {
        assert!(!Sweeper::with_period(Duration::ZERO).is_enabled());
    }
}
