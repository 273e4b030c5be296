//! Single-flight endpoint creation per session.
//!
//! Any number of callers may ask for a session's endpoint while it is being
//! created. Creation starts once; callers queue up and are answered in
//! arrival order once the engine reports the outcome.

use std::collections::VecDeque;
use std::fmt;

use crate::engine::{Endpoint, TorrentError};

/// Endpoint lifecycle of one session.
///
/// `W` is whatever the caller needs to answer a waiter later.
pub enum EndpointState<W> {
    /// No endpoint and none being created
    Idle,
    /// Creation in flight; waiters in arrival order
    Pending { waiters: VecDeque<W> },
    /// Endpoint listening
    Ready {
        url: String,
        endpoint: Box<dyn Endpoint>,
    },
}

/// What the caller must do after [`EndpointState::ensure`].
#[derive(Debug, PartialEq)]
pub enum EnsureOutcome<W> {
    /// Endpoint already exists; answer the waiter right away
    Ready { url: String, waiter: W },
    /// Joined an in-flight creation; nothing to do
    Queued,
    /// First request; the caller must start creation
    Start,
}

/// Result of a finished creation, with everyone who was waiting for it.
#[derive(Debug)]
pub struct Settled<W> {
    pub outcome: Result<String, TorrentError>,
    pub waiters: VecDeque<W>,
}

impl<W> EndpointState<W> {
    /// Registers interest in the endpoint.
    pub fn ensure(&mut self, waiter: W) -> EnsureOutcome<W> {
        match self {
            EndpointState::Ready { url, .. } => EnsureOutcome::Ready {
                url: url.clone(),
                waiter,
            },
            EndpointState::Pending { waiters } => {
                waiters.push_back(waiter);
                EnsureOutcome::Queued
            }
            EndpointState::Idle => {
                *self = EndpointState::Pending {
                    waiters: VecDeque::from([waiter]),
                };
                EnsureOutcome::Start
            }
        }
    }

    /// Records the outcome of an in-flight creation.
    ///
    /// On success the state becomes `Ready`; on failure it returns to `Idle`
    /// so a later request retries. Returns `None` if no creation was in
    /// flight, in which case a successfully created endpoint is closed.
    pub fn settle(
        &mut self,
        result: Result<Box<dyn Endpoint>, TorrentError>,
    ) -> Option<Settled<W>> {
        let waiters = match std::mem::take(self) {
            EndpointState::Pending { waiters } => waiters,
            other => {
                *self = other;
                if let Ok(endpoint) = result {
                    endpoint.close();
                }
                return None;
            }
        };

        let outcome = match result {
            Ok(endpoint) => {
                let url = endpoint.url();
                *self = EndpointState::Ready {
                    url: url.clone(),
                    endpoint,
                };
                Ok(url)
            }
            Err(e) => Err(e),
        };

        Some(Settled { outcome, waiters })
    }

    /// Resets to `Idle`, closing a listening endpoint.
    ///
    /// Returns waiters of an in-flight creation; they must be told it was
    /// cancelled.
    pub fn teardown(&mut self) -> VecDeque<W> {
        match std::mem::take(self) {
            EndpointState::Idle => VecDeque::new(),
            EndpointState::Pending { waiters } => waiters,
            EndpointState::Ready { endpoint, .. } => {
                endpoint.close();
                VecDeque::new()
            }
        }
    }

    /// URL of the listening endpoint, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            EndpointState::Ready { url, .. } => Some(url),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, EndpointState::Pending { .. })
    }
}

impl<W> Default for EndpointState<W> {
    fn default() -> Self {
        EndpointState::Idle
    }
}

impl<W> fmt::Debug for EndpointState<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Idle => write!(f, "Idle"),
            EndpointState::Pending { waiters } => {
                write!(f, "Pending({} waiters)", waiters.len())
            }
            EndpointState::Ready { url, .. } => write!(f, "Ready({url})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct TestEndpoint {
        url: String,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl Endpoint for TestEndpoint {
        fn url(&self) -> String {
            self.url.clone()
        }

        fn close(&self) {
            self.closed.lock().push(self.url.clone());
        }
    }

    fn endpoint(url: &str, closed: &Arc<Mutex<Vec<String>>>) -> Box<dyn Endpoint> {
        Box::new(TestEndpoint {
            url: url.to_string(),
            closed: closed.clone(),
        })
    }

    #[test]
    fn test_first_request_starts_creation_others_queue() {
        let mut state = EndpointState::Idle;

        assert_eq!(state.ensure(1), EnsureOutcome::Start);
        assert_eq!(state.ensure(2), EnsureOutcome::Queued);
        assert_eq!(state.ensure(3), EnsureOutcome::Queued);
        assert!(state.is_pending());
    }

    #[test]
    fn test_settle_answers_waiters_in_arrival_order() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let mut state = EndpointState::Idle;
        state.ensure("a");
        state.ensure("b");
        state.ensure("c");

        let settled = state
            .settle(Ok(endpoint("http://localhost:9000", &closed)))
            .unwrap();

        assert_eq!(settled.outcome, Ok("http://localhost:9000".to_string()));
        assert_eq!(settled.waiters, VecDeque::from(["a", "b", "c"]));
        assert_eq!(state.url(), Some("http://localhost:9000"));
        assert_eq!(
            state.ensure("d"),
            EnsureOutcome::Ready {
                url: "http://localhost:9000".to_string(),
                waiter: "d"
            }
        );
    }

    #[test]
    fn test_failure_notifies_everyone_and_allows_retry() {
        let mut state = EndpointState::Idle;
        state.ensure(1);
        state.ensure(2);

        let settled = state
            .settle(Err(TorrentError::EndpointFailed {
                reason: "address in use".to_string(),
            }))
            .unwrap();

        assert!(settled.outcome.is_err());
        assert_eq!(settled.waiters.len(), 2);
        assert_eq!(state.ensure(3), EnsureOutcome::Start);
    }

    #[test]
    fn test_teardown_returns_pending_waiters() {
        let mut state = EndpointState::Idle;
        state.ensure(1);
        state.ensure(2);

        let cancelled = state.teardown();

        assert_eq!(cancelled, VecDeque::from([1, 2]));
        assert!(!state.is_pending());
    }

    #[test]
    fn test_teardown_closes_ready_endpoint() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let mut state = EndpointState::Idle;
        state.ensure(1);
        state.settle(Ok(endpoint("http://localhost:9001", &closed)));

        assert!(state.teardown().is_empty());
        assert_eq!(*closed.lock(), vec!["http://localhost:9001".to_string()]);
        assert_eq!(state.url(), None);
    }

    #[test]
    fn test_stale_settle_closes_orphaned_endpoint() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let mut state: EndpointState<u32> = EndpointState::Idle;

        assert!(state.settle(Ok(endpoint("http://localhost:9002", &closed))).is_none());
        assert_eq!(*closed.lock(), vec!["http://localhost:9002".to_string()]);
    }
}
