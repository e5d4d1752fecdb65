//! Shutdown sequencing.
//!
//! Stopping the lobby runs in two phases. First every live session is told
//! to close with the `server shutdown` reason and the registry is given up to
//! the drain timeout to empty. Then the listener stops accepting and its task
//! is awaited under the same bound.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lobby_core::protocol::reason;

use crate::registry::ConnectionRegistry;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Result of [`ShutdownCoordinator::drain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Sessions that closed within the timeout.
    pub closed: usize,
    /// Sessions still registered when the timeout ran out.
    pub remaining: usize,
}

pub struct ShutdownCoordinator {
    closing: CancellationToken,
    listener: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            closing: CancellationToken::new(),
            listener: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Cancelled as soon as shutdown begins. Session tasks select on it.
    pub fn sessions_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Cancelled once sessions have drained. The HTTP listener stops on it.
    pub fn listener_token(&self) -> CancellationToken {
        self.listener.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Close every session, wait for the registry to empty, then stop the
    /// listener task.
    pub async fn drain(
        &self,
        connections: &ConnectionRegistry,
        listener: JoinHandle<()>,
    ) -> DrainOutcome {
        let open = connections.connection_count();
        info!(
            connections = open,
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "shutting down"
        );
        self.closing.cancel();
        connections.close_all(reason::SERVER_SHUTDOWN);

        let emptied = tokio::time::timeout(self.drain_timeout, async {
            while connections.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();
        let remaining = connections.connection_count();
        if !emptied {
            warn!(remaining, "sessions still open after {:?}", self.drain_timeout);
        }

        self.listener.cancel();
        let abort = listener.abort_handle();
        match tokio::time::timeout(self.drain_timeout, listener).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "listener task failed"),
            Err(_) => {
                warn!("listener did not stop in time, aborting");
                abort.abort();
            }
        }

        DrainOutcome {
            closed: open.saturating_sub(remaining),
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::Token;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Stand-in for a socket task: unregisters once told to close.
    fn session_task(connections: &Arc<ConnectionRegistry>, token: &str) -> JoinHandle<()> {
        let connections = connections.clone();
        let registration = connections.register(Token::new(token));
        tokio::spawn(async move {
            registration.close.closed().await;
            connections.unregister(&registration.id);
        })
    }

    #[tokio::test]
    async fn sessions_close_before_listener_stops() {
        let coord = ShutdownCoordinator::new(Duration::from_secs(1));
        let connections = Arc::new(ConnectionRegistry::new(8));
        let a = session_task(&connections, "A");
        let b = session_task(&connections, "B");

        let listener_token = coord.listener_token();
        let watched = connections.clone();
        let open_at_stop = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = open_at_stop.clone();
        let listener = tokio::spawn(async move {
            listener_token.cancelled().await;
            seen.store(watched.connection_count(), Ordering::SeqCst);
        });

        let outcome = coord.drain(&connections, listener).await;
        assert_eq!(outcome, DrainOutcome { closed: 2, remaining: 0 });
        assert_eq!(open_at_stop.load(Ordering::SeqCst), 0);
        assert!(coord.is_shutting_down());
        assert!(coord.sessions_token().is_cancelled());
        a.await.unwrap();
        b.await.unwrap();
    }

    #[tokio::test]
    async fn close_reason_is_server_shutdown() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(50));
        let connections = ConnectionRegistry::new(8);
        let r = connections.register(Token::new("A"));
        let listener = tokio::spawn(async {});

        let outcome = coord.drain(&connections, listener).await;
        assert!(r.close.is_closed());
        assert_eq!(
            connections.close_reason(&r.id).as_deref(),
            Some(reason::SERVER_SHUTDOWN)
        );
        assert_eq!(outcome, DrainOutcome { closed: 0, remaining: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_listener_is_aborted() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(50));
        let connections = ConnectionRegistry::new(8);
        let listener = tokio::spawn(std::future::pending::<()>());
        let abort = listener.abort_handle();

        coord.drain(&connections, listener).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
