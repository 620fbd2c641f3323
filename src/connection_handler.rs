//! Connection lifecycle tracking, reconnection and exponential backoff.
//!
//! The handler never mutates consumer-private state directly. Instead every lifecycle transition is
//! delivered through the `on_event` callback, which the owning actor uses to push a
//! message onto its own inbox, preserving single-writer discipline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::backoff::ExponentialBackoff;
use crate::connection::{BrokerConnection, BrokerError};
use crate::error::ConsumerError;

/// Establishes a fresh connection. Connection establishment and transport I/O are out
/// of scope for this crate; this trait is the seam a layer above provides.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
    Terminated,
}

/// Events the handler delivers back to its owner. Bounced through the actor's own
/// inbox rather than acted on inline.
#[derive(Clone)]
pub enum HandlerEvent {
    Opened(Arc<dyn BrokerConnection>),
    Closed,
    Failed(String),
}

impl std::fmt::Debug for HandlerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerEvent::Opened(_) => f.debug_tuple("Opened").field(&"<connection>").finish(),
            HandlerEvent::Closed => write!(f, "Closed"),
            HandlerEvent::Failed(msg) => f.debug_tuple("Failed").field(msg).finish(),
        }
    }
}

pub struct ConnectionHandler {
    state: ConnectionState,
    connector: Arc<dyn Connector>,
    backoff: ExponentialBackoff,
    connection: Option<Arc<dyn BrokerConnection>>,
}

impl ConnectionHandler {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            state: ConnectionState::Initial,
            connector,
            backoff: ExponentialBackoff::default(),
            connection: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.clone()
    }

    /// Fails the handler synchronously if it has already reached a terminal state.
    pub fn check_if_active(&self) -> Result<(), ConsumerError> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Terminated => Err(ConsumerError::AlreadyClosed),
            _ => Ok(()),
        }
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Distinguishes transport failures (retriable) from protocol-fatal broker
    /// rejections.
    pub fn is_retriable_error(error: &BrokerError) -> bool {
        error.retriable
    }

    /// Triggers an async connect attempt, delivering the outcome via `on_event`.
    /// Runs on a separate cooperative task; the callback is responsible for bouncing
    /// the event back into the owning actor's inbox.
    pub fn grab_connection(&mut self, on_event: Arc<dyn Fn(HandlerEvent) + Send + Sync>) {
        self.state = ConnectionState::Connecting;
        let connector = self.connector.clone();
        tokio::spawn(async move {
            match connector.connect().await {
                Ok(conn) => on_event(HandlerEvent::Opened(conn)),
                Err(e) => on_event(HandlerEvent::Failed(e.message)),
            }
        });
    }

    pub fn mark_ready(&mut self, connection: Arc<dyn BrokerConnection>) {
        self.state = ConnectionState::Ready;
        self.connection = Some(connection);
    }

    pub fn connection_closed(&mut self, on_event: Arc<dyn Fn(HandlerEvent) + Send + Sync>) {
        self.connection = None;
        self.state = ConnectionState::Connecting;
        self.schedule_reconnect(on_event);
    }

    /// Schedules a reconnect attempt after the next backoff delay, without
    /// transitioning to `Connecting` eagerly (used for retriable failures during the
    /// `ConnectionOpened` subscribe handshake).
    pub fn reconnect_later(&mut self, on_event: Arc<dyn Fn(HandlerEvent) + Send + Sync>) {
        self.schedule_reconnect(on_event);
    }

    fn schedule_reconnect(&mut self, on_event: Arc<dyn Fn(HandlerEvent) + Send + Sync>) {
        let delay = self.backoff.next().unwrap_or(Duration::from_secs(60));
        trace!(?delay, "scheduling reconnect");
        let connector = self.connector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match connector.connect().await {
                Ok(conn) => on_event(HandlerEvent::Opened(conn)),
                Err(e) => on_event(HandlerEvent::Failed(e.message)),
            }
        });
    }

    pub fn mark_closing(&mut self) {
        self.state = ConnectionState::Closing;
    }

    pub fn mark_closed(&mut self) {
        debug!("connection handler closed");
        self.connection = None;
        self.state = ConnectionState::Closed;
    }

    pub fn mark_failed(&mut self) {
        self.connection = None;
        self.state = ConnectionState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundCommand;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyConnector {
        attempts: AtomicUsize,
        fail_until: usize,
    }

    struct NullConnection;
    #[async_trait]
    impl BrokerConnection for NullConnection {
        async fn send(&self, _command: OutboundCommand) -> bool {
            true
        }
        async fn send_and_wait_for_reply(&self, _request_id: u64, _command: OutboundCommand) -> Result<(), BrokerError> {
            Ok(())
        }
        fn add_consumer(&self, _consumer_id: u64) {}
        fn remove_consumer(&self, _consumer_id: u64) {}
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_until {
                Err(BrokerError {
                    message: "unavailable".into(),
                    retriable: true,
                })
            } else {
                Ok(Arc::new(NullConnection))
            }
        }
    }

    #[tokio::test]
    async fn check_if_active_rejects_terminal_states() {
        let handler = ConnectionHandler::new(Arc::new(FlakyConnector {
            attempts: AtomicUsize::new(0),
            fail_until: 0,
        }));
        assert!(handler.check_if_active().is_ok());

        let mut failed = handler;
        failed.mark_failed();
        assert!(matches!(failed.check_if_active(), Err(ConsumerError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn grab_connection_eventually_reports_opened() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handler = ConnectionHandler::new(Arc::new(FlakyConnector {
            attempts: AtomicUsize::new(0),
            fail_until: 0,
        }));
        handler.grab_connection(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        assert_eq!(handler.state(), ConnectionState::Connecting);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HandlerEvent::Opened(_)));
    }
}
