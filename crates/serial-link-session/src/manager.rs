//! Connection manager for a single serial session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{self, BoxFuture, Shared},
};
use serial_link_core::{
    BaudRate, PortState, SerialMessage, SerialPlatform, SerialPort, SubscriberRegistry,
    TransportError, Unsubscribe,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::reader::{self, FrameSink};

/// Connection manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Serial transport unavailable")]
    Unavailable,
    #[error("Operation not valid while port is {0}")]
    InvalidState(PortState),
    #[error("Port selection failed: {0}")]
    Selection(#[source] TransportError),
    #[error("Could not open port: {0}")]
    Open(#[source] TransportError),
    #[error("Port is not open")]
    NotOpen,
    #[error("Write failed: {0}")]
    Write(#[source] TransportError),
}

/// Completion signal of a read loop, awaitable from several places.
type ReaderClosed = Shared<BoxFuture<'static, ()>>;

fn settled() -> ReaderClosed {
    future::ready(()).boxed().shared()
}

/// Mutable session state. Never held across an await.
struct Session {
    state: PortState,
    baud_rate: BaudRate,
    port: Option<Arc<dyn SerialPort>>,
    reader_cancel: Option<CancellationToken>,
    reader_closed: ReaderClosed,
    watch_cancel: Option<CancellationToken>,
}

struct Inner<P> {
    platform: P,
    session: Mutex<Session>,
    state_tx: watch::Sender<PortState>,
    write_lock: tokio::sync::Mutex<()>,
    teardown: tokio::sync::Mutex<()>,
    subscribers: SubscriberRegistry,
}

/// Connection manager owning one serial session.
///
/// Cloning yields another handle to the same session.
pub struct ConnectionManager<P>
where
    P: SerialPlatform,
{
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ConnectionManager<P>
where
    P: SerialPlatform,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> ConnectionManager<P>
where
    P: SerialPlatform,
{
    /// Create a manager using the default baud rate.
    #[must_use]
    pub fn new(platform: P) -> Self {
        Self::with_baud_rate(platform, BaudRate::default())
    }

    /// Create a manager with an initial baud rate.
    #[must_use]
    pub fn with_baud_rate(platform: P, baud_rate: BaudRate) -> Self {
        let (state_tx, _) = watch::channel(PortState::Closed);
        Self {
            inner: Arc::new(Inner {
                platform,
                session: Mutex::new(Session {
                    state: PortState::Closed,
                    baud_rate,
                    port: None,
                    reader_cancel: None,
                    reader_closed: settled(),
                    watch_cancel: None,
                }),
                state_tx,
                write_lock: tokio::sync::Mutex::new(()),
                teardown: tokio::sync::Mutex::new(()),
                subscribers: SubscriberRegistry::new(),
            }),
        }
    }

    /// The underlying platform.
    #[must_use]
    pub fn platform(&self) -> &P {
        &self.inner.platform
    }

    /// Whether the platform offers a serial transport.
    #[must_use]
    pub fn can_use_serial(&self) -> bool {
        self.inner.platform.is_available()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> PortState {
        self.lock_session().state
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<PortState> {
        self.inner.state_tx.subscribe()
    }

    /// Baud rate used for the next open.
    #[must_use]
    pub fn baud_rate(&self) -> BaudRate {
        self.lock_session().baud_rate
    }

    /// Change the baud rate.
    ///
    /// Only accepted while the session is closed; returns whether it was applied.
    pub fn set_baud_rate(&self, baud_rate: BaudRate) -> bool {
        let mut session = self.lock_session();
        if session.state != PortState::Closed {
            tracing::warn!(
                state = %session.state,
                %baud_rate,
                "Baud rate can only be changed while the port is closed"
            );
            return false;
        }
        session.baud_rate = baud_rate;
        tracing::debug!(%baud_rate, "Baud rate set");
        true
    }

    /// Register a message callback.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&SerialMessage) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    /// Stream of messages completed from now on.
    #[must_use]
    pub fn message_stream(&self) -> futures::stream::BoxStream<'static, SerialMessage> {
        self.inner.subscribers.stream()
    }

    /// Select and open a port, then start reading from it.
    ///
    /// Returns whether the session is now open. Failures are logged and
    /// leave the session closed.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(ManagerError::InvalidState(state)) => {
                tracing::debug!(%state, "Connect ignored");
                false
            }
            Err(e) => {
                tracing::error!("Connect failed: {e}");
                false
            }
        }
    }

    /// Select and open a port, reporting why it failed.
    ///
    /// # Errors
    /// Returns error if the session is not closed, the platform is
    /// unavailable, no port was selected or the port could not be opened.
    pub async fn try_connect(&self) -> Result<(), ManagerError> {
        if !self.can_use_serial() {
            return Err(ManagerError::Unavailable);
        }

        let baud_rate = {
            let mut session = self.lock_session();
            if session.state != PortState::Closed {
                return Err(ManagerError::InvalidState(session.state));
            }
            self.set_state(&mut session, PortState::Opening);
            session.baud_rate
        };

        let mut port = match self.inner.platform.request_port().await {
            Ok(port) => port,
            Err(e) => {
                self.revert_opening();
                return Err(ManagerError::Selection(e));
            }
        };

        if let Err(e) = port.open(baud_rate).await {
            self.revert_opening();
            return Err(ManagerError::Open(e));
        }

        let port: Arc<dyn SerialPort> = Arc::from(port);
        let name = port.name();
        let events = self.inner.platform.disconnect_events();

        {
            let mut session = self.lock_session();
            session.port = Some(Arc::clone(&port));
            self.set_state(&mut session, PortState::Open);
            self.start_reader(&mut session, port);
            session.watch_cancel = Some(self.spawn_disconnect_watch(name.clone(), events));
        }

        tracing::info!(port = %name, %baud_rate, "Serial port opened");
        Ok(())
    }

    /// Close the session.
    ///
    /// Cancels the read loop and waits for it to finish before the port is
    /// closed. Does nothing unless the session is open.
    pub async fn disconnect(&self) {
        let _teardown = self.inner.teardown.lock().await;

        let (port, reader_cancel, reader_closed, watch_cancel) = {
            let mut session = self.lock_session();
            if session.state != PortState::Open {
                tracing::debug!(state = %session.state, "Disconnect ignored");
                return;
            }
            let Some(port) = session.port.clone() else {
                return;
            };
            self.set_state(&mut session, PortState::Closing);
            (
                port,
                session.reader_cancel.take(),
                session.reader_closed.clone(),
                session.watch_cancel.take(),
            )
        };

        if let Some(token) = watch_cancel {
            token.cancel();
        }
        if let Some(token) = reader_cancel {
            token.cancel();
        }
        reader_closed.await;

        if let Err(e) = port.close().await {
            tracing::warn!(port = %port.name(), "Error while closing port: {e}");
        }

        let mut session = self.lock_session();
        session.port = None;
        self.set_state(&mut session, PortState::Closed);
        drop(session);

        tracing::info!(port = %port.name(), "Serial port closed");
    }

    /// Tear the session down after the device went away.
    ///
    /// Waits for any teardown already in progress, drains the read loop,
    /// releases the port and forces the session closed.
    pub async fn handle_port_lost(&self) {
        let _teardown = self.inner.teardown.lock().await;

        let (port, reader_cancel, reader_closed, watch_cancel) = {
            let mut session = self.lock_session();
            if session.state != PortState::Open {
                return;
            }
            self.set_state(&mut session, PortState::Closing);
            (
                session.port.clone(),
                session.reader_cancel.take(),
                session.reader_closed.clone(),
                session.watch_cancel.take(),
            )
        };

        if let Some(token) = watch_cancel {
            token.cancel();
        }
        if let Some(token) = reader_cancel {
            token.cancel();
        }
        reader_closed.await;

        if let Some(port) = &port {
            tracing::warn!(port = %port.name(), "Serial port disconnected unexpectedly");
            if let Err(e) = port.close().await {
                tracing::debug!(port = %port.name(), "Close after removal failed: {e}");
            }
        }

        let mut session = self.lock_session();
        session.port = None;
        session.reader_closed = settled();
        self.set_state(&mut session, PortState::Closed);
    }

    /// Write bytes to the open port.
    ///
    /// Returns whether the write succeeded; failures are logged.
    pub async fn send(&self, data: &[u8]) -> bool {
        match self.try_send(data).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(len = data.len(), "Failed to send message: {e}");
                false
            }
        }
    }

    /// Write bytes to the open port, reporting why it failed.
    ///
    /// Write access is exclusive and is released on every path.
    ///
    /// # Errors
    /// Returns error if the port is not open or the write fails.
    pub async fn try_send(&self, data: &[u8]) -> Result<(), ManagerError> {
        let port = {
            let session = self.lock_session();
            match (session.state, &session.port) {
                (PortState::Open, Some(port)) => Arc::clone(port),
                _ => return Err(ManagerError::NotOpen),
            }
        };

        let _writer = self.inner.write_lock.lock().await;
        port.write(data).await.map_err(ManagerError::Write)
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session: &mut Session, state: PortState) {
        tracing::debug!(from = %session.state, to = %state, "Port state change");
        session.state = state;
        self.inner.state_tx.send_replace(state);
    }

    fn revert_opening(&self) {
        let mut session = self.lock_session();
        if session.state == PortState::Opening {
            self.set_state(&mut session, PortState::Closed);
        }
    }

    /// Attach a fresh read loop to `port`.
    ///
    /// The new loop waits for the previous one to finish, and never runs if
    /// it is cancelled in the meantime.
    fn start_reader(&self, session: &mut Session, port: Arc<dyn SerialPort>) {
        if let Some(previous) = session.reader_cancel.take() {
            previous.cancel();
        }

        let previous_closed = session.reader_closed.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = self.clone();

        let task = tokio::spawn(async move {
            previous_closed.await;
            if token.is_cancelled() {
                return;
            }
            match port.reader() {
                Ok(port_reader) => {
                    let outcome = reader::run_read_loop(port_reader, &manager, &token).await;
                    tracing::debug!(port = %port.name(), ?outcome, "Read loop finished");
                }
                Err(e) => tracing::error!(port = %port.name(), "Could not attach reader: {e}"),
            }
        });

        session.reader_closed = task
            .map(|res| {
                if let Err(e) = res {
                    tracing::error!("Read loop task failed: {e}");
                }
            })
            .boxed()
            .shared();
        session.reader_cancel = Some(cancel);
    }

    fn spawn_disconnect_watch(
        &self,
        port_name: String,
        mut events: broadcast::Receiver<String>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(name) if name == port_name => {
                            manager.handle_port_lost().await;
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Missed disconnect events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        cancel
    }
}

#[async_trait]
impl<P> FrameSink for ConnectionManager<P>
where
    P: SerialPlatform,
{
    fn deliver(&self, message: &SerialMessage) {
        self.inner.subscribers.notify(message);
    }

    async fn acknowledge(&self, ack: &[u8]) -> bool {
        match self.try_send(ack).await {
            Ok(()) => true,
            // Teardown already started.
            Err(ManagerError::NotOpen) => {
                tracing::debug!("Acknowledgment skipped, port is not open");
                false
            }
            Err(e) => {
                tracing::error!("Failed to write acknowledgment: {e}");
                false
            }
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::time::Duration;

    use serial_link_core::ACK_BYTE;

    use super::*;
    use crate::platform::MemoryPlatform;

    #[tokio::test]
    async fn test_initial_state() {
        let manager = ConnectionManager::new(MemoryPlatform::new("mem0"));
        assert_eq!(manager.state(), PortState::Closed);
        assert_eq!(manager.baud_rate(), BaudRate::B115200);
        assert!(manager.can_use_serial());
        assert!(!manager.send(&[ACK_BYTE]).await);
    }

    #[tokio::test]
    async fn test_state_watch_sees_transitions() {
        let platform = MemoryPlatform::new("mem0");
        let manager = ConnectionManager::new(platform);
        let mut states = manager.watch_state();

        assert!(manager.connect().await);
        assert_eq!(*states.borrow_and_update(), PortState::Open);

        manager.disconnect().await;
        tokio::time::timeout(Duration::from_secs(1), states.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*states.borrow(), PortState::Closed);
    }

    #[tokio::test]
    async fn test_unavailable_platform() {
        let platform = MemoryPlatform::new("mem0");
        platform.set_available(false);
        let manager = ConnectionManager::new(platform);

        assert!(matches!(
            manager.try_connect().await,
            Err(ManagerError::Unavailable)
        ));
        assert_eq!(manager.state(), PortState::Closed);
    }
}
