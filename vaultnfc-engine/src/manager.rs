use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vaultnfc_core::WIFI_DIRECT_PORT;
use vaultnfc_core::error::TransferError;
use vaultnfc_core::record::PeerDescriptor;
use vaultnfc_core::status::TransferStatus;
use vaultnfc_core::transport::{Connection, Connector, Listener, ListenerFactory};

use crate::session::{self, SessionCmd, SessionEvent, SessionHandle};

/// How long a closing session gets to shut its stream down before its task
/// is aborted.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

// ── State ───────────────────────────────────────────────────────────

/// The manager's connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

// ── Manager commands (caller → manager) ─────────────────────────────

enum ManagerCmd {
    StartServer {
        reply: oneshot::Sender<Result<String, TransferError>>,
    },
    Connect {
        peer: PeerDescriptor,
        reply: oneshot::Sender<()>,
    },
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ShutDown,
}

// ── Manager events (manager → caller) ───────────────────────────────

/// Events emitted by the manager, in emission order.
#[derive(Clone, Debug)]
pub enum ManagerEvent {
    /// The user-facing status changed.
    StatusChanged(TransferStatus),
    /// The listener is bound and waiting for a peer on `addr`.
    Listening { addr: String },
    /// A session is live.
    Connected { session_id: u64, peer: String },
    /// Bytes exactly as one read returned them.
    Chunk { session_id: u64, bytes: Bytes },
    /// A complete payload arrived.
    PayloadReceived { session_id: u64, payload: Bytes },
    /// The session ended.  `reason` is `None` for a local disconnect.
    Disconnected {
        session_id: u64,
        reason: Option<TransferError>,
    },
}

/// Configuration for a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Address handed to the listener factory by
    /// [`start_server`](ManagerHandle::start_server).  For TCP this is
    /// `ip:port`; for RFCOMM the service UUID (empty for the default).
    pub listen_addr: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{WIFI_DIRECT_PORT}"),
        }
    }
}

// ── Manager handle ──────────────────────────────────────────────────

/// Handle returned by [`ConnectionManager::start`].
///
/// Cloning is cheap; every clone drives the same manager.  The manager stops
/// once [`shut_down`](Self::shut_down) is called or the last handle is
/// dropped.
#[derive(Clone)]
pub struct ManagerHandle {
    cmd_tx: mpsc::Sender<ManagerCmd>,
    events_tx: broadcast::Sender<ManagerEvent>,
    state_rx: watch::Receiver<LinkState>,
    status_rx: watch::Receiver<TransferStatus>,
    payload_rx: watch::Receiver<Option<Bytes>>,
}

impl ManagerHandle {
    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> ManagerCmd,
    ) -> Result<T, TransferError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(tx))
            .await
            .map_err(|_| TransferError::ManagerStopped)?;
        rx.await.map_err(|_| TransferError::ManagerStopped)
    }

    /// Tears down anything alive, binds the listener and waits for one
    /// inbound connection.  Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ConnectFailed`] if the listener cannot be
    /// bound.
    pub async fn start_server(&self) -> Result<String, TransferError> {
        self.request(|reply| ManagerCmd::StartServer { reply }).await?
    }

    /// Tears down anything alive and starts connecting to `peer` in the
    /// background.  The outcome arrives as a status change.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ManagerStopped`] if the manager has stopped.
    pub async fn connect_to_peer(&self, peer: PeerDescriptor) -> Result<(), TransferError> {
        self.request(|reply| ManagerCmd::Connect { peer, reply }).await
    }

    /// Sends one payload over the live session and waits until it has been
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotConnected`] outside the connected state and
    /// [`TransferError::WriteFailed`] if the stream fails, the session's write
    /// queue is full, or the session closes before the payload is written.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TransferError> {
        match self.request(|reply| ManagerCmd::Send { payload, reply }).await {
            Ok(result) => result,
            // The reply travels with the write; a torn-down session drops it.
            Err(TransferError::ManagerStopped) if !self.cmd_tx.is_closed() => Err(
                TransferError::WriteFailed("session closed before the payload was written".into()),
            ),
            Err(e) => Err(e),
        }
    }

    /// Closes whatever is open and moves to [`LinkState::Disconnected`].
    /// Safe to call from any state, any number of times.
    pub async fn disconnect(&self) {
        if self
            .request(|reply| ManagerCmd::Disconnect { reply })
            .await
            .is_err()
        {
            debug!("Disconnect requested after manager stopped");
        }
    }

    /// Stops the manager, releasing every socket it holds.
    pub async fn shut_down(&self) {
        let _ = self.cmd_tx.send(ManagerCmd::ShutDown).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn status(&self) -> TransferStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<TransferStatus> {
        self.status_rx.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// The most recent complete payload received on any session.
    pub fn last_payload(&self) -> Option<Bytes> {
        self.payload_rx.borrow().clone()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// The connection lifecycle manager.
///
/// Owns at most one listener, one in-flight connect and one session at a
/// time; starting a new accept or connect first tears down whatever is
/// alive.  Generic over:
/// - `F: ListenerFactory`: the acceptor side (Wi-Fi Direct group owner,
///   RFCOMM service record)
/// - `K: Connector`: the initiator side
pub struct ConnectionManager;

impl ConnectionManager {
    /// Spawn the manager event loop and return a handle to control it.
    ///
    /// The manager starts [`LinkState::Idle`].  Must be called inside a tokio
    /// runtime.
    pub fn start<F, K>(self, factory: F, connector: K, config: ManagerConfig) -> ManagerHandle
    where
        F: ListenerFactory,
        K: Connector,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ManagerCmd>(32);
        let (events_tx, _) = broadcast::channel::<ManagerEvent>(128);
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let (status_tx, status_rx) = watch::channel(TransferStatus::Idle);
        let (payload_tx, payload_rx) = watch::channel(None);
        let (connect_tx, connect_rx) = mpsc::channel(4);
        let (session_tx, session_rx) = mpsc::channel(64);

        let published = Published {
            state_tx,
            status_tx,
            payload_tx,
            events: events_tx.clone(),
        };

        let manager = ManagerLoop::<F, K> {
            factory,
            connector: Arc::new(connector),
            config,
            published,
            listener: None,
            connecting: None,
            session: None,
            next_id: 1,
            connect_tx,
            session_tx,
        };

        info!("Spawning connection manager");
        tokio::spawn(manager.run(cmd_rx, connect_rx, session_rx));

        ManagerHandle {
            cmd_tx,
            events_tx,
            state_rx,
            status_rx,
            payload_rx,
        }
    }
}

/// Everything the caller can observe.
struct Published {
    state_tx: watch::Sender<LinkState>,
    status_tx: watch::Sender<TransferStatus>,
    payload_tx: watch::Sender<Option<Bytes>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl Published {
    fn set(&self, state: LinkState, status: TransferStatus) {
        self.state_tx.send_replace(state);
        self.set_status(status);
    }

    fn set_status(&self, status: TransferStatus) {
        let previous = self.status_tx.send_replace(status.clone());
        if previous != status {
            debug!(status = %status, "Transfer status changed");
            self.emit(ManagerEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }
}

type ConnectResult<C> = (u64, anyhow::Result<C>);

struct ManagerLoop<F: ListenerFactory, K: Connector> {
    factory: F,
    connector: Arc<K>,
    config: ManagerConfig,
    published: Published,
    listener: Option<F::L>,
    connecting: Option<(u64, JoinHandle<()>)>,
    session: Option<SessionHandle>,
    next_id: u64,
    connect_tx: mpsc::Sender<ConnectResult<K::Conn>>,
    session_tx: mpsc::Sender<(u64, SessionEvent)>,
}

impl<F: ListenerFactory, K: Connector> ManagerLoop<F, K> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ManagerCmd>,
        mut connect_rx: mpsc::Receiver<ConnectResult<K::Conn>>,
        mut session_rx: mpsc::Receiver<(u64, SessionEvent)>,
    ) {
        debug!("Connection manager loop running");

        loop {
            tokio::select! {
                biased;

                // ── Commands ────────────────────────────────────────
                cmd = cmd_rx.recv() => match cmd {
                    Some(ManagerCmd::ShutDown) | None => {
                        info!("Connection manager shutting down");
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd).await,
                },

                // ── Session events ──────────────────────────────────
                Some((id, event)) = session_rx.recv() => self.on_session_event(id, event),

                // ── Outbound connect results ────────────────────────
                Some((attempt, result)) = connect_rx.recv() => {
                    self.on_connect_result(attempt, result);
                }

                // ── Inbound connection ──────────────────────────────
                result = accept_next(&mut self.listener), if self.listener.is_some() => {
                    self.on_accept(result);
                }
            }
        }

        self.teardown().await;
        info!("Connection manager loop stopped");
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn handle_cmd(&mut self, cmd: ManagerCmd) {
        match cmd {
            ManagerCmd::StartServer { reply } => {
                self.teardown().await;
                let addr = &self.config.listen_addr;
                info!(addr = %addr, "Starting server");
                match self.factory.bind(addr).await {
                    Ok(listener) => {
                        let bound = listener.local_addr();
                        info!(addr = %bound, "Waiting for a peer");
                        self.listener = Some(listener);
                        self.published
                            .set(LinkState::Listening, TransferStatus::AwaitingPayload);
                        self.published.emit(ManagerEvent::Listening {
                            addr: bound.clone(),
                        });
                        let _ = reply.send(Ok(bound));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to bind listener");
                        let err = TransferError::connect(&e);
                        self.published.set(
                            LinkState::Disconnected,
                            TransferStatus::Failed(err.clone()),
                        );
                        let _ = reply.send(Err(err));
                    }
                }
            }

            ManagerCmd::Connect { peer, reply } => {
                self.teardown().await;
                let attempt = self.allocate_id();
                info!(
                    attempt = attempt,
                    peer = %peer.display_name(),
                    endpoint = %peer.endpoint,
                    "Connecting to peer"
                );

                let connector = Arc::clone(&self.connector);
                let results = self.connect_tx.clone();
                let task = tokio::spawn(async move {
                    let result = connector.connect(&peer.endpoint).await;
                    let _ = results.send((attempt, result)).await;
                });
                self.connecting = Some((attempt, task));
                self.published
                    .set(LinkState::Connecting, TransferStatus::Connecting);
                let _ = reply.send(());
            }

            ManagerCmd::Send { payload, reply } => {
                let Some(session) = self.session.as_ref() else {
                    let _ = reply.send(Err(TransferError::NotConnected));
                    return;
                };
                // Never wait on the session here: a peer that stops reading
                // would stall the loop and every later command with it.
                if let Err(e) = session.cmd_tx.try_send(SessionCmd::Send { payload, reply }) {
                    let err = match &e {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!(session_id = session.id, "Write queue full, rejecting payload");
                            TransferError::WriteFailed("session busy".into())
                        }
                        mpsc::error::TrySendError::Closed(_) => TransferError::NotConnected,
                    };
                    if let SessionCmd::Send { reply, .. } = e.into_inner() {
                        let _ = reply.send(Err(err));
                    }
                }
            }

            ManagerCmd::Disconnect { reply } => {
                self.teardown().await;
                self.published
                    .set(LinkState::Disconnected, TransferStatus::Disconnected);
                let _ = reply.send(());
            }

            // Intercepted by the event loop before it gets here.
            ManagerCmd::ShutDown => {}
        }
    }

    fn on_accept(&mut self, result: anyhow::Result<<F::L as Listener>::Conn>) {
        // One accept per start_server; the service stops advertising here.
        self.listener = None;
        match result {
            Ok(conn) => {
                let id = self.allocate_id();
                self.start_session(id, conn);
                self.published.set_status(TransferStatus::AwaitingPayload);
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                self.published.set(
                    LinkState::Disconnected,
                    TransferStatus::Failed(TransferError::connect(&e)),
                );
            }
        }
    }

    fn on_connect_result(&mut self, attempt: u64, result: anyhow::Result<K::Conn>) {
        let current = self.connecting.as_ref().map(|(id, _)| *id);
        if current != Some(attempt) {
            debug!(attempt = attempt, "Dropping result of an abandoned connect attempt");
            return;
        }
        self.connecting = None;

        match result {
            Ok(conn) => self.start_session(attempt, conn),
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Failed to connect");
                self.published.set(
                    LinkState::Disconnected,
                    TransferStatus::Failed(TransferError::connect(&e)),
                );
            }
        }
    }

    fn start_session<C: Connection>(&mut self, id: u64, conn: C) {
        let handle = session::spawn(id, conn, self.session_tx.clone());
        info!(session_id = id, peer = %handle.peer, "Connected");
        let peer = handle.peer.clone();
        self.session = Some(handle);
        self.published
            .set(LinkState::Connected, TransferStatus::Connected);
        self.published.emit(ManagerEvent::Connected {
            session_id: id,
            peer,
        });
    }

    fn on_session_event(&mut self, id: u64, event: SessionEvent) {
        if self.session.as_ref().map(|s| s.id) != Some(id) {
            debug!(session_id = id, "Ignoring event from a closed session");
            return;
        }

        match event {
            SessionEvent::Chunk(bytes) => {
                self.published.emit(ManagerEvent::Chunk {
                    session_id: id,
                    bytes,
                });
            }
            SessionEvent::Payload(payload) => {
                self.published.payload_tx.send_replace(Some(payload.clone()));
                self.published.set_status(TransferStatus::PayloadReceived);
                self.published.emit(ManagerEvent::PayloadReceived {
                    session_id: id,
                    payload,
                });
            }
            SessionEvent::Closed { error } => {
                self.session = None;
                info!(session_id = id, reason = ?error, "Session ended");
                let status = error
                    .clone()
                    .map_or(TransferStatus::Disconnected, TransferStatus::Failed);
                self.published.set(LinkState::Disconnected, status);
                self.published.emit(ManagerEvent::Disconnected {
                    session_id: id,
                    reason: error,
                });
            }
        }
    }

    /// Releases the listener, abandons any connect attempt and closes the
    /// session.
    async fn teardown(&mut self) {
        if let Some(listener) = self.listener.take() {
            info!(addr = %listener.local_addr(), "Listener released");
        }

        if let Some((attempt, task)) = self.connecting.take() {
            task.abort();
            debug!(attempt = attempt, "Connect attempt aborted");
        }

        if let Some(mut session) = self.session.take() {
            let _ = session.cmd_tx.try_send(SessionCmd::Close);
            if tokio::time::timeout(CLOSE_GRACE, &mut session.task)
                .await
                .is_err()
            {
                warn!(session_id = session.id, "Session did not close in time, aborting");
                session.task.abort();
            }
            info!(session_id = session.id, "Session closed");
            self.published.emit(ManagerEvent::Disconnected {
                session_id: session.id,
                reason: None,
            });
        }
    }
}

async fn accept_next<L: Listener>(listener: &mut Option<L>) -> anyhow::Result<L::Conn> {
    match listener.as_mut() {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
