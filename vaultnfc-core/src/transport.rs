use std::future::Future;

use tokio::sync::mpsc;

use crate::record::PeerDescriptor;

/// A transport-agnostic byte-stream connection.
///
/// Provides identity (`peer`) and byte-level I/O (`read`, `write_all`,
/// `shutdown`) so the connection manager can drive a session without knowing
/// whether it is talking over a Wi-Fi Direct TCP socket, an RFCOMM channel or
/// an in-memory pipe.
pub trait Connection: Send + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"192.168.49.1:8988"` or `"AA:BB:CC:DD:EE:FF"`).
    fn peer(&self) -> String;

    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the connection.  The
    /// returned future must be cancel-safe: the session drops it when a write
    /// or close command arrives first.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the connection.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the connection, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// An async listener that accepts incoming [`Connection`]s.
///
/// Dropping the listener must release the underlying socket or service
/// registration.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to.
    fn local_addr(&self) -> String;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage lets the manager remain generic: pass a
/// TCP factory for Wi-Fi Direct, the RFCOMM medium for Bluetooth, or a fake
/// in tests.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (initiator side).
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to a peer's
    /// [`endpoint`](PeerDescriptor::endpoint).
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}

/// Availability of the local radio as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Enabled,
    Disabled,
    PermissionDenied,
}

/// One item produced by a running [`Radio::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A device advertising the requested service was seen.  The same device
    /// may be reported more than once.
    Found(PeerDescriptor),
    /// The platform signalled that the scan has completed.
    Finished,
}

/// The local radio adapter used for peer discovery.
///
/// The adapter handle is shared read-only; every scan gets its own event
/// channel.  Dropping the receiver must stop the platform scan.
pub trait Radio: Send + Sync + 'static {
    fn state(&self) -> RadioState;

    /// Starts a platform scan for devices advertising `service`.
    fn scan<'a>(
        &'a self,
        service: uuid::Uuid,
    ) -> impl Future<Output = anyhow::Result<mpsc::Receiver<ScanEvent>>> + Send + 'a;
}
