//! Broadcast-based peer discovery for the Wi-Fi Direct transport.
//!
//! A scanning device broadcasts a small JSON probe naming the service UUID.
//! Every [`LanAdvertiser`] for that service answers with a beacon carrying
//! its display name and the TCP port it accepts transfers on.  The beacon's
//! source IP plus that port becomes the peer's endpoint.
//!
//! A probe carries the scanning process's instance id, and an advertiser
//! stays silent for probes from its own instance, so a device never lists
//! itself even when the broadcast loops back.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultnfc_core::record::PeerDescriptor;
use vaultnfc_core::transport::{Radio, RadioState, ScanEvent};

/// Largest datagram either side sends.
const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Probe {
    service: Uuid,
    instance: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service: Uuid,
    name: Option<String>,
    port: u16,
}

/// Answers discovery probes until dropped.
pub struct LanAdvertiser {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LanAdvertiser {
    /// Binds the probe socket on `bind_addr` and starts answering probes for
    /// `service` with `name` and `transfer_port`.  Probes sent by `instance`
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the UDP socket cannot be bound.
    pub async fn spawn(
        bind_addr: &str,
        service: Uuid,
        instance: Uuid,
        name: Option<String>,
        transfer_port: u16,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind discovery socket on {bind_addr}"))?;
        let local_addr = socket
            .local_addr()
            .context("failed to retrieve local address")?;
        let beacon = serde_json::to_vec(&Beacon {
            service,
            name,
            port: transfer_port,
        })
        .context("failed to encode beacon")?;

        info!(addr = %local_addr, port = transfer_port, "Answering discovery probes");

        let cancel = CancellationToken::new();
        let own = Probe { service, instance };
        let task = tokio::spawn(answer_probes(socket, own, beacon, cancel.clone()));
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LanAdvertiser {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn answer_probes(
    socket: UdpSocket,
    own: Probe,
    beacon: Vec<u8>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, from)) => {
                    let Ok(probe) = serde_json::from_slice::<Probe>(&buf[..n]) else {
                        debug!(from = %from, "Ignoring malformed probe");
                        continue;
                    };
                    if probe.service != own.service {
                        continue;
                    }
                    if probe.instance == own.instance {
                        debug!(from = %from, "Ignoring our own probe");
                        continue;
                    }
                    if let Err(e) = socket.send_to(&beacon, from).await {
                        warn!(to = %from, error = %e, "Failed to answer probe");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Discovery socket error, advertiser stopped");
                    break;
                }
            }
        }
    }
    debug!("Advertiser stopped");
}

/// Scans the local network by broadcasting a probe and collecting beacons
/// for `window`.
pub struct LanRadio {
    probe_target: SocketAddr,
    window: Duration,
    instance: Uuid,
}

impl LanRadio {
    /// `instance` must match the local [`LanAdvertiser`]'s so this device
    /// is left out of its own scans.
    pub fn new(probe_target: SocketAddr, window: Duration, instance: Uuid) -> Self {
        Self {
            probe_target,
            window,
            instance,
        }
    }

    /// Probes the limited broadcast address on `port`, normally
    /// [`LAN_DISCOVERY_PORT`](vaultnfc_core::LAN_DISCOVERY_PORT).
    pub fn broadcast(port: u16, window: Duration, instance: Uuid) -> Self {
        Self::new(
            SocketAddr::from(([255, 255, 255, 255], port)),
            window,
            instance,
        )
    }
}

impl Radio for LanRadio {
    /// The platform offers no separate adapter state for sockets; a
    /// missing interface surfaces as a scan error instead.
    fn state(&self) -> RadioState {
        RadioState::Enabled
    }

    fn scan<'a>(
        &'a self,
        service: Uuid,
    ) -> impl Future<Output = anyhow::Result<mpsc::Receiver<ScanEvent>>> + Send + 'a {
        async move {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .context("failed to bind discovery socket")?;
            socket
                .set_broadcast(true)
                .context("failed to enable broadcast")?;
            let probe = serde_json::to_vec(&Probe {
                service,
                instance: self.instance,
            })
            .context("failed to encode probe")?;
            socket
                .send_to(&probe, self.probe_target)
                .await
                .with_context(|| format!("failed to send probe to {}", self.probe_target))?;
            debug!(target = %self.probe_target, "Discovery probe sent");

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(collect_beacons(socket, service, self.window, tx));
            Ok(rx)
        }
    }
}

async fn collect_beacons(
    socket: UdpSocket,
    service: Uuid,
    window: Duration,
    tx: mpsc::Sender<ScanEvent>,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            () = &mut deadline => break,
            () = tx.closed() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, from)) => {
                    let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) else {
                        debug!(from = %from, "Ignoring malformed beacon");
                        continue;
                    };
                    if beacon.service != service {
                        continue;
                    }
                    let endpoint = SocketAddr::new(from.ip(), beacon.port).to_string();
                    let peer = PeerDescriptor {
                        name: beacon.name,
                        address: endpoint.clone(),
                        endpoint,
                    };
                    if tx.send(ScanEvent::Found(peer)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Discovery socket error, ending scan");
                    break;
                }
            }
        }
    }
    let _ = tx.send(ScanEvent::Finished).await;
}
