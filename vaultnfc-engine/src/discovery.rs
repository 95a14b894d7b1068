use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultnfc_core::SERVICE_UUID;
use vaultnfc_core::error::TransferError;
use vaultnfc_core::record::PeerDescriptor;
use vaultnfc_core::status::TransferStatus;
use vaultnfc_core::transport::{Radio, RadioState, ScanEvent};

/// Events emitted by the [`DiscoveryController`], in discovery order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started,
    /// A device not seen earlier in this scan.
    PeerFound(PeerDescriptor),
    /// The scan ended: completed, timed out or stopped.
    Finished,
    /// The scan could not start.
    Failed(TransferError),
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Service UUID peers must advertise.
    pub service: Uuid,
    /// Upper bound on one scan.
    pub scan_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            scan_window: Duration::from_secs(12),
        }
    }
}

struct ActiveScan {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Finds peers through a [`Radio`].
///
/// The discovered-peer list only grows during a scan and is cleared when a
/// new scan starts.  Only the scan task appends to it.
pub struct DiscoveryController<R: Radio> {
    radio: Arc<R>,
    config: DiscoveryConfig,
    status_tx: watch::Sender<TransferStatus>,
    peers_tx: watch::Sender<Vec<PeerDescriptor>>,
    events_tx: broadcast::Sender<DiscoveryEvent>,
    active: Mutex<Option<ActiveScan>>,
}

impl<R: Radio> DiscoveryController<R> {
    pub fn new(radio: R, config: DiscoveryConfig) -> Self {
        let (status_tx, _) = watch::channel(TransferStatus::Idle);
        let (peers_tx, _) = watch::channel(Vec::new());
        let (events_tx, _) = broadcast::channel(64);
        Self {
            radio: Arc::new(radio),
            config,
            status_tx,
            peers_tx,
            events_tx,
            active: Mutex::new(None),
        }
    }

    /// Starts a new scan, stopping any scan already running.
    ///
    /// Radio problems are reported as [`TransferStatus::Failed`] and a
    /// [`DiscoveryEvent::Failed`]; nothing is returned to the caller.
    pub async fn start_discovery(&self) {
        let mut active = self.active.lock().await;
        stop_scan(active.take()).await;
        self.peers_tx.send_replace(Vec::new());

        let refusal = match self.radio.state() {
            RadioState::Enabled => None,
            RadioState::Disabled => Some(TransferError::RadioDisabled),
            RadioState::PermissionDenied => Some(TransferError::PermissionDenied),
        };
        if let Some(err) = refusal {
            self.fail(err);
            return;
        }

        let scan = match self.radio.scan(self.config.service).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Failed to start discovery");
                self.fail(TransferError::DiscoveryFailed(format!("{e:#}")));
                return;
            }
        };

        info!(
            service = %self.config.service,
            window = ?self.config.scan_window,
            "Discovery started"
        );
        self.status_tx.send_replace(TransferStatus::Discovering);
        let _ = self.events_tx.send(DiscoveryEvent::Started);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_scan(
            scan,
            self.config.scan_window,
            cancel.clone(),
            self.status_tx.clone(),
            self.peers_tx.clone(),
            self.events_tx.clone(),
        ));
        *active = Some(ActiveScan { cancel, task });
    }

    /// Stops the running scan, if any.  Idempotent.
    pub async fn stop_discovery(&self) {
        let mut active = self.active.lock().await;
        stop_scan(active.take()).await;
    }

    /// Peers found by the current (or last) scan, in discovery order.
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers_tx.borrow().clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<PeerDescriptor>> {
        self.peers_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<TransferStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events_tx.subscribe()
    }

    /// Waits until no scan is running and returns the peers it found.
    pub async fn wait_until_idle(&self) -> Vec<PeerDescriptor> {
        let mut status = self.status_tx.subscribe();
        let _ = status
            .wait_for(|s| *s != TransferStatus::Discovering)
            .await;
        self.peers()
    }

    fn fail(&self, err: TransferError) {
        warn!(error = %err, "Discovery unavailable");
        self.status_tx.send_replace(TransferStatus::Failed(err.clone()));
        let _ = self.events_tx.send(DiscoveryEvent::Failed(err));
    }
}

async fn stop_scan(scan: Option<ActiveScan>) {
    if let Some(scan) = scan {
        scan.cancel.cancel();
        if let Err(e) = scan.task.await {
            debug!(error = %e, "Discovery task ended abnormally");
        }
    }
}

async fn run_scan(
    mut scan: mpsc::Receiver<ScanEvent>,
    window: Duration,
    cancel: CancellationToken,
    status_tx: watch::Sender<TransferStatus>,
    peers_tx: watch::Sender<Vec<PeerDescriptor>>,
    events_tx: broadcast::Sender<DiscoveryEvent>,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Discovery stopped by caller");
                break;
            }
            () = &mut deadline => {
                debug!("Discovery window elapsed");
                break;
            }
            event = scan.recv() => match event {
                Some(ScanEvent::Found(peer)) => {
                    let added = peers_tx.send_if_modified(|peers| {
                        if peers.iter().any(|p| p.address == peer.address) {
                            false
                        } else {
                            peers.push(peer.clone());
                            true
                        }
                    });
                    if added {
                        info!(peer = %peer.display_name(), address = %peer.address, "Peer found");
                        let _ = events_tx.send(DiscoveryEvent::PeerFound(peer));
                    }
                }
                Some(ScanEvent::Finished) | None => {
                    debug!("Radio reported discovery finished");
                    break;
                }
            }
        }
    }

    // Dropping `scan` stops the platform scan.
    drop(scan);
    let _ = events_tx.send(DiscoveryEvent::Finished);
    status_tx.send_replace(TransferStatus::Idle);
    info!(found = peers_tx.borrow().len(), "Discovery finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfcomm::RfcommMedium;

    /// Radio whose scan reports the given events and then stays open.
    struct ScriptedRadio {
        events: Vec<ScanEvent>,
    }

    impl Radio for ScriptedRadio {
        fn state(&self) -> RadioState {
            RadioState::Enabled
        }

        async fn scan<'a>(&'a self, _service: Uuid) -> anyhow::Result<mpsc::Receiver<ScanEvent>> {
            let (tx, rx) = mpsc::channel(self.events.len() + 1);
            for ev in &self.events {
                tx.try_send(ev.clone()).unwrap();
            }
            // Keep the sender alive so the scan only ends by timeout or stop.
            tokio::spawn(async move {
                tx.closed().await;
            });
            Ok(rx)
        }
    }

    fn peer(address: &str, name: &str) -> PeerDescriptor {
        PeerDescriptor {
            name: Some(name.into()),
            address: address.into(),
            endpoint: address.into(),
        }
    }

    fn short_window() -> DiscoveryConfig {
        DiscoveryConfig {
            scan_window: Duration::from_millis(200),
            ..DiscoveryConfig::default()
        }
    }

    /// Given a disabled radio, when discovery starts, then it reports the radio is disabled.
    #[tokio::test]
    async fn given_disabled_radio_when_discovery_started_then_reports_radio_disabled() {
        let medium = RfcommMedium::new();
        let device = medium.attach("AA:00:00:00:00:01", None).unwrap();
        medium
            .set_state(device.address(), RadioState::Disabled)
            .unwrap();

        let discovery = DiscoveryController::new(device, short_window());
        let mut events = discovery.subscribe();
        discovery.start_discovery().await;

        assert_eq!(
            discovery.status(),
            TransferStatus::Failed(TransferError::RadioDisabled)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Failed(TransferError::RadioDisabled)
        );
        // Nothing is left running, so waiting returns at once.
        let peers = tokio::time::timeout(Duration::from_secs(1), discovery.wait_until_idle())
            .await
            .unwrap();
        assert!(peers.is_empty());
    }

    /// Given no radio permission, when discovery starts, then it reports permission denied.
    #[tokio::test]
    async fn given_permission_denied_when_discovery_started_then_reports_permission_denied() {
        let medium = RfcommMedium::new();
        let device = medium.attach("AA:00:00:00:00:01", None).unwrap();
        medium
            .set_state(device.address(), RadioState::PermissionDenied)
            .unwrap();

        let discovery = DiscoveryController::new(device, short_window());
        discovery.start_discovery().await;
        assert_eq!(
            discovery.status(),
            TransferStatus::Failed(TransferError::PermissionDenied)
        );
    }

    /// Given repeated sightings of a peer, when scanning, then each peer is listed once in order.
    #[tokio::test]
    async fn given_duplicate_sightings_when_scanning_then_peers_deduplicated_in_order() {
        let radio = ScriptedRadio {
            events: vec![
                ScanEvent::Found(peer("02", "Second")),
                ScanEvent::Found(peer("01", "First")),
                ScanEvent::Found(peer("02", "Second again")),
            ],
        };
        let discovery = DiscoveryController::new(radio, short_window());
        let mut events = discovery.subscribe();
        discovery.start_discovery().await;

        let peers = discovery.wait_until_idle().await;
        let addresses: Vec<_> = peers.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addresses, ["02", "01"]);
        assert_eq!(peers[0].display_name(), "Second");
        assert_eq!(discovery.status(), TransferStatus::Idle);

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            [
                DiscoveryEvent::Started,
                DiscoveryEvent::PeerFound(peer("02", "Second")),
                DiscoveryEvent::PeerFound(peer("01", "First")),
                DiscoveryEvent::Finished,
            ]
        );
    }

    /// Given a running scan, when stopped twice, then discovery is idle both times.
    #[tokio::test]
    async fn given_running_scan_when_stopped_then_idle_and_stop_is_idempotent() {
        let radio = ScriptedRadio { events: Vec::new() };
        let discovery = DiscoveryController::new(
            radio,
            DiscoveryConfig {
                scan_window: Duration::from_secs(60),
                ..DiscoveryConfig::default()
            },
        );
        discovery.start_discovery().await;
        assert_eq!(discovery.status(), TransferStatus::Discovering);

        tokio::time::timeout(Duration::from_secs(1), discovery.stop_discovery())
            .await
            .expect("stop must not wait for the scan window");
        assert_eq!(discovery.status(), TransferStatus::Idle);

        discovery.stop_discovery().await;
        discovery.stop_discovery().await;
        assert_eq!(discovery.status(), TransferStatus::Idle);
    }

    /// Given results from an earlier scan, when restarted, then the list starts empty.
    #[tokio::test]
    async fn given_previous_results_when_restarted_then_list_starts_empty() {
        let medium = RfcommMedium::new();
        let phone = medium.attach("AA:00:00:00:00:01", Some("Phone")).unwrap();
        let tablet = medium.attach("BB:00:00:00:00:02", None).unwrap();
        let listener = vaultnfc_core::transport::ListenerFactory::bind(&phone, "")
            .await
            .unwrap();

        let discovery = DiscoveryController::new(tablet, short_window());
        discovery.start_discovery().await;
        assert_eq!(discovery.wait_until_idle().await.len(), 1);

        drop(listener);
        discovery.start_discovery().await;
        assert!(discovery.wait_until_idle().await.is_empty());
    }
}
