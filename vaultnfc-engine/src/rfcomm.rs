//! In-process Bluetooth RFCOMM medium.
//!
//! Devices attach to a shared [`RfcommMedium`] under a hardware address.
//! Listening registers a service record keyed by (address, service UUID);
//! connecting succeeds only if the target device has a record for the same
//! UUID, which is the only thing RFCOMM lookup checks.  Each device handle
//! also acts as the local Bluetooth [`Radio`] for discovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, anyhow, bail, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use vaultnfc_core::SERVICE_UUID;
use vaultnfc_core::record::PeerDescriptor;
use vaultnfc_core::transport::{
    Connection, Connector, Listener, ListenerFactory, Radio, RadioState, ScanEvent,
};

/// Socket buffer size for each direction of an RFCOMM channel.
const CHANNEL_BUFFER: usize = 8 * 1024;

type Incoming = (String, DuplexStream);

struct ServiceRecord {
    registration: u64,
    incoming: mpsc::Sender<Incoming>,
}

struct Device {
    name: Option<String>,
    state: RadioState,
}

#[derive(Default)]
struct MediumState {
    devices: HashMap<String, Device>,
    services: HashMap<(String, Uuid), ServiceRecord>,
    next_registration: u64,
}

/// Shared air space that every attached device can see.
#[derive(Clone, Default)]
pub struct RfcommMedium {
    inner: Arc<Mutex<MediumState>>,
}

impl RfcommMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, MediumState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("RFCOMM medium lock poisoned"))
    }

    /// Attaches a device with an enabled adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if a device with the same address is already attached.
    pub fn attach(&self, address: &str, name: Option<&str>) -> anyhow::Result<RfcommDevice> {
        let mut state = self.lock()?;
        ensure!(
            !state.devices.contains_key(address),
            "device {address} is already attached"
        );
        state.devices.insert(
            address.to_owned(),
            Device {
                name: name.map(str::to_owned),
                state: RadioState::Enabled,
            },
        );
        debug!(address = %address, "Bluetooth device attached");
        Ok(RfcommDevice {
            medium: self.clone(),
            address: address.to_owned(),
            service: SERVICE_UUID,
        })
    }

    /// Changes a device's adapter state.  Disabling an adapter drops its
    /// service records.
    ///
    /// # Errors
    ///
    /// Returns an error if no device with `address` is attached.
    pub fn set_state(&self, address: &str, radio: RadioState) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        let device = state
            .devices
            .get_mut(address)
            .with_context(|| format!("unknown device {address}"))?;
        device.state = radio;
        if radio != RadioState::Enabled {
            state.services.retain(|(addr, _), _| addr != address);
        }
        info!(address = %address, state = ?radio, "Bluetooth adapter state changed");
        Ok(())
    }

    fn device_state(&self, address: &str) -> RadioState {
        self.lock()
            .ok()
            .and_then(|s| s.devices.get(address).map(|d| d.state))
            .unwrap_or(RadioState::Disabled)
    }

    fn ensure_enabled(&self, address: &str) -> anyhow::Result<()> {
        match self.device_state(address) {
            RadioState::Enabled => Ok(()),
            RadioState::Disabled => bail!("bluetooth adapter {address} is disabled"),
            RadioState::PermissionDenied => bail!("bluetooth permission denied for {address}"),
        }
    }
}

/// One device on the medium: listener factory, connector and radio.
///
/// Connections use this device's `service` UUID; it defaults to
/// [`SERVICE_UUID`].
#[derive(Clone)]
pub struct RfcommDevice {
    medium: RfcommMedium,
    address: String,
    service: Uuid,
}

impl RfcommDevice {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns a handle that listens and connects with another service UUID.
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.service = service;
        self
    }
}

/// One end of an RFCOMM channel.
pub struct RfcommSocket {
    stream: DuplexStream,
    peer_addr: String,
}

impl Connection for RfcommSocket {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from RFCOMM socket")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to RFCOMM socket")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down RFCOMM socket")
        }
    }
}

/// A registered RFCOMM service record.  Dropping it unregisters the record.
pub struct RfcommListener {
    medium: RfcommMedium,
    key: (String, Uuid),
    registration: u64,
    incoming: mpsc::Receiver<Incoming>,
}

impl Listener for RfcommListener {
    type Conn = RfcommSocket;

    fn local_addr(&self) -> String {
        format!("{}/{}", self.key.0, self.key.1)
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (peer_addr, stream) = self
                .incoming
                .recv()
                .await
                .context("RFCOMM service record was removed")?;
            debug!(peer = %peer_addr, "Accepted RFCOMM connection");
            Ok(RfcommSocket { stream, peer_addr })
        }
    }
}

impl Drop for RfcommListener {
    fn drop(&mut self) {
        if let Ok(mut state) = self.medium.lock() {
            let ours = state
                .services
                .get(&self.key)
                .is_some_and(|r| r.registration == self.registration);
            if ours {
                state.services.remove(&self.key);
                debug!(service = %self.key.1, "RFCOMM service record removed");
            }
        }
    }
}

impl ListenerFactory for RfcommDevice {
    type L = RfcommListener;

    /// Registers a service record.  `addr` is the service UUID to listen
    /// on; an empty string uses this device's service.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            self.medium.ensure_enabled(&self.address)?;
            let service = if addr.is_empty() {
                self.service
            } else {
                Uuid::parse_str(addr).with_context(|| format!("invalid service UUID {addr}"))?
            };

            let key = (self.address.clone(), service);
            let (tx, rx) = mpsc::channel(1);
            let mut state = self.medium.lock()?;
            ensure!(
                !state.services.contains_key(&key),
                "service {service} is already registered on {}",
                self.address
            );
            state.next_registration += 1;
            let registration = state.next_registration;
            state.services.insert(
                key.clone(),
                ServiceRecord {
                    registration,
                    incoming: tx,
                },
            );
            drop(state);

            info!(address = %self.address, service = %service, "RFCOMM service registered");
            Ok(RfcommListener {
                medium: self.medium.clone(),
                key,
                registration,
                incoming: rx,
            })
        }
    }
}

impl Connector for RfcommDevice {
    type Conn = RfcommSocket;

    /// Connects to the device whose hardware address is `endpoint`.
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            self.medium.ensure_enabled(&self.address)?;
            let incoming = {
                let state = self.medium.lock()?;
                state
                    .services
                    .get(&(endpoint.to_owned(), self.service))
                    .map(|r| r.incoming.clone())
                    .with_context(|| {
                        format!("no RFCOMM service {} on {endpoint}", self.service)
                    })?
            };

            let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
            incoming
                .send((self.address.clone(), remote))
                .await
                .map_err(|_| anyhow!("RFCOMM service on {endpoint} stopped accepting"))?;

            info!(peer = %endpoint, "RFCOMM connection established");
            Ok(RfcommSocket {
                stream: local,
                peer_addr: endpoint.to_owned(),
            })
        }
    }
}

impl Radio for RfcommDevice {
    fn state(&self) -> RadioState {
        self.medium.device_state(&self.address)
    }

    /// Reports every other enabled device advertising `service`, then
    /// signals completion.
    fn scan<'a>(
        &'a self,
        service: Uuid,
    ) -> impl Future<Output = anyhow::Result<mpsc::Receiver<ScanEvent>>> + Send + 'a {
        async move {
            self.medium.ensure_enabled(&self.address)?;
            let found: Vec<PeerDescriptor> = {
                let state = self.medium.lock()?;
                let mut found: Vec<PeerDescriptor> = state
                    .services
                    .keys()
                    .filter(|(addr, uuid)| *uuid == service && *addr != self.address)
                    .map(|(addr, _)| PeerDescriptor {
                        name: state.devices.get(addr).and_then(|d| d.name.clone()),
                        address: addr.clone(),
                        endpoint: addr.clone(),
                    })
                    .collect();
                found.sort_by(|a, b| a.address.cmp(&b.address));
                found
            };

            let (tx, rx) = mpsc::channel(found.len() + 1);
            for peer in found {
                let _ = tx.try_send(ScanEvent::Found(peer));
            }
            let _ = tx.try_send(ScanEvent::Finished);
            Ok(rx)
        }
    }
}
