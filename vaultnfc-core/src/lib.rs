//! # vaultnfc-core
//!
//! Shared building blocks for VaultNFC peer credential transfer.
//!
//! This crate provides the types and utilities used by [`vaultnfc-engine`]
//! and the CLI.
//!
//! ## Responsibilities
//!
//! - **Data model**: [`CredentialRecord`](record::CredentialRecord),
//!   [`PeerDescriptor`](record::PeerDescriptor) and the user-facing
//!   [`TransferStatus`](status::TransferStatus).
//!
//! - **Payload codec**: JSON encoding of a single record plus the
//!   length-prefixed frame (magic / version / length) written on the wire.
//!
//! - **Transport seams**: connection, listener, connector and radio traits
//!   implemented by the engine's TCP and RFCOMM transports.
//!
//! - **Vault collaborators**: credential store and cipher traits with the
//!   in-memory, file-backed and pass-through implementations.

pub mod codec;
pub mod error;
pub mod record;
pub mod share;
pub mod status;
pub mod transport;
pub mod vault;

use uuid::Uuid;

/// Service identifier registered for RFCOMM and carried in LAN discovery
/// beacons.  Any service using the same UUID is indistinguishable from a
/// VaultNFC peer.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x8ce2_55c0_223a_11e0_ac64_0803_450c_9a66);

/// TCP port the Wi-Fi Direct group owner listens on.
pub const WIFI_DIRECT_PORT: u16 = 8988;

/// UDP port used for LAN discovery probes and beacons.
pub const LAN_DISCOVERY_PORT: u16 = 8989;
