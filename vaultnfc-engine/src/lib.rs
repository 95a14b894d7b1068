//! # vaultnfc-engine
//!
//! Runtime logic for VaultNFC credential transfer, embedded into the CLI.
//!
//! This crate provides:
//! - **Connection manager**: a state machine that accepts or initiates one
//!   session at a time over any transport (`Connection` trait)
//! - **Transport session**: the single read loop and framed writes for a live
//!   connection
//! - **Discovery controller**: time-bounded, cancellable, de-duplicated peer
//!   scans over any `Radio`
//! - **Transport implementations**: TCP for Wi-Fi Direct, UDP broadcast
//!   discovery for the LAN, and an in-process RFCOMM medium
//! - **Event bus**: status, received chunks and payloads for CLI or UI
//!   subscribers

pub mod discovery;
pub mod lan;
pub mod manager;
pub mod rfcomm;
mod session;
pub mod tcp;
