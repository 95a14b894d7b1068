use tokio::sync::{broadcast, mpsc};

use vaultnfc_core::record::CredentialRecord;
use vaultnfc_core::share::review_incoming;
use vaultnfc_engine::discovery::DiscoveryEvent;
use vaultnfc_engine::manager::ManagerEvent;

use crate::ui::{print_peer, print_prompt};

/// Received credential waiting for the user to keep or discard it.
pub struct PendingCredential {
    pub session_id: u64,
    pub record: CredentialRecord,
}

/// Spawns a task that listens for manager events and prints them.
///
/// When a payload decodes into a record it is pushed into `pending_tx` so
/// the main prompt loop can ask the user.
pub fn spawn_event_printer(
    mut events_rx: broadcast::Receiver<ManagerEvent>,
    pending_tx: mpsc::UnboundedSender<PendingCredential>,
) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => handle_manager_event(event, &pending_tx),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn handle_manager_event(
    event: ManagerEvent,
    pending_tx: &mpsc::UnboundedSender<PendingCredential>,
) {
    match event {
        ManagerEvent::Listening { addr } => {
            println!("\n  ✔ Waiting for a credential on {addr}");
            print_prompt();
        }
        ManagerEvent::Connected { session_id, peer } => {
            println!("\n  📡 Session #{session_id}: connected to {peer}");
            print_prompt();
        }
        ManagerEvent::PayloadReceived {
            session_id,
            payload,
        } => match review_incoming(&payload) {
            Ok(record) => {
                println!();
                println!("  📥 Session #{session_id}: credential received!");
                println!("     Title: {}  User: {}", record.title, record.username);
                println!("     Type 'keep' or 'discard' to respond.");
                let _ = pending_tx.send(PendingCredential { session_id, record });
                print_prompt();
            }
            Err(e) => {
                println!("\n  ❌ Session #{session_id}: unreadable credential ({e})");
                print_prompt();
            }
        },
        ManagerEvent::Disconnected { session_id, reason } => {
            match reason {
                Some(e) => println!("\n  👋 Session #{session_id}: ended ({e})"),
                None => println!("\n  👋 Session #{session_id}: disconnected"),
            }
            print_prompt();
        }
        ManagerEvent::StatusChanged(status) if status.is_failed() => {
            println!("\n  ❌ {status}");
            print_prompt();
        }
        // Raw chunks and routine status moves are left to the tracing log.
        ManagerEvent::StatusChanged(_) | ManagerEvent::Chunk { .. } => {}
    }
}

/// Spawns a task that prints discovery progress.
pub fn spawn_discovery_printer(mut events_rx: broadcast::Receiver<DiscoveryEvent>) {
    tokio::spawn(async move {
        let mut found = 0usize;
        loop {
            match events_rx.recv().await {
                Ok(DiscoveryEvent::Started) => {
                    found = 0;
                    println!("\n  🔎 Searching for peers...");
                }
                Ok(DiscoveryEvent::PeerFound(peer)) => {
                    found += 1;
                    print_peer(found, &peer);
                }
                Ok(DiscoveryEvent::Finished) => {
                    println!("  🔎 Search finished, {found} peer(s) found");
                    print_prompt();
                }
                Ok(DiscoveryEvent::Failed(e)) => {
                    println!("\n  ❌ Cannot search for peers: {e}");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} discovery events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
