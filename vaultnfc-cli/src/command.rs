use tokio::io::BufReader;

use vaultnfc_core::record::{CredentialRecord, PeerDescriptor};
use vaultnfc_core::share::{accept_incoming, prepare_outgoing};
use vaultnfc_core::transport::Radio;
use vaultnfc_core::vault::{Cipher, CredentialStore, PassThroughCipher};
use vaultnfc_engine::discovery::DiscoveryController;
use vaultnfc_engine::manager::ManagerHandle;

use crate::event::PendingCredential;
use crate::ui::{parse_index, print_peer, print_record, read_line};

/// Handles the `peers` command.
pub fn handle_peers_cmd<R: Radio>(discovery: &DiscoveryController<R>) {
    let peers = discovery.peers();
    if peers.is_empty() {
        println!("  No peers found yet.  Type 'discover' to search.");
        return;
    }
    for (i, peer) in peers.iter().enumerate() {
        print_peer(i + 1, peer);
    }
}

/// Handles the `connect <n | addr>` command.
///
/// A number picks a peer from the last search; anything else is used as the
/// transport endpoint directly.
pub async fn handle_connect_cmd<R: Radio>(
    parts: &[&str],
    handle: &ManagerHandle,
    discovery: &DiscoveryController<R>,
) {
    let Some(&target) = parts.get(1) else {
        println!("  Usage: connect <n | addr>");
        println!("  Example: connect 1    or    connect 192.168.49.1:8988");
        return;
    };

    let peers = discovery.peers();
    let peer = match parse_index(target, peers.len()) {
        Some(i) => peers[i].clone(),
        None if target.parse::<usize>().is_ok() => {
            println!("  ❌ No peer #{target}.  Type 'peers' to list them.");
            return;
        }
        None => PeerDescriptor {
            name: None,
            address: target.to_string(),
            endpoint: target.to_string(),
        },
    };

    // A running search would compete with the connection for the radio.
    discovery.stop_discovery().await;

    println!("  📤 Connecting to {}...", peer.display_name());
    if let Err(e) = handle.connect_to_peer(peer).await {
        println!("  ❌ {e}");
    }
}

/// Handles the `receive` command.
pub async fn handle_receive_cmd(handle: &ManagerHandle) {
    match handle.start_server().await {
        Ok(addr) => println!("  Share this address with the sender: {addr}"),
        Err(e) => println!("  ❌ Cannot wait for a peer: {e}"),
    }
}

/// Handles the `add <title> <user> <pass> [uri]` command.
pub async fn handle_add_cmd<S: CredentialStore>(parts: &[&str], store: &S) {
    if parts.len() < 4 {
        println!("  Usage: add <title> <username> <password> [uri]");
        return;
    }

    let sealed = match PassThroughCipher.encrypt(parts[3]) {
        Ok(sealed) => sealed,
        Err(e) => {
            println!("  ❌ Cannot encrypt password: {e:#}");
            return;
        }
    };
    let mut record = CredentialRecord::new(parts[1], parts[2], sealed.ciphertext, sealed.iv);
    if let Some(uri) = parts.get(4) {
        record = record.with_uri(*uri);
    }

    match store.save(record).await {
        Ok(id) => println!("  ✅ Stored \"{}\" ({id})", parts[1]),
        Err(e) => println!("  ❌ {e:#}"),
    }
}

/// Handles the `list` command.
pub async fn handle_list_cmd<S: CredentialStore>(store: &S) {
    match store.list().await {
        Ok(records) if records.is_empty() => println!("  The vault is empty."),
        Ok(records) => {
            for (i, record) in records.iter().enumerate() {
                print_record(i + 1, record);
            }
        }
        Err(e) => println!("  ❌ {e:#}"),
    }
}

/// Handles the `delete <n>` command.
pub async fn handle_delete_cmd<S: CredentialStore>(parts: &[&str], store: &S) {
    let Some(&arg) = parts.get(1) else {
        println!("  Usage: delete <n>    (see 'list')");
        return;
    };

    let records = match store.list().await {
        Ok(records) => records,
        Err(e) => {
            println!("  ❌ {e:#}");
            return;
        }
    };
    let Some(i) = parse_index(arg, records.len()) else {
        println!("  ❌ No credential #{arg}.  Type 'list' to see them.");
        return;
    };

    match store.delete(&records[i].id).await {
        Ok(()) => println!("  🗑 Removed \"{}\"", records[i].title),
        Err(e) => println!("  ❌ {e:#}"),
    }
}

/// Handles the `send <n>` command.
pub async fn handle_send_cmd<S: CredentialStore>(
    parts: &[&str],
    handle: &ManagerHandle,
    store: &S,
) {
    let Some(&arg) = parts.get(1) else {
        println!("  Usage: send <n>    (see 'list')");
        return;
    };

    let records = match store.list().await {
        Ok(records) => records,
        Err(e) => {
            println!("  ❌ {e:#}");
            return;
        }
    };
    let Some(i) = parse_index(arg, records.len()) else {
        println!("  ❌ No credential #{arg}.  Type 'list' to see them.");
        return;
    };
    let record = &records[i];

    let payload = match prepare_outgoing(record) {
        Ok(payload) => payload,
        Err(e) => {
            println!("  ❌ {e}");
            return;
        }
    };
    match handle.send(payload).await {
        Ok(()) => println!("  ✅ Sent \"{}\"", record.title),
        Err(e) => println!("  ❌ Send failed: {e}"),
    }
}

/// Asks the user whether to keep a received credential.
pub async fn handle_pending_credential<S: CredentialStore>(
    pending: PendingCredential,
    store: &S,
    stdin: &mut BufReader<tokio::io::Stdin>,
) {
    println!();
    println!(
        "  📥 Keep \"{title}\" ({user}) from session #{sid}?",
        title = pending.record.title,
        user = pending.record.username,
        sid = pending.session_id,
    );
    println!("     Type 'keep' or 'discard':");

    loop {
        print!("  [keep/discard] > ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let Some(answer) = read_line(stdin).await else {
            return;
        };

        match answer.to_lowercase().as_str() {
            "keep" | "k" | "yes" | "y" => {
                match accept_incoming(store, pending.record).await {
                    Ok(id) => println!("  ✅ Saved to the vault ({id})"),
                    Err(e) => println!("  ❌ {e:#}"),
                }
                return;
            }
            "discard" | "d" | "no" | "n" => {
                println!("  🚫 Discarded.");
                return;
            }
            _ => {
                println!("  Please type 'keep' or 'discard'.");
            }
        }
    }
}
