use std::io::Write;
use std::path::Path;

use vaultnfc_core::record::{CredentialRecord, PeerDescriptor};

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with device info.
pub fn print_banner(listen_addr: &str, device_name: &str, vault: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                 🔐  VaultNFC  CLI  🔐                ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Device  : {device_name:<41} ║");
    println!("║  Listen  : {listen_addr:<41} ║");
    println!("║  Vault   : {:<41} ║", vault.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    discover                         Search for nearby peers");
    println!("    peers                            Show peers from the last search");
    println!("    connect <n | addr>               Connect to peer n or an address");
    println!("    receive                          Wait for a peer to send a credential");
    println!("    add <title> <user> <pass> [uri]  Store a credential in the vault");
    println!("    list                             Show stored credentials");
    println!("    delete <n>                       Remove stored credential n");
    println!("    send <n>                         Send stored credential n to the peer");
    println!("    disconnect                       Close the connection");
    println!("    status                           Show the transfer status");
    println!("    help                             Show this help");
    println!("    quit                             Shut down and exit");
    println!();
    println!("  When a credential arrives you will be asked to keep or");
    println!("  discard it.");
}

pub fn print_peer(index: usize, peer: &PeerDescriptor) {
    println!(
        "    [{index}] {name}  ({addr})",
        name = peer.display_name(),
        addr = peer.address
    );
}

pub fn print_record(index: usize, record: &CredentialRecord) {
    let uri = if record.uri.is_empty() {
        String::new()
    } else {
        format!("  <{}>", record.uri)
    };
    println!(
        "    [{index}] {title}  {user}{uri}  (modified {when})",
        title = record.title,
        user = record.username,
        when = record.modified_at.format("%Y-%m-%d %H:%M"),
    );
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

/// Parses a 1-based list index typed by the user.
pub fn parse_index(arg: &str, len: usize) -> Option<usize> {
    match arg.parse::<usize>() {
        Ok(n) if (1..=len).contains(&n) => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a 1-based index within the list, when parsed, then the 0-based position is returned.
    #[test]
    fn given_one_based_index_when_in_range_then_zero_based_returned() {
        assert_eq!(parse_index("1", 3), Some(0));
        assert_eq!(parse_index("3", 3), Some(2));
    }

    /// Given zero, an index past the end or an address, when parsed, then no position is returned.
    #[test]
    fn given_index_out_of_range_or_not_a_number_then_none() {
        assert_eq!(parse_index("0", 3), None);
        assert_eq!(parse_index("4", 3), None);
        assert_eq!(parse_index("192.168.49.1:8988", 3), None);
    }
}
