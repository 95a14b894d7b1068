mod command;
mod event;
mod ui;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use vaultnfc_core::vault::FileStore;
use vaultnfc_core::{LAN_DISCOVERY_PORT, SERVICE_UUID};
use vaultnfc_engine::discovery::{DiscoveryConfig, DiscoveryController};
use vaultnfc_engine::lan::{LanAdvertiser, LanRadio};
use vaultnfc_engine::manager::{ConnectionManager, ManagerConfig};
use vaultnfc_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::{
    handle_add_cmd, handle_connect_cmd, handle_delete_cmd, handle_list_cmd, handle_peers_cmd,
    handle_pending_credential, handle_receive_cmd, handle_send_cmd,
};
use crate::event::{PendingCredential, spawn_discovery_printer, spawn_event_printer};
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// VaultNFC: share vault credentials with a nearby peer.
///
/// Peers on the same network find each other by broadcast discovery and
/// exchange one credential at a time over a direct connection.  Received
/// credentials are only stored once you choose to keep them.
#[derive(Parser, Debug)]
#[command(name = "vaultnfc", version, about)]
struct Args {
    /// Address to listen on when waiting for a credential.
    #[arg(short, long, default_value = "0.0.0.0:8988")]
    listen: String,

    /// Human-readable name advertised to peers.
    #[arg(short, long, default_value = "VaultNFC-CLI")]
    name: String,

    /// File holding the local vault.
    #[arg(short, long, default_value = "/tmp/vaultnfc/vault.json")]
    vault: PathBuf,

    /// UDP port for discovery probes and beacons.
    #[arg(long, default_value_t = LAN_DISCOVERY_PORT)]
    discovery_port: u16,

    /// How long one peer search runs, in seconds.
    #[arg(long, default_value_t = 12)]
    scan_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vaultnfc_cli=info,warn")),
        )
        .init();

    let transfer_port = match args.listen.parse::<SocketAddr>() {
        Ok(addr) => addr.port(),
        Err(e) => {
            eprintln!("Invalid listen address {}: {e}", args.listen);
            std::process::exit(1);
        }
    };

    if let Some(dir) = args.vault.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create vault directory {}: {e}", dir.display());
            std::process::exit(1);
        }
    }
    let store = FileStore::new(&args.vault);

    let handle = ConnectionManager.start(
        TcpListenerFactory,
        TcpConnector,
        ManagerConfig {
            listen_addr: args.listen.clone(),
        },
    );

    // Shared by our advertiser and radio so our own beacon is never listed.
    let instance = Uuid::new_v4();

    // Peers can find us while the CLI runs, whether or not we are
    // currently waiting for a credential.
    let _advertiser = match LanAdvertiser::spawn(
        &format!("0.0.0.0:{}", args.discovery_port),
        SERVICE_UUID,
        instance,
        Some(args.name.clone()),
        transfer_port,
    )
    .await
    {
        Ok(advertiser) => Some(advertiser),
        Err(e) => {
            warn!(error = ?e, "Peers will not be able to discover this device");
            None
        }
    };

    let scan_window = Duration::from_secs(args.scan_secs);
    let discovery = DiscoveryController::new(
        LanRadio::broadcast(args.discovery_port, scan_window, instance),
        DiscoveryConfig {
            service: SERVICE_UUID,
            scan_window,
        },
    );

    // Channel for received credentials that need user input.
    let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<PendingCredential>();

    spawn_event_printer(handle.subscribe(), pending_tx);
    spawn_discovery_printer(discovery.subscribe());

    // ── Banner ──────────────────────────────────────────────────
    print_banner(&args.listen, &args.name, &args.vault);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        tokio::select! {
            biased;

            Some(pending) = pending_rx.recv() => {
                handle_pending_credential(pending, &store, &mut stdin).await;
                print_prompt();
            }

            line = read_line(&mut stdin) => {
                let Some(line) = line else {
                    break;
                };

                let parts: Vec<&str> = line.split_whitespace().collect();
                let Some(&cmd) = parts.first() else {
                    print_prompt();
                    continue;
                };

                match cmd {
                    "discover" | "scan" => discovery.start_discovery().await,
                    "peers" => handle_peers_cmd(&discovery),
                    "connect" => handle_connect_cmd(&parts, &handle, &discovery).await,
                    "receive" | "listen" => handle_receive_cmd(&handle).await,
                    "add" => handle_add_cmd(&parts, &store).await,
                    "list" | "ls" => handle_list_cmd(&store).await,
                    "delete" | "rm" => handle_delete_cmd(&parts, &store).await,
                    "send" => handle_send_cmd(&parts, &handle, &store).await,
                    "disconnect" => {
                        handle.disconnect().await;
                        println!("  Disconnected.");
                    }
                    "status" => {
                        println!("  Transfer : {}", handle.status());
                        println!("  Search   : {}", discovery.status());
                    }
                    "help" | "?" => print_help(),
                    "quit" | "exit" | "q" => break,
                    other => {
                        println!("  ❓ Unknown command: \"{other}\".  Type 'help' for usage.");
                    }
                }

                print_prompt();
            }
        }
    }

    println!("\n  Shutting down...");
    discovery.stop_discovery().await;
    handle.shut_down().await;
    // Give the session a moment to close its stream.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("  Bye! 👋");
}
