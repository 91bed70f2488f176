//! Sharefile Node — a headless binary wiring Signal Codec, Rendezvous
//! Client, Peer Session, Handshake Orchestrator and File Transfer together
//! behind a line-oriented control protocol on stdin/stdout. It plays the
//! role the core engine leaves out of scope: the UI and the final
//! save-to-disk sink.

mod commands;
mod config_store;
mod fs_io;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use commands::Command;
use file_transfer::{TransferEvent, TransferManager};
use fs_io::{FsSink, FsSource};
use sharefile_protocol::Configuration;

#[derive(Clone)]
struct OfferedFile {
    name: String,
    size: u64,
}

type OfferedTable = Arc<Mutex<HashMap<String, OfferedFile>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let ws_base = args.next().unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());
    let download_dir = PathBuf::from(args.next().unwrap_or_else(|| "./downloads".to_string()));

    let cfg = config_store::load();
    info!(%ws_base, download_dir = %download_dir.display(), "sharefile-node starting");

    let mut manager: Option<Arc<TransferManager>> = None;
    let offered: OfferedTable = Arc::new(Mutex::new(HashMap::new()));

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    println!("ready");

    while let Some(line) = lines.next_line().await? {
        let Some(cmd) = Command::parse(&line) else {
            println!("error unrecognized command");
            continue;
        };

        match cmd {
            Command::Quit => {
                config_store::save(&cfg);
                break;
            }
            Command::Host => {
                if manager.is_some() {
                    println!("error session already established");
                    continue;
                }
                match handshake::host(&ws_base, cfg.clone()).await {
                    Ok((code, hs)) => {
                        println!("code {code}");
                        println!("connected");
                        manager = Some(spawn_session(hs, cfg.clone(), offered.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "host handshake failed");
                        println!("error {e}");
                    }
                }
            }
            Command::Join { code } => {
                if manager.is_some() {
                    println!("error session already established");
                    continue;
                }
                match handshake::join(&ws_base, &code, cfg.clone()).await {
                    Ok(hs) => {
                        println!("connected");
                        manager = Some(spawn_session(hs, cfg.clone(), offered.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "join handshake failed");
                        println!("error {e}");
                    }
                }
            }
            Command::Send { path } => {
                let Some(manager) = &manager else {
                    println!("error no active session");
                    continue;
                };
                let source_path = PathBuf::from(&path);
                let name = source_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unnamed".to_string());
                match FsSource::open(&source_path).await {
                    Ok(source) => {
                        let file_id = file_transfer::random_base_id();
                        manager.enqueue_send(file_id.clone(), name, Arc::new(source));
                        println!("sending {file_id}");
                    }
                    Err(e) => {
                        println!("error failed to open {path}: {e}");
                    }
                }
            }
            Command::Accept { id } => {
                let Some(manager) = &manager else {
                    println!("error no active session");
                    continue;
                };
                let name = offered.lock().unwrap().get(&id).map(|o| o.name.clone());
                let Some(name) = name else {
                    println!("error unknown transfer {id}");
                    continue;
                };
                let dest = fs_io::destination_path(&download_dir, &name);
                match FsSink::create(&dest).await {
                    Ok(sink) => {
                        if let Err(e) = manager.accept_incoming(&id, Box::new(sink)) {
                            println!("error {e}");
                        }
                    }
                    Err(e) => {
                        println!("error failed to create {}: {e}", dest.display());
                    }
                }
            }
            Command::CancelSend => {
                let Some(manager) = &manager else {
                    println!("error no active session");
                    continue;
                };
                manager.cancel_outgoing();
            }
            Command::CancelRecv { reason } => {
                let Some(manager) = &manager else {
                    println!("error no active session");
                    continue;
                };
                manager.cancel_incoming(&reason).await;
            }
            Command::Text { message } => {
                let Some(manager) = &manager else {
                    println!("error no active session");
                    continue;
                };
                if let Err(e) = manager.send_text(message).await {
                    println!("error {e}");
                }
            }
        }
    }

    info!("sharefile-node exiting");
    Ok(())
}

/// Spawn the [`TransferManager`] for a completed handshake and a task that
/// prints every [`TransferEvent`] as a control-protocol line.
fn spawn_session(
    hs: handshake::Handshake,
    cfg: Configuration,
    offered: OfferedTable,
) -> Arc<TransferManager> {
    let (manager, mut events_rx) = TransferManager::spawn(hs.session, cfg, hs.events);

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                TransferEvent::TextReceived(text) => println!("text {text}"),
                TransferEvent::FileOffered { id, name, size } => {
                    offered.lock().unwrap().insert(id.clone(), OfferedFile { name: name.clone(), size });
                    println!("offered {id} {name} {size}");
                }
                TransferEvent::FileCompleted { id } => {
                    offered.lock().unwrap().remove(&id);
                    println!("completed {id}");
                }
                TransferEvent::FileCancelled { id, reason } => {
                    offered.lock().unwrap().remove(&id);
                    println!("cancelled {id} {reason}");
                }
                TransferEvent::FileFailed { id, reason } => {
                    offered.lock().unwrap().remove(&id);
                    warn!(%id, %reason, "transfer failed");
                    println!("failed {id} {reason}");
                }
            }
        }
    });

    manager
}
