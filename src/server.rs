//! Chat relay server: accepts every client and forwards messages between
//! them.
//!
//! Each accepted connection gets its own handler task.  The server keys
//! clients by their VIP label, pushes a fresh userlist snapshot on every
//! join and leave, and on Ctrl-C broadcasts the shutdown courtesy sentinel
//! before driving the transport-level close of every connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::chat::{ChatMessage, SHUTDOWN_SENTINEL};
use crate::connection::ReliableConnection;
use crate::physical::ChannelConfig;
use crate::topology::{build_host_transport, Topology};
use crate::transport::TransportConfig;

type Clients = Arc<StdMutex<HashMap<String, Arc<ReliableConnection>>>>;

/// Run the relay server until interrupted.
pub async fn run(
    topology: &Topology,
    channel: ChannelConfig,
    config: TransportConfig,
) -> anyhow::Result<()> {
    let transport = build_host_transport(topology, "server", channel, config).await?;
    let clients: Clients = Arc::new(StdMutex::new(HashMap::new()));
    let shutting_down = Arc::new(AtomicBool::new(false));
    log::info!("[chat] server started as {}", transport.local_addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = transport.accept() => {
                let connection = match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        log::error!("[chat] accept failed: {e}");
                        break;
                    }
                };
                let label = connection.remote_addr().vip.as_str().to_string();
                clients
                    .lock()
                    .expect("clients lock poisoned")
                    .insert(label.clone(), Arc::clone(&connection));
                log::info!("[chat] {label} connected");

                broadcast(&clients, &ChatMessage::system(format!("{label} joined the chat")), Some(&label)).await;
                broadcast_userlist(&clients).await;

                tokio::spawn(handle(
                    connection,
                    label,
                    Arc::clone(&clients),
                    Arc::clone(&shutting_down),
                ));
            }
        }
    }

    log::info!("[chat] shutdown requested, notifying clients…");
    shutting_down.store(true, Ordering::Relaxed);
    broadcast(&clients, &ChatMessage::system(SHUTDOWN_SENTINEL), None).await;
    transport.shutdown().await;
    log::info!("[chat] server stopped");
    Ok(())
}

/// Serve one client until it disconnects.
async fn handle(
    connection: Arc<ReliableConnection>,
    label: String,
    clients: Clients,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        let raw = match connection.receive().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                log::error!("[chat] receive from {label} failed: {e}");
                break;
            }
        };

        let message = match ChatMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[chat] invalid message from {label}: {e}");
                continue;
            }
        };

        match message {
            ChatMessage::Text { .. } | ChatMessage::File { .. } => {
                let Some(recipient) = message.recipient().map(str::to_string) else {
                    log::warn!("[chat] message from {label} has no recipient");
                    continue;
                };
                log::debug!("[chat] {label} -> {recipient}");

                let dest = clients
                    .lock()
                    .expect("clients lock poisoned")
                    .get(&recipient)
                    .cloned();
                match dest {
                    Some(dest) => {
                        if let Err(e) = dest.send(&raw).await {
                            log::warn!("[chat] relay to {recipient} failed: {e}");
                        }
                    }
                    None => log::warn!("[chat] recipient {recipient:?} not connected"),
                }
            }
            other => log::debug!("[chat] ignoring {other:?} from {label}"),
        }
    }

    // Complete our half of the four-way teardown.
    if let Err(e) = connection.close().await {
        log::warn!("[chat] closing {label} failed: {e}");
    }
    clients
        .lock()
        .expect("clients lock poisoned")
        .remove(&label);
    log::info!("[chat] {label} disconnected");

    if !shutting_down.load(Ordering::Relaxed) {
        broadcast(&clients, &ChatMessage::system(format!("{label} left the chat")), None).await;
        broadcast_userlist(&clients).await;
    }
}

/// Send `message` to every connected client except `exclude`.
async fn broadcast(clients: &Clients, message: &ChatMessage, exclude: Option<&str>) {
    let targets: Vec<Arc<ReliableConnection>> = {
        let table = clients.lock().expect("clients lock poisoned");
        table
            .iter()
            .filter(|(label, _)| exclude != Some(label.as_str()))
            .map(|(_, connection)| Arc::clone(connection))
            .collect()
    };
    let raw = message.encode();
    for connection in targets {
        if let Err(e) = connection.send(&raw).await {
            log::warn!("[chat] broadcast to {} failed: {e}", connection.remote_addr());
        }
    }
}

/// Push the current online snapshot to everyone.
async fn broadcast_userlist(clients: &Clients) {
    let users: Vec<String> = {
        let table = clients.lock().expect("clients lock poisoned");
        let mut users: Vec<String> = table.keys().cloned().collect();
        users.sort();
        users
    };
    broadcast(clients, &ChatMessage::userlist(users), None).await;
}
