//! Chat client: connects to the relay server and exchanges messages.
//!
//! The client runs two loops: the caller's task reads the UI for outbound
//! messages while a spawned task drains `receive` and renders inbound
//! ones.  Received files land in `downloads/<recipient>/<name>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;

use crate::chat::{ChatMessage, SHUTDOWN_SENTINEL};
use crate::connection::ReliableConnection;
use crate::physical::ChannelConfig;
use crate::topology::{build_host_transport, Topology};
use crate::transport::TransportConfig;
use crate::ui::{Ui, UserInput};

const DOWNLOADS_DIR: &str = "downloads";

/// Run the chat client for the named host until the user quits or the
/// server disconnects.
pub async fn run(
    topology: &Topology,
    node_name: &str,
    peer_vip: &str,
    ui: Arc<dyn Ui>,
    channel: ChannelConfig,
    config: TransportConfig,
) -> anyhow::Result<()> {
    let my_vip = topology
        .node(node_name)
        .with_context(|| format!("unknown node {node_name:?}"))?
        .vip
        .clone();
    let server = topology
        .node("server")
        .context("topology has no server node")?
        .virtual_addr();

    ui.show_connecting(my_vip.as_str());
    let transport = build_host_transport(topology, node_name, channel, config).await?;
    let connection = transport.connect(server).await?;
    ui.show_connected(my_vip.as_str());

    let disconnected = Arc::new(Notify::new());
    let receiver = tokio::spawn(receive_loop(
        Arc::clone(&connection),
        Arc::clone(&ui),
        my_vip.as_str().to_string(),
        Arc::clone(&disconnected),
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("[chat] interrupted, closing connection");
                break;
            }
            _ = disconnected.notified() => break,
            input = ui.read_input() => match input {
                UserInput::Quit => break,
                UserInput::Text(content) => {
                    let msg = ChatMessage::text(my_vip.as_str(), peer_vip, content);
                    if let Err(e) = connection.send(&msg.encode()).await {
                        log::error!("[chat] send failed: {e}");
                        break;
                    }
                }
                UserInput::File(path) => {
                    if let Err(e) = send_file(&connection, my_vip.as_str(), peer_vip, &path).await {
                        log::error!("[chat] file transfer failed: {e}");
                    }
                }
            }
        }
    }

    connection.close().await.ok();
    receiver.abort();
    transport.shutdown().await;
    Ok(())
}

async fn send_file(
    connection: &ReliableConnection,
    sender: &str,
    recipient: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file has no printable name")?;
    let msg = ChatMessage::file(sender, recipient, name, "application/octet-stream", &data);
    connection.send(&msg.encode()).await?;
    Ok(())
}

async fn receive_loop(
    connection: Arc<ReliableConnection>,
    ui: Arc<dyn Ui>,
    my_label: String,
    disconnected: Arc<Notify>,
) {
    loop {
        let raw = match connection.receive().await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                ui.show_disconnected();
                break;
            }
            Err(e) => {
                log::error!("[chat] receive failed: {e}");
                ui.show_disconnected();
                break;
            }
        };

        let message = match ChatMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[chat] invalid message dropped: {e}");
                continue;
            }
        };

        match message {
            ChatMessage::System { ref content, .. } if content == SHUTDOWN_SENTINEL => {
                log::info!("[chat] server is shutting down");
                ui.show_disconnected();
                break;
            }
            ChatMessage::File { .. } => match save_file(&message, &my_label).await {
                Ok(path) => ui.show_file_saved(&message, &path),
                Err(e) => log::error!("[chat] could not save file: {e}"),
            },
            other => ui.show_message(&other),
        }
    }
    disconnected.notify_one();
}

/// Write a received file to `downloads/<recipient>/<name>`.
async fn save_file(message: &ChatMessage, fallback_recipient: &str) -> anyhow::Result<PathBuf> {
    let ChatMessage::File { name, .. } = message else {
        anyhow::bail!("not a file message");
    };
    // Only the final path component of the advertised name is honoured.
    let safe_name = Path::new(name)
        .file_name()
        .context("file message carries no usable name")?;
    let recipient = message.recipient().unwrap_or(fallback_recipient);

    let dir = Path::new(DOWNLOADS_DIR).join(recipient);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join(safe_name);
    let bytes = message.file_bytes()?;
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
