//! Chat client UI contract and the console implementation.
//!
//! Console input commands:
//! - plain text → a text message to the default peer
//! - `/file <path>` → a file transfer
//! - end of input (Ctrl-D) → quit

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::chat::ChatMessage;

const FILE_COMMAND: &str = "/file ";

/// One action read from the user.
#[derive(Debug, PartialEq, Eq)]
pub enum UserInput {
    /// A text line to send.
    Text(String),
    /// A file to transfer.
    File(PathBuf),
    /// End the session.
    Quit,
}

/// Contract between the chat client and any UI implementation.
#[async_trait]
pub trait Ui: Send + Sync {
    fn show_connecting(&self, name: &str);
    fn show_connected(&self, name: &str);
    fn show_message(&self, message: &ChatMessage);
    fn show_file_saved(&self, message: &ChatMessage, path: &Path);
    fn show_disconnected(&self);
    async fn read_input(&self) -> UserInput;
}

/// Plain stdin/stdout UI.
pub struct ConsoleUi {
    lines: tokio::sync::Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self {
            lines: tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ui for ConsoleUi {
    fn show_connecting(&self, name: &str) {
        println!("Connecting as {name}…");
    }

    fn show_connected(&self, name: &str) {
        println!("Connected as {name}. Type a line and press Enter.");
        println!("To send a file: {FILE_COMMAND}<path>");
        println!("Ctrl+C to quit.\n");
    }

    fn show_message(&self, message: &ChatMessage) {
        match message {
            ChatMessage::Text {
                sender,
                timestamp,
                content,
                ..
            } => {
                let who = sender.as_deref().unwrap_or("?");
                println!("\r[{}] {who}: {content}", clock(*timestamp));
            }
            ChatMessage::System {
                timestamp, content, ..
            } => {
                println!("\r[{}] [system] {content}", clock(*timestamp));
            }
            ChatMessage::Userlist {
                timestamp, users, ..
            } => {
                println!("\r[{}] [system] online: {}", clock(*timestamp), users.join(", "));
            }
            ChatMessage::File { .. } => {
                // Files are announced through show_file_saved once on disk.
            }
        }
    }

    fn show_file_saved(&self, message: &ChatMessage, path: &Path) {
        if let ChatMessage::File {
            sender,
            timestamp,
            name,
            size,
            ..
        } = message
        {
            let who = sender.as_deref().unwrap_or("?");
            println!(
                "\r[{}] {who} sent a file: {name} ({size} B) — saved to {}",
                clock(*timestamp),
                path.display()
            );
        }
    }

    fn show_disconnected(&self) {
        println!("\n[system] connection closed by the server.");
    }

    async fn read_input(&self) -> UserInput {
        let mut lines = self.lines.lock().await;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(raw_path) = line.strip_prefix(FILE_COMMAND) {
                        let path = PathBuf::from(raw_path.trim());
                        if !path.is_file() {
                            println!("[error] no such file: {}", path.display());
                            continue;
                        }
                        return UserInput::File(path);
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    return UserInput::Text(line.trim().to_string());
                }
                Ok(None) => return UserInput::Quit,
                Err(e) => {
                    log::warn!("[chat] stdin error: {e}");
                    return UserInput::Quit;
                }
            }
        }
    }
}

/// Render an epoch-seconds timestamp as a UTC wall clock.
fn clock(epoch_secs: u64) -> String {
    let day_secs = epoch_secs % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        day_secs / 3600,
        (day_secs % 3600) / 60,
        day_secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_formats_utc_wall_time() {
        assert_eq!(clock(0), "00:00:00");
        assert_eq!(clock(3_661), "01:01:01");
        assert_eq!(clock(86_399), "23:59:59");
        assert_eq!(clock(86_400), "00:00:00");
    }
}
