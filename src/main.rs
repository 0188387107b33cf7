//! Entry point for `netstack-sim`.
//!
//! Parses CLI arguments and dispatches into one of the four roles on the
//! fixed loopback LAN.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, argument parsing).

use std::sync::Arc;

use clap::{Parser, Subcommand};

use netstack_sim::physical::ChannelConfig;
use netstack_sim::topology::Topology;
use netstack_sim::transport::TransportConfig;
use netstack_sim::ui::{ConsoleUi, Ui};
use netstack_sim::{client, router, server};

/// A layered network-stack simulation with a chat application on top.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the network router.
    Router {
        /// Use the graphical interface.
        #[arg(long)]
        gui: bool,
    },
    /// Run the chat relay server.
    Server {
        /// Use the graphical interface.
        #[arg(long)]
        gui: bool,
    },
    /// Run Alice's chat client (talks to Bob by default).
    Alice {
        /// Use the graphical interface.
        #[arg(long)]
        gui: bool,
    },
    /// Run Bob's chat client (talks to Alice by default).
    Bob {
        /// Use the graphical interface.
        #[arg(long)]
        gui: bool,
    },
}

fn select_ui(gui: bool) -> Arc<dyn Ui> {
    if gui {
        log::warn!("no windowed UI backend is built in; using the console UI");
    }
    Arc::new(ConsoleUi::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let topology = Topology::default_lan();
    let channel = ChannelConfig::default();
    let config = TransportConfig::default();

    match cli.role {
        Role::Router { gui: _ } => router::run(&topology, channel).await,
        Role::Server { gui: _ } => server::run(&topology, channel, config).await,
        Role::Alice { gui } => {
            client::run(&topology, "alice", "HOST_B", select_ui(gui), channel, config).await
        }
        Role::Bob { gui } => {
            client::run(&topology, "bob", "HOST_A", select_ui(gui), channel, config).await
        }
    }
}
