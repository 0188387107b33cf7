//! The router role: forward packets until interrupted, then report stats.

use crate::physical::ChannelConfig;
use crate::topology::{build_router_network, Topology};

/// Run the router until Ctrl-C.
pub async fn run(topology: &Topology, channel: ChannelConfig) -> anyhow::Result<()> {
    let network = build_router_network(topology, channel).await?;
    log::info!("[router] started as {} — waiting for packets…", network.local_vip());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = network.process_one() => {
                if let Err(e) = result {
                    log::error!("[router] forwarding failed: {e}");
                }
            }
        }
    }

    let stats = network.stats();
    log::info!(
        "[router] stopped.\n  processed        : {}\n  forwarded        : {}\n  dropped (TTL)    : {}\n  dropped (route)  : {}",
        stats.total(),
        stats.forwarded,
        stats.dropped_ttl,
        stats.dropped_unknown,
    );
    Ok(())
}
