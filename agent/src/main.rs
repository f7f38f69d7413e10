//! Process entrypoint: init logging, load configuration, construct the
//! process-wide collaborators, and run until a shutdown signal.

mod ble_link;
mod config;
mod control_server;
mod discovery;
mod gateway_session;
mod stores;
mod udp_endpoint;

use std::sync::Arc;

use anyhow::Context;
use hqv_protocol::session_state::SessionState;
use log::info;

use config::Config;
use control_server::ServerCtx;
use discovery::DiscoveryService;
use stores::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .init();

    info!(
        "hqv-agent starting: control_port={} ws_port={} leshan={}",
        config.control_port, config.ws_port, config.leshan_base_url
    );

    let session_state = SessionState::new();
    let aliases = Store::open(&config.alias_store_path);
    let psks = Store::open(&config.psk_store_path);

    let discovery = DiscoveryService::new(
        session_state.clone(),
        config.custom_name.clone(),
        config.gui_access,
        config.ws_port,
    );

    let ctx = ServerCtx::new(config, session_state, aliases, psks);

    tokio::select! {
        result = control_server::run(ctx) => {
            result.context("control server exited")?;
        }
        result = discovery.run() => {
            result.context("discovery service exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("hqv-agent: received ctrl-c, shutting down");
        }
    }

    Ok(())
}
