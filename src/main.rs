use std::sync::Arc;

use color_eyre::Result;
use irlink::broker::BrokerSupervisor;
use irlink::config::SettingsStore;
use irlink::discovery::DiscoveryResponder;
use irlink::mqtt::{InboundRouter, PresenceTracker, SessionClient};
use irlink::service::GatewayService;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = SettingsStore::open();
    info!(
        "starting irlink gateway, broker target {}",
        settings.current().broker_address()
    );

    let presence = Arc::new(PresenceTracker::new());
    let router = InboundRouter::new();
    let session = Arc::new(SessionClient::new(presence.clone(), router));
    let broker = Arc::new(BrokerSupervisor::new());
    let discovery = Arc::new(DiscoveryResponder::new());

    let service = GatewayService::new(session, broker, discovery, settings.subscribe());
    service.start().await;

    // Log node reachability transitions until shutdown.
    let mut any_online = presence.watch_any_online();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = any_online.changed() => {
                if changed.is_err() {
                    break;
                }
                if *any_online.borrow() {
                    info!("node online");
                } else {
                    info!("all nodes offline");
                }
            }
        }
    }

    info!("shutting down");
    service.stop().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
