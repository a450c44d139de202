pub mod api;
pub mod code;
pub mod config;
pub mod limiter;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod session;
pub mod statistics;

use std::sync::Arc;

use self::{
    config::Config,
    session::{Service, ServiceOptions},
    statistics::Statistics,
};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "signaling-rs.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the crate directly and start the
/// server, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();
    let service = Service::new(ServiceOptions {
        config: config.clone(),
        statistics: statistics.clone(),
    });

    service.start_scavenger();

    server::start(config, service, statistics).await
}
