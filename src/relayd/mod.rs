pub mod admin;
pub mod app;
pub mod bypass;
pub mod chain;
pub mod config;
pub mod connector;
pub mod dialer;
pub mod error;
pub mod handler_tcp;
pub mod handler_udp;
pub mod logging;
pub mod net;
pub mod original_dst;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod runtime_paths;
pub mod selector;
pub mod sniff;
pub mod stream;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>, workdir: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path, workdir).await
}
