use clap::Parser;
use fabric_ws_gateway::{
    config::{set_logger, ConfigArgs},
    server::serve_gateway,
};

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    set_logger(config.log_level)?;
    tracing::info!(mode = %config.mode, port = config.ws_api.port, "starting gateway");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve_gateway(config))
}
