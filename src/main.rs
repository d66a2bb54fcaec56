use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use machined::cli::Args;
use machined::config::{Config, CONFIG_FILE_NAME, ENV_PREFIX};
use machined::daemon::Daemon;
use machined::ipfs::MemIpfs;
use machined::util::{block_until_sigint, machined_home_path, make_config};
use machined::{poller, server};
use tracing::debug;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let sources = [machined_home_path(CONFIG_FILE_NAME), args.cfg.clone()];
    let config = make_config(
        // default
        Config::default(),
        // potential config files
        &sources,
        // env var prefix for this config
        ENV_PREFIX,
        // map of present command line arguments
        args.make_overrides_map(),
    )?;
    let config = Arc::new(config);
    debug!("{:#?}", config);

    let ipfs = Arc::new(MemIpfs::new());
    let daemon = Daemon::new(config, ipfs);
    daemon.restore().await?;

    let server_task = server::start(daemon.clone())?;
    let poller_task = tokio::spawn(poller::run(daemon.clone()));

    block_until_sigint().await;

    daemon.drain().await;
    poller_task.abort();
    server_task.abort();

    Ok(())
}
