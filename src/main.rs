use anyhow::Result;
use clap::Parser;
use ctbridge::{config, mqtt};
use log::info;

fn main() -> Result<()> {
    env_logger::init();

    let config = config::Config::parse();
    config.validate()?;
    info!(
        "Starting ctbridge for {:?}, publishing under {}",
        config.profile, config.publish_prefix
    );

    mqtt::run(&config)
}
