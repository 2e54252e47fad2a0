use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};
use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use stratos_common::block::genesis_block;
use stratos_daemon::{config::NodeConfig, node::Node};

fn setup_logger(level: &str) -> anyhow::Result<()> {
    use fern::colors::{Color, ColoredLevelConfig};

    let colors = ColoredLevelConfig::new()
        .debug(Color::Green)
        .info(Color::Cyan)
        .warn(Color::Yellow)
        .error(Color::Red);
    let level = LevelFilter::from_str(level).context("invalid log level")?;

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        // keep the HTTP stacks at warn unless asked otherwise
        .level_for("actix_server", LevelFilter::Warn)
        .level_for("actix_http", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
        .context("logger already initialized")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::parse();
    setup_logger(&config.log_level)?;
    info!("stratos daemon v{}", stratos_common::config::VERSION);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {:?}", config.data_dir))?;

    let standalone = config.peers.is_empty();
    let node = Arc::new(Node::bootstrap(config).await?);

    // a fresh standalone node mints its own genesis; nodes with seed peers
    // sync one from the network instead
    if node.chain.height().await.is_none() {
        if standalone {
            info!("empty chain and no seed peers, minting genesis");
            let genesis = genesis_block(
                BTreeMap::new(),
                stratos_common::time::get_current_time_in_millis(),
            )?;
            node.chain.add_block(genesis).await?;
        } else {
            info!("empty chain, waiting for sync from seed peers");
        }
    }

    Arc::clone(&node).start().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    node.stop().await;
    Ok(())
}
