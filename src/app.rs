use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::LevelFilter;

use crate::{
    config::Config, connection::ConnectionListener, session::PageSession, store::RateStore,
};

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[arg(
        short,
        long,
        help = "The address that the server should listen on. This overrides the value from the config file."
    )]
    pub listen_on: Option<String>,

    #[arg(
        short,
        long,
        help = "The path to the config file. The default is `config.toml`."
    )]
    pub config: Option<String>,

    #[arg(
        short,
        long,
        help = "The file the chosen playback rate is persisted in. This overrides the value from the config file."
    )]
    pub rate_file: Option<PathBuf>,
}

pub async fn start() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("PRESTO_LOG")
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli_args(&cli)?;

    let store = Arc::new(RateStore::open(&config.storage));
    log::debug!("Persisting the playback rate in {}", store.path().display());

    let listener = ConnectionListener::bind(config.server).await?;
    listener
        .listen(move |mut conn| {
            let store = Arc::clone(&store);
            async move {
                conn.init().await?;

                let mut session = PageSession::new(conn, store);
                session.run().await;

                Ok(())
            }
        })
        .await;

    Ok(())
}
