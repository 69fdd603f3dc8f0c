use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

use crate::{app::Cli, connection::ServerConfig, store::StorageConfig};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub server: ServerConfig,

    pub storage: StorageConfig,
}

impl Config {
    pub fn read(file: &mut impl Read) -> anyhow::Result<Self> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read config file")?;

        let config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn read_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = File::open(path).context("Failed to open config file")?;
        Self::read(&mut file)
    }

    pub fn from_cli_args(args: &Cli) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(config_path) => Self::read_path(config_path)?,
            None => {
                let default_config = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_config.exists() {
                    log::info!("Using default config file {DEFAULT_CONFIG_PATH}");
                    Self::read_path(default_config)?
                } else {
                    log::info!("No config file found; using default config");
                    Config::default()
                }
            }
        };
        if let Some(listen_on) = &args.listen_on {
            config.server.listen_on = listen_on.clone();
        }
        if let Some(rate_file) = &args.rate_file {
            config.storage.rate_file = rate_file.clone();
        }
        Ok(config)
    }
}
