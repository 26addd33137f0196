use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stlink_rtt::config::{ProbeConfig, RttConfig};

use crate::logging::LevelFilter;

/// The main struct holding all the possible config options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: General,
    pub probe: ProbeConfig,
    pub rtt: RttConfig,
}

/// The general config struct holding all the possible general options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    pub log_level: Option<LevelFilter>,
}

/// The project-specific configuration file, picked up from the working directory.
const PROJECT_CONFIG: &str = "RttHost.toml";

/// Prefix of the environment variables overriding the configuration, e.g.
/// `RTTHOST_PROBE__MAX_TRANSFER_SIZE=1024`.
const ENV_PREFIX: &str = "RTTHOST_";

fn defaults() -> Figment {
    Figment::new().merge(Toml::string(include_str!("default.toml")))
}

/// Loads the configuration: defaults, then `RttHost.toml`, then `config_file` and finally the
/// environment.
pub fn load(config_file: Option<&Path>) -> anyhow::Result<Config> {
    let mut figment = defaults().merge(Toml::file(PROJECT_CONFIG));

    if let Some(path) = config_file {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("Failed to parse supplied configuration")
}
