// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cpuhp::admin::ADMIN_SOCKET_PATH;
use cpuhp::ClientId;
use cpuhp::SYSFS_CPU_ROOT;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpuhp/config.toml";

// Maximum size for config file (1 MB)
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding `possible`, `online` and `cpuN/online`.
    pub sysfs_root: PathBuf,
    pub socket_path: PathBuf,
    /// Start arbitrating right after setup.
    pub enable_on_start: bool,
    /// Register the HP_QOS client so that `qos_max` requests take effect.
    pub qos_client: bool,
    pub clients: Vec<StaticClient>,
}

/// A client registered at startup.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticClient {
    pub name: String,
    /// Hex cpumask, or "all" / "none".
    #[serde(default = "StaticClient::default_mask")]
    pub mask: String,
}

impl StaticClient {
    fn default_mask() -> String {
        "all".to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_CPU_ROOT),
            socket_path: PathBuf::from(ADMIN_SOCKET_PATH),
            enable_on_start: true,
            qos_client: true,
            clients: vec![],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for client in self.clients.iter() {
            let id = ClientId::parse(&client.name)?;
            if id.is_builtin() {
                bail!("Client name {} is reserved", client.name);
            }
            if !seen.insert(id) {
                bail!("Client {} configured more than once", client.name);
            }
        }
        Ok(())
    }
}

/// Load `path` if given, else the default location if it exists, else the
/// built-in defaults.
pub fn init_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => parse_config_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            parse_config_file(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => {
            log::info!("No config file found, using defaults");
            Config::default()
        }
    };

    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "Config file {} is too large: {} bytes exceeds maximum of {}",
            path.display(),
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    log::info!("Using config file: {}", path.display());
    parse_config_content(&content)
}

fn parse_config_content(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse TOML configuration")
}
