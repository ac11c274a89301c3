//! Daemon configuration.
//!
//! Looked up in order: `--config`, `HAGENT_CONFIG`, `./hagentd.toml`, then
//! built-in defaults. Command-line `--listen`/`--port` win over the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hagent_wire::protocol::{Component, DEFAULT_MAX_PARAMETER_LENGTH};
use serde::Deserialize;
use tracing::{debug, info};

use crate::components::ParamSpec;

pub const CONFIG_ENV: &str = "HAGENT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "hagentd.toml";
pub const DEFAULT_PORT: u16 = 8670;

fn default_listen_addresses() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> u32 {
    100
}

fn default_socket_permissions() -> u32 {
    0o770
}

fn default_max_parameter_length() -> usize {
    DEFAULT_MAX_PARAMETER_LENGTH
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/usr/lib/hagent/scripts")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_socket_permissions")]
    pub unix_socket_permissions: u32,
    #[serde(default)]
    pub unix_socket_group: Option<String>,
    #[serde(default = "default_max_parameter_length")]
    pub max_parameter_length: usize,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Keyed by component id (`hdfs`, `zookeeper`, ...).
    #[serde(default)]
    pub components: BTreeMap<String, ComponentSettings>,
}

/// Per-component overrides of the built-in catalogue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSettings {
    pub install_dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    /// Extra parameters, or replacements for built-in ones with the same name.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addresses: default_listen_addresses(),
            port: DEFAULT_PORT,
            max_connections: default_max_connections(),
            unix_socket_permissions: default_socket_permissions(),
            unix_socket_group: None,
            max_parameter_length: default_max_parameter_length(),
            scripts_dir: default_scripts_dir(),
            components: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Resolve the config source and load it.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match locate(explicit) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("no configuration file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addresses.is_empty() {
            bail!("listen_addresses must name at least one address");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if self.unix_socket_permissions > 0o777 {
            bail!(
                "unix_socket_permissions {:o} is not a valid file mode",
                self.unix_socket_permissions
            );
        }
        // Room for at least the length prefix of an empty body.
        if self.max_parameter_length < 4 {
            bail!("max_parameter_length must be at least 4");
        }
        for id in self.components.keys() {
            let component = id
                .parse::<Component>()
                .with_context(|| format!("[components.{id}]"))?;
            // Lookups go by the exact id.
            if component.id() != id {
                bail!("[components.{id}]: write the component id as '{}'", component.id());
            }
        }
        Ok(())
    }

    /// Apply command-line overrides.
    pub fn override_with(&mut self, listen: &[String], port: Option<u16>) {
        if !listen.is_empty() {
            self.listen_addresses = listen.to_vec();
        }
        if let Some(port) = port {
            self.port = port;
        }
    }

    pub fn component(&self, component: Component) -> Option<&ComponentSettings> {
        self.components.get(component.id())
    }
}

fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        })
}

#[cfg(unix)]
mod listen {
    use super::*;
    use hagent_net::{ListenAddress, ListenOptions};

    impl AgentConfig {
        pub fn parsed_listen_addresses(&self) -> Result<Vec<ListenAddress>> {
            self.listen_addresses
                .iter()
                .map(|raw| raw.parse::<ListenAddress>().map_err(anyhow::Error::from))
                .collect()
        }

        pub fn listen_options(&self) -> ListenOptions {
            ListenOptions {
                port: self.port,
                max_connections: self.max_connections,
                unix_socket_permissions: self.unix_socket_permissions,
                unix_socket_group: self.unix_socket_group.clone(),
            }
        }
    }
}
