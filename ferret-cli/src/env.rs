//! Configuration directory and config file.

use std::{
    net::SocketAddr,
    path::{
        Path,
        PathBuf,
    },
};

use ferret::{
    config::ProxyConfig,
    server::DEFAULT_PORT,
};
use serde::Deserialize;

use crate::args::Options;

/// Default configuration directory relative to the OS's local configuration
/// directory (e.g. `~/.config` on Linux).
pub const CONFIG_DIR_NAME: &str = "ferret";

/// Main configuration file name.
pub const CONFIG_FILE: &str = "ferret.toml";

pub const DEFAULT_CONFIG: &str = include_str!("ferret.default.toml");

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not determine config directory.")]
    ConfigDirectory,

    #[error("Could not create directory: {path}")]
    CreateDirectory {
        #[source]
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Could not read file: {path}")]
    ReadFile {
        #[source]
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Could not write file: {path}")]
    WriteFile {
        #[source]
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Could not parse TOML file: {path}")]
    ParseToml {
        #[source]
        error: toml::de::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_bind_address() -> SocketAddr {
    ([127, 0, 0, 1], DEFAULT_PORT).into()
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_tls_config_key_file")]
    pub key_file: PathBuf,

    #[serde(default = "default_tls_config_cert_file")]
    pub cert_file: PathBuf,
}

fn default_tls_config_key_file() -> PathBuf {
    "ca.key.pem".into()
}

fn default_tls_config_cert_file() -> PathBuf {
    "ca.cert.pem".into()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            key_file: default_tls_config_key_file(),
            cert_file: default_tls_config_cert_file(),
        }
    }
}

#[derive(Debug)]
pub struct Environment {
    config_dir: PathBuf,
    config: Config,
}

impl Environment {
    /// Opens the configuration, either with the command-line-specified path to
    /// the configuration directory, or using the default
    /// [`CONFIG_DIR_NAME`].
    pub fn from_options(options: Options) -> Result<Self, Error> {
        let config_dir = options
            .config
            .or_else(|| dirs::config_local_dir().map(|path| path.join(CONFIG_DIR_NAME)))
            .ok_or(Error::ConfigDirectory)?;

        create_dir_all(&config_dir)?;
        let config = open(&config_dir.join(CONFIG_FILE))?;

        Ok(Self { config_dir, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves `path` relative to the configuration directory. Absolute
    /// paths stay as they are.
    pub fn config_relative_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.config_dir.join(path)
    }
}

/// Reads the config file, writing the default one first if there is none.
fn open(path: &Path) -> Result<Config, Error> {
    let toml = if path.exists() {
        std::fs::read_to_string(path).map_err(|error| {
            Error::ReadFile {
                error,
                path: path.to_owned(),
            }
        })?
    }
    else {
        std::fs::write(path, DEFAULT_CONFIG).map_err(|error| {
            Error::WriteFile {
                error,
                path: path.to_owned(),
            }
        })?;
        DEFAULT_CONFIG.to_owned()
    };

    toml::from_str(&toml).map_err(|error| {
        Error::ParseToml {
            error,
            path: path.to_owned(),
        }
    })
}

fn create_dir_all(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).map_err(|error| {
        Error::CreateDirectory {
            error,
            path: path.to_owned(),
        }
    })
}

#[cfg(test)]
mod tests {
    use ferret::config::{
        ProxyMode,
        StrategyKind,
    };

    use super::{
        Environment,
        CONFIG_FILE,
    };
    use crate::args::Options;

    fn open(dir: &tempfile::TempDir) -> Environment {
        Environment::from_options(Options {
            config: Some(dir.path().to_owned()),
        })
        .unwrap()
    }

    #[test]
    fn it_writes_and_reads_the_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let env = open(&dir);

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(env.config().bind_address, ([127, 0, 0, 1], 8080).into());
        assert_eq!(env.config().proxy.mode, ProxyMode::Regular);
        assert_eq!(
            env.config_relative_path(&env.config().tls.key_file),
            dir.path().join("ca.key.pem")
        );
    }

    #[test]
    fn it_reads_proxy_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
                bind_address = "0.0.0.0:9000"

                [proxy]
                mode = "reverse:https://example.com"
                body_size_limit = 1024
                ignore_hosts = ["^example\\.org"]

                [proxy.strategy]
                kind = "probabilistic"
                probability = 0.25
            "#,
        )
        .unwrap();
        let env = open(&dir);
        let config = &env.config().proxy;

        assert_eq!(env.config().bind_address, ([0, 0, 0, 0], 9000).into());
        assert!(matches!(config.mode, ProxyMode::Reverse { .. }));
        assert_eq!(config.body_size_limit, Some(1024));
        assert_eq!(config.ignore_hosts, vec!["^example\\.org".to_owned()]);
        assert_eq!(config.strategy.kind, StrategyKind::Probabilistic);
        assert_eq!(config.strategy.probability, 0.25);
        assert!(config.http2);
    }
}
