use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use hv_infra::config::DEFAULT_CONFIG_FILE;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// Provider configuration file, created with defaults when missing.
    pub config_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
#[error("LISTEN_ADDR must be a valid socket address, got {0:?}")]
pub struct InvalidListenAddr(String);

impl AppConfig {
    pub fn from_env() -> Result<Self, InvalidListenAddr> {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
        Ok(Self {
            listen_addr: listen_addr
                .parse()
                .map_err(|_| InvalidListenAddr(listen_addr))?,
            config_file: env::var("HV_CONFIG_FILE")
                .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into())
                .into(),
        })
    }
}
