use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    /// Append notices buffered per gateway connection before it lags
    pub broadcast_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = var("PALAVER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("PALAVER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("PALAVER_PORT must be a port number")?;
        let db_path = var("PALAVER_DB_PATH").unwrap_or_else(|| "palaver.db".into());
        let broadcast_capacity = var("PALAVER_BROADCAST_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);

        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("PALAVER_HOST must be an IP address")?;

        Ok(Self {
            addr,
            db_path: db_path.into(),
            broadcast_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.db_path, PathBuf::from("palaver.db"));
        assert_eq!(config.broadcast_capacity, 1024);
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(ServerConfig::from_lookup(lookup(&[("PALAVER_PORT", "http")])).is_err());
    }

    #[test]
    fn overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PALAVER_HOST", "127.0.0.1"),
            ("PALAVER_PORT", "8080"),
            ("PALAVER_BROADCAST_CAPACITY", "16"),
        ]))
        .unwrap();
        assert_eq!(config.addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.broadcast_capacity, 16);
    }
}
