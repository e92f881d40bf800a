//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The connection URL is wrapped in secrecy::SecretString since it
//! usually embeds credentials.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default approximate cap on entries kept per workflow log.
pub const DEFAULT_MAX_LOG_LEN: usize = 10_000;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub bind_addr: SocketAddr,
    pub queues_dir: PathBuf,
    pub max_log_len: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let bind_addr = optional_var("RELAY_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| Error::Config(format!("RELAY_BIND_ADDR is not a socket address: {e}")))?;

        let max_log_len = match optional_var("RELAY_MAX_LOG_LEN") {
            Some(v) => v
                .parse()
                .map_err(|e| Error::Config(format!("RELAY_MAX_LOG_LEN is not a number: {e}")))?,
            None => DEFAULT_MAX_LOG_LEN,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            bind_addr,
            queues_dir: optional_var("RELAY_QUEUES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("queues")),
            max_log_len,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
