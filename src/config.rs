// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Layered configuration: a TOML file provides defaults, a `clap`-derived
//! CLI can override individual fields. Every duration-valued field uses
//! `humantime_serde` so config files read naturally (`"500ms"`, `"5m"`).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub leaked_tokens: u32,
    #[serde(with = "humantime_serde")]
    pub leak_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub bucket_max_age: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: 20,
            leaked_tokens: 1,
            leak_duration: Duration::from_millis(500),
            poll_duration: Duration::from_secs(30),
            bucket_max_age: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    #[serde(with = "humantime_serde")]
    pub buffer_expiration_time: Duration,
    #[serde(with = "humantime_serde")]
    pub monitor_thread_frequency: Duration,
    pub fanout: usize,
    pub gateway_channel_len: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            buffer_expiration_time: Duration::from_secs(300),
            monitor_thread_frequency: Duration::from_secs(5),
            fanout: crate::gossip::DEFAULT_FANOUT,
            gateway_channel_len: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cmix_address: String,
    pub port: u16,
    pub override_public_ip: Option<IpAddr>,
    #[serde(default = "default_listening_address")]
    pub listening_address: IpAddr,

    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cmix_cert_path: PathBuf,
    pub scheduling_cert_path: PathBuf,
    pub idf_path: PathBuf,

    pub db_username: String,
    pub db_password: String,
    pub db_name: String,
    pub db_address: String,

    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub disable_gossip: bool,
    #[serde(default)]
    pub ignore_client_version: bool,

    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub gossip: GossipConfig,

    pub address_space_size: u32,
    #[serde(with = "humantime_serde")]
    pub epoch_duration: Duration,

    #[serde(default = "default_known_rounds_path")]
    pub known_rounds_path: PathBuf,
}

fn default_listening_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_known_rounds_path() -> PathBuf {
    PathBuf::from("./known_rounds.bin")
}

impl Config {
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.address_space_size == 0 || self.address_space_size > 63 {
            return Err(ConfigError::Invalid(
                "address_space_size must be in 1..=63".to_string(),
            ));
        }
        if self.gossip.fanout == 0 {
            return Err(ConfigError::Invalid("gossip.fanout must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line overrides. Startup merges these onto the file-provided
/// `Config`; any flag left unset keeps the file's value.
#[derive(Debug, clap::Parser)]
#[command(name = "nym-gateway", about = "cMix gateway node")]
pub struct Cli {
    /// Path to the gateway's TOML configuration file.
    #[arg(long, default_value = "gateway.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub dev_mode: bool,

    #[arg(long)]
    pub disable_gossip: bool,
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.dev_mode {
            config.dev_mode = true;
        }
        if self.disable_gossip {
            config.disable_gossip = true;
        }
        config
    }
}
