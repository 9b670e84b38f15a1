//! Environment-derived settings.
//!
//! The daemon is configured through environment variables, usually
//! provided by a `.env` file loaded at startup. `SSH_PUBLIC_KEY` and
//! `TARGET_PORT` are required; everything else has a default.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while reading settings from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings shared across the control plane.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Public key injected into each VM's cloud-init user-data.
    pub ssh_public_key: String,
    /// Base URL instances use to self-register with the load balancer.
    pub load_balancer_url: String,
    /// Application port exposed by each VM.
    pub target_port: u16,
    /// How long an instance waits after deregistering before its
    /// shutdown proceeds.
    pub draining_time: Duration,
    /// Wait between domain boot and LB/discovery registration.
    pub cold_start_timeout: Duration,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through a lookup closure. Tests use this to avoid
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let ssh_public_key = lookup("SSH_PUBLIC_KEY")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("SSH_PUBLIC_KEY"))?;

        let load_balancer_url = lookup("LOAD_BALANCER_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        let target_port = lookup("TARGET_PORT")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("TARGET_PORT"))?;
        let target_port = target_port
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid {
                name: "TARGET_PORT",
                value: target_port.clone(),
                reason: e.to_string(),
            })?;

        let draining_time = parse_secs(&lookup, "DRAINING_TIME_SEC", 30)?;
        let cold_start_timeout = parse_minutes(&lookup, "COLD_START_TIMEOUT_MIN", 8)?;

        Ok(Self {
            ssh_public_key,
            load_balancer_url,
            target_port,
            draining_time,
            cold_start_timeout,
        })
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default_secs: u64,
) -> Result<Duration, ConfigError> {
    parse_u64(lookup, name, default_secs).map(Duration::from_secs)
}

fn parse_minutes(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default_mins: u64,
) -> Result<Duration, ConfigError> {
    parse_u64(lookup, name, default_mins).map(|m| Duration::from_secs(m * 60))
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(name).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
