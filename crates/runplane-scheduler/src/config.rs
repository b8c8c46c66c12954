// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for runplane-scheduler.

use std::str::FromStr;
use std::time::Duration;

/// Scheduler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
    /// Time between reconciliation sweeps
    pub reconcile_interval: Duration,
    /// Upper bound for the sweep delay after repeated storage failures
    pub reconcile_max_backoff: Duration,
    /// Per-subscriber event buffer size
    pub event_buffer: usize,
    /// How often a blocking lock acquisition retries
    pub lock_retry_interval: Duration,
    /// PostgreSQL NOTIFY channel used by the event relay
    pub notify_channel: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("RUNPLANE_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .ok_or(ConfigError::MissingEnvVar(
                "RUNPLANE_DATABASE_URL or DATABASE_URL",
            ))?;

        let max_connections = parse(&lookup, "RUNPLANE_DB_MAX_CONNECTIONS", 10u32)?;
        let reconcile_interval = Duration::from_secs(parse(
            &lookup,
            "RUNPLANE_RECONCILE_INTERVAL_SECS",
            30u64,
        )?);
        let reconcile_max_backoff = Duration::from_secs(parse(
            &lookup,
            "RUNPLANE_RECONCILE_MAX_BACKOFF_SECS",
            300u64,
        )?);
        let event_buffer = parse(&lookup, "RUNPLANE_EVENT_BUFFER", 256usize)?;
        let lock_retry_interval =
            Duration::from_millis(parse(&lookup, "RUNPLANE_LOCK_RETRY_MS", 500u64)?);
        let notify_channel =
            lookup("RUNPLANE_NOTIFY_CHANNEL").unwrap_or_else(|| "runplane_events".to_string());

        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                name: "RUNPLANE_DB_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                name: "RUNPLANE_EVENT_BUFFER",
                value: "0".to_string(),
            });
        }
        if reconcile_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "RUNPLANE_RECONCILE_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        if notify_channel.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "RUNPLANE_NOTIFY_CHANNEL",
                value: notify_channel,
            });
        }

        Ok(Self {
            database_url,
            max_connections,
            reconcile_interval,
            reconcile_max_backoff: reconcile_max_backoff.max(reconcile_interval),
            event_buffer,
            lock_retry_interval,
            notify_channel,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed or is out of range.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}
