// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Configuration
//!
//! Settings for one worker instance. Values are read from the process
//! environment (a `.env` file is honoured) and fall back to defaults.

use crate::errors::ConfigError;
use std::{str::FromStr, time::Duration};

pub const ENV_APP_NAME: &str = "BUS_APP_NAME";
pub const ENV_PROFILE: &str = "BUS_PROFILE";
pub const ENV_PREFETCH_COUNT: &str = "BUS_PREFETCH_COUNT";
pub const ENV_AUTOCOMMIT: &str = "BUS_AUTOCOMMIT";
pub const ENV_RECONNECT_DELAY_MS: &str = "BUS_RECONNECT_DELAY_MS";
pub const ENV_MAX_RECONNECT_DELAY_MS: &str = "BUS_MAX_RECONNECT_DELAY_MS";

/// Configuration for a [`Worker`](crate::worker::Worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfigs {
    /// Reported to the broker as the connection name.
    pub app_name: String,
    /// Name of the profile holding the broker URL.
    pub profile: String,
    /// Maximum number of unacknowledged deliveries outstanding on the channel.
    pub prefetch_count: u16,
    /// Commit the persistence layer after every unit of work.
    pub autocommit: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for WorkerConfigs {
    fn default() -> Self {
        WorkerConfigs {
            app_name: "amqp-bus".to_owned(),
            profile: "default".to_owned(),
            prefetch_count: 1,
            autocommit: true,
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(30000),
        }
    }
}

impl WorkerConfigs {
    /// Loads the configuration from the environment.
    ///
    /// Unset variables keep their default; a variable that is set but does
    /// not parse is a configuration fault.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = WorkerConfigs::default();

        Ok(WorkerConfigs {
            app_name: lookup(ENV_APP_NAME).unwrap_or(defaults.app_name),
            profile: lookup(ENV_PROFILE).unwrap_or(defaults.profile),
            prefetch_count: parse(&lookup, ENV_PREFETCH_COUNT)?.unwrap_or(defaults.prefetch_count),
            autocommit: parse(&lookup, ENV_AUTOCOMMIT)?.unwrap_or(defaults.autocommit),
            reconnect_delay: parse(&lookup, ENV_RECONNECT_DELAY_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            max_reconnect_delay: parse(&lookup, ENV_MAX_RECONNECT_DELAY_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_reconnect_delay),
        })
    }

    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_owned();
        self
    }

    pub fn profile(mut self, profile: &str) -> Self {
        self.profile = profile.to_owned();
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Leaves commit boundaries to the caller when `false`.
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_owned(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let cfg = WorkerConfigs::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, WorkerConfigs::default());
        assert_eq!(cfg.prefetch_count, 1);
        assert!(cfg.autocommit);
    }

    #[test]
    fn test_values_from_env() {
        let cfg = WorkerConfigs::from_lookup(lookup(&[
            (ENV_PROFILE, "billing"),
            (ENV_PREFETCH_COUNT, "10"),
            (ENV_AUTOCOMMIT, "false"),
            (ENV_RECONNECT_DELAY_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(cfg.profile, "billing");
        assert_eq!(cfg.prefetch_count, 10);
        assert!(!cfg.autocommit);
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let err = WorkerConfigs::from_lookup(lookup(&[(ENV_PREFETCH_COUNT, "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_PREFETCH_COUNT.to_owned(),
                value: "many".to_owned()
            }
        );
    }

    #[test]
    fn test_max_delay_never_below_initial() {
        let cfg = WorkerConfigs::default()
            .reconnect_delay(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(cfg.max_reconnect_delay, Duration::from_secs(5));
    }
}
