/*
 * Copyright (C) 2024 The Policycore Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use crate::policycore::api::types::WatchedKind;
use crate::policycore::logger::{LogFormat, LogLevel};
use crate::policycore::util::{new_error, with_context};

/// Settings that can be supplied through the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    MetricsBindAddress,
    WatchedKinds,
    LogFormat,
    LogLevel,
    RetryInitialMs,
    RetryMaxMs,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::MetricsBindAddress => "POLICYCORE_METRICS_BIND_ADDRESS",
            Config::WatchedKinds => "POLICYCORE_WATCHED_KINDS",
            Config::LogFormat => "POLICYCORE_LOG_FORMAT",
            Config::LogLevel => "POLICYCORE_LOG_LEVEL",
            Config::RetryInitialMs => "POLICYCORE_RETRY_INITIAL_MS",
            Config::RetryMaxMs => "POLICYCORE_RETRY_MAX_MS",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::MetricsBindAddress => "0.0.0.0:8383",
            Config::WatchedKinds => "",
            Config::LogFormat => "text",
            Config::LogLevel => "info",
            Config::RetryInitialMs => "200",
            Config::RetryMaxMs => "10000",
        }
    }

    /// Returns the environment value, or the default when unset or blank.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    fn invalid(&self, value: &str, err: impl Into<Box<dyn Error + Send + Sync>>) -> Box<dyn Error + Send + Sync> {
        with_context(err, format!("Invalid {} value '{}'", self.env_var(), value))
    }
}

pub fn metrics_bind_address() -> Result<SocketAddr, Box<dyn Error + Send + Sync>> {
    let value = Config::MetricsBindAddress.get();
    value
        .parse::<SocketAddr>()
        .map_err(|err| Config::MetricsBindAddress.invalid(&value, err))
}

/// Kinds listed in `POLICYCORE_WATCHED_KINDS`, comma separated. An unset
/// variable yields an empty list; setup rejects that later.
pub fn watched_kinds() -> Result<Vec<WatchedKind>, Box<dyn Error + Send + Sync>> {
    let value = Config::WatchedKinds.get();
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<WatchedKind>()
                .map_err(|err| Config::WatchedKinds.invalid(&value, err))
        })
        .collect()
}

pub fn log_format() -> Result<LogFormat, Box<dyn Error + Send + Sync>> {
    let value = Config::LogFormat.get();
    value
        .parse::<LogFormat>()
        .map_err(|err| Config::LogFormat.invalid(&value, err))
}

pub fn log_level() -> Result<LogLevel, Box<dyn Error + Send + Sync>> {
    let value = Config::LogLevel.get();
    value
        .parse::<LogLevel>()
        .map_err(|err| Config::LogLevel.invalid(&value, err))
}

fn millis(setting: Config) -> Result<Duration, Box<dyn Error + Send + Sync>> {
    let value = setting.get();
    let parsed = value
        .parse::<u64>()
        .map_err(|err| setting.invalid(&value, err))?;
    if parsed == 0 {
        return Err(setting.invalid(&value, new_error("must be greater than zero")));
    }
    Ok(Duration::from_millis(parsed))
}

/// Backoff bounds for requeueing failed reconciles.
pub fn retry_bounds() -> Result<(Duration, Duration), Box<dyn Error + Send + Sync>> {
    let initial = millis(Config::RetryInitialMs)?;
    let max = millis(Config::RetryMaxMs)?;
    if max < initial {
        return Err(new_error(format!(
            "{} ({}ms) must not be smaller than {} ({}ms)",
            Config::RetryMaxMs.env_var(),
            max.as_millis(),
            Config::RetryInitialMs.env_var(),
            initial.as_millis()
        )));
    }
    Ok((initial, max))
}
