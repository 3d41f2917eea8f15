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

//! Command line surface of the `policycore-metrics` binary. Flags win over
//! the `POLICYCORE_*` environment, which wins over built-in defaults.

use std::net::SocketAddr;

use crate::policycore::api::types::WatchedKind;
use crate::policycore::config;
use crate::policycore::controller::watch::RetryPolicy;
use crate::policycore::logger::{LogFormat, LogLevel};
use crate::policycore::util::BoxError;

pub mod args;

pub use args::MetricsArgs;

#[derive(Debug, Clone)]
pub struct Settings {
    pub kinds: Vec<WatchedKind>,
    pub metrics_bind_address: SocketAddr,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn resolve(args: MetricsArgs) -> Result<Settings, BoxError> {
        let kinds = if args.kinds.is_empty() {
            config::watched_kinds()?
        } else {
            args.kinds
        };
        let metrics_bind_address = match args.metrics_bind_address {
            Some(addr) => addr,
            None => config::metrics_bind_address()?,
        };
        let log_format = match args.log_format {
            Some(format) => format,
            None => config::log_format()?,
        };
        let log_level = match args.log_level {
            Some(level) => level,
            None => config::log_level()?,
        };
        let (initial, max) = config::retry_bounds()?;

        Ok(Settings {
            kinds,
            metrics_bind_address,
            log_format,
            log_level,
            retry: RetryPolicy::new(initial, max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policycore::config::Config;
    use crate::policycore::test_support::env_lock;
    use clap::Parser;
    use std::env;
    use std::time::Duration;

    fn clear_env() {
        for setting in [
            Config::MetricsBindAddress,
            Config::WatchedKinds,
            Config::LogFormat,
            Config::LogLevel,
            Config::RetryInitialMs,
            Config::RetryMaxMs,
        ] {
            env::remove_var(setting.env_var());
        }
    }

    #[test]
    fn flags_override_environment() {
        let _lock = env_lock().lock();
        clear_env();
        env::set_var(Config::WatchedKinds.env_var(), "v1/FromEnv");
        env::set_var(Config::LogFormat.env_var(), "json");

        let args = MetricsArgs::try_parse_from([
            "policycore-metrics",
            "--kind",
            "policy.example.io/v1/FromFlag",
            "--metrics-bind-address",
            "127.0.0.1:9100",
        ])
        .expect("valid arguments");
        let settings = Settings::resolve(args).expect("settings");
        clear_env();

        assert_eq!(settings.kinds.len(), 1);
        assert_eq!(settings.kinds[0].kind, "FromFlag");
        assert_eq!(settings.metrics_bind_address.port(), 9100);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.log_level, LogLevel::Info);
        assert_eq!(settings.retry.initial, Duration::from_millis(200));
        assert_eq!(settings.retry.max, Duration::from_secs(10));
    }

    #[test]
    fn environment_fills_missing_flags() {
        let _lock = env_lock().lock();
        clear_env();
        env::set_var(
            Config::WatchedKinds.env_var(),
            "policy.example.io/v1/PolicyKindA, policy.example.io/v1/PolicyKindB",
        );
        env::set_var(Config::RetryInitialMs.env_var(), "50");

        let args = MetricsArgs::try_parse_from(["policycore-metrics"]).expect("no arguments");
        let settings = Settings::resolve(args).expect("settings");
        clear_env();

        let names: Vec<&str> = settings.kinds.iter().map(|k| k.kind.as_str()).collect();
        assert_eq!(names, vec!["PolicyKindA", "PolicyKindB"]);
        assert_eq!(settings.metrics_bind_address.port(), 8383);
        assert_eq!(settings.retry.initial, Duration::from_millis(50));
    }

    #[test]
    fn invalid_environment_is_an_error() {
        let _lock = env_lock().lock();
        clear_env();
        env::set_var(Config::LogLevel.env_var(), "verbose");

        let args = MetricsArgs::try_parse_from(["policycore-metrics"]).expect("no arguments");
        let result = Settings::resolve(args);
        clear_env();

        assert!(result.is_err());
    }
}
