// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for binaries built on this crate.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `DEPROQUE_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `DEPROQUE_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `DEPROQUE_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "deproque::key_lock" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// ENV used to set the log level
const FILTER_ENV: &str = "DEPROQUE_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "DEPROQUE_LOGGING_CONFIG_PATH";

/// ENV that switches output to JSON lines
const JSONL_ENV: &str = "DEPROQUE_LOGGING_JSONL";

/// ENV that disables ANSI colour codes
const NO_ANSI_ENV: &str = "DEPROQUE_NO_ANSI";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // Each builder method returns a specialized type, so both arms repeat the chain.
    if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .compact()
            .with_ansi(!env_is_truthy(NO_ANSI_ENV))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config file
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));

    match figment.extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed loading logging config, using defaults: {e}");
            LoggingConfig::default()
        }
    }
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
