// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber. The library only emits
//! events; the host process decides when to call [`init`].

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_JSON: &str = "BUS_LOG_JSON";

/// Initializes logging for the process, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times, subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var(ENV_LOG_JSON)
        .map(|v| v == "true")
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
