// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure logging for a binary.
pub fn setup_logging(_service_name: &'static str) {
    // Note: This cannot use `EnvFilter` because EnvFilter filters globally even if it only
    // used in a tracing stack!
    let filter_layer = {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .unwrap_or_else(|| "info".to_owned());
        directive
            .parse::<Targets>()
            .expect("Failed to parse RUST_LOG")
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(filter_layer);

    let console_layer_opt = std::env::var("TOKIO_CONSOLE_BIND").ok().map(|_| {
        // Enable tokio-console debugging with configuration coming from tokio-console's
        // documented environment variables, i.e. TOKIO_CONSOLE_BIND,
        // TOKIO_CONSOLE_RETENTION, etc.
        console_subscriber::ConsoleLayer::builder()
            .with_default_env()
            .spawn()
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(console_layer_opt)
        .init();
}
