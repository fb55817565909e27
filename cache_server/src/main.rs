// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use cache::api::{CacheOptions, Server};
use cache::http::HttpCacheHandler;
use clap::{Arg, Command};
use grpc_util::auth::AuthPolicy;
use grpc_util::hyper::AddrIncomingWithStream;
use grpc_util::infra::setup_infra_endpoints;
use grpc_util::logging::setup_logging;
use hyper::server::conn::AddrIncoming;
use proxy::{start_uploaders, GrpcProxy, HttpProxy, ProxyBackend};
use storage::driver::{BlobStore, DiskStore, MemoryStore};
use tokio::io::AsyncReadExt;
use tower_http::metrics::in_flight_requests::InFlightRequestsCounter;

use crate::config::{
    Config, ProxyConfig, StoreConfig, DEFAULT_MAX_QUEUED_UPLOADS, DEFAULT_NUM_UPLOADERS,
};

pub mod config;

type BoxBlobStore = Box<dyn BlobStore + Send + Sync + 'static>;

async fn make_store(config: &StoreConfig, validate_ac_deps: bool) -> Result<BoxBlobStore, String> {
    let store = match config {
        StoreConfig::Disk(c) => {
            let store = DiskStore::new(
                c.base_path.clone(),
                c.max_size.unwrap_or(0),
                validate_ac_deps,
            )
            .await
            .map_err(String::from)?;
            Box::new(store) as BoxBlobStore
        }
        StoreConfig::Memory => {
            Box::new(MemoryStore::with_options(validate_ac_deps)) as BoxBlobStore
        }
    };
    Ok(store)
}

fn make_proxy(config: &ProxyConfig) -> Result<Arc<dyn ProxyBackend + 'static>, String> {
    let backend = match config {
        ProxyConfig::Http(c) => Arc::new(HttpProxy::new(c.url.clone())) as Arc<dyn ProxyBackend>,
        ProxyConfig::Grpc(c) => Arc::new(GrpcProxy::new(
            &c.address,
            c.instance_name.clone().unwrap_or_default(),
        )?) as Arc<dyn ProxyBackend>,
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("cache_server")
        .arg(
            Arg::new("config")
                .short('c')
                .required(true)
                .value_name("FILE"),
        )
        .get_matches();

    let config_filename = matches.get_one::<String>("config").unwrap();
    let mut file = tokio::fs::File::open(config_filename).await?;
    let mut config_str = String::new();
    file.read_to_string(&mut config_str).await?;
    let config = Config::from_str(&config_str)?;

    setup_logging("cache_server");
    log::info!("Cache server config: {config:?}");

    let options = CacheOptions {
        validate_ac_deps: config.validate_ac_deps.unwrap_or_default(),
        mangle_ac_keys: config.mangle_ac_keys.unwrap_or_default(),
        enable_asset_api: config.enable_asset_api.unwrap_or_default(),
    };

    let store = make_store(&config.store, options.validate_ac_deps).await?;

    let proxy_backend = config.proxy.as_ref().map(make_proxy).transpose()?;
    let upload_queue = proxy_backend.as_ref().map(|backend| {
        start_uploaders(
            backend.clone(),
            config.num_uploaders.unwrap_or(DEFAULT_NUM_UPLOADERS),
            config
                .max_queued_uploads
                .unwrap_or(DEFAULT_MAX_QUEUED_UPLOADS),
        )
    });

    let auth_policy = match config.credentials.clone() {
        Some(credentials) => AuthPolicy::new(
            credentials,
            config.allow_unauthenticated_reads.unwrap_or_default(),
        ),
        None => AuthPolicy::allow_all(),
    };

    let server = Server::new(store, proxy_backend, upload_queue, options);

    let grpc_address: SocketAddr = config.grpc_listen_address.parse()?;
    let incoming = AddrIncoming::bind(&grpc_address)?;
    log::info!("Serving gRPC cache surface on {}", &grpc_address);

    // Setup infra endpoints.
    let in_flight_requests_counter = InFlightRequestsCounter::new();
    let in_flight_requests_counter_2 = in_flight_requests_counter.clone();
    let shutdown_receiver = setup_infra_endpoints(config.infra.unwrap_or_default(), move || {
        let count = in_flight_requests_counter_2.get();
        metrics::gauge!("cache_grpc_inflight_requests", count as f64, "service" => "cache_server");
    })?;

    // Serve the HTTP cache surface alongside the gRPC one, sharing shutdown.
    if let Some(http_listen_address) = &config.http_listen_address {
        let http_address: SocketAddr = http_listen_address.parse()?;
        let handler = HttpCacheHandler::new(&server, auth_policy.clone());
        let mut http_shutdown_receiver = shutdown_receiver.clone();
        log::info!("Serving HTTP cache surface on {}", &http_address);
        tokio::spawn(async move {
            let result = handler
                .serve_with_shutdown(http_address, async move {
                    while http_shutdown_receiver.changed().await.is_ok() {}
                })
                .await;
            if let Err(err) = result {
                log::error!("HTTP server failed: {err}");
            }
        });
    }

    let mut grpc_shutdown_receiver = shutdown_receiver;
    server
        .serve_with_incoming_shutdown(
            AddrIncomingWithStream(incoming),
            async move { while grpc_shutdown_receiver.changed().await.is_ok() {} },
            config.grpc,
            auth_policy,
            in_flight_requests_counter,
        )
        .await?;

    Ok(())
}
