// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::str::FromStr;

use grpc_util::auth::BasicCredential;
use grpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;

/// Default number of proxy uploader workers.
pub const DEFAULT_NUM_UPLOADERS: usize = 100;

/// Default depth of the proxy upload queue.
pub const DEFAULT_MAX_QUEUED_UPLOADS: usize = 1_000_000;

#[derive(Clone, Deserialize, Debug)]
pub struct DiskStoreConfig {
    /// Base path under which to store blobs.
    pub base_path: String,

    /// Capacity in bytes reported on the status page. Eviction is handled by the external
    /// cache manager, not by this server.
    pub max_size: Option<i64>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    Disk(DiskStoreConfig),
    Memory,
}

#[derive(Clone, Deserialize, Debug)]
pub struct HttpProxyConfig {
    /// Base URL of the upstream HTTP cache, e.g. `http://upstream:8080`.
    pub url: String,
}

#[derive(Clone, Deserialize, Debug)]
pub struct GrpcProxyConfig {
    /// Address of the upstream REAPI cache, e.g. `http://upstream:9092`.
    pub address: String,

    /// Instance name to use on upstream requests.
    pub instance_name: Option<String>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ProxyConfig {
    Http(HttpProxyConfig),
    Grpc(GrpcProxyConfig),
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    /// Address on which to serve the REAPI gRPC surface.
    pub grpc_listen_address: String,

    /// Address on which to serve the HTTP cache surface, if any.
    pub http_listen_address: Option<String>,

    /// Local blob store configuration.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub store: StoreConfig,

    /// Optional upstream proxy backend.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub proxy: Option<ProxyConfig>,

    /// Number of workers relaying local writes to the proxy.
    pub num_uploaders: Option<usize>,

    /// Depth of the bounded proxy upload queue. When full, uploads are dropped.
    pub max_queued_uploads: Option<usize>,

    /// Validate stored ActionResults and confirm their referenced CAS blobs exist.
    pub validate_ac_deps: Option<bool>,

    /// Give each instance name its own Action Cache namespace.
    pub mangle_ac_keys: Option<bool>,

    /// Serve the remote asset Fetch API.
    pub enable_asset_api: Option<bool>,

    /// Exempt read-only methods from authentication.
    pub allow_unauthenticated_reads: Option<bool>,

    /// Accepted basic-auth credentials. Absent means no authentication.
    pub credentials: Option<Vec<BasicCredential>>,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{Config, ProxyConfig, StoreConfig};

    #[test]
    fn parses_minimal_config() {
        let config = Config::from_str(
            r#"
grpc_listen_address: "0.0.0.0:9092"
store:
  memory:
"#,
        )
        .unwrap();
        assert_eq!(config.grpc_listen_address, "0.0.0.0:9092");
        assert!(matches!(config.store, StoreConfig::Memory));
        assert!(config.proxy.is_none());
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_str(
            r#"
grpc_listen_address: "0.0.0.0:9092"
http_listen_address: "0.0.0.0:8080"
store:
  disk:
    base_path: /var/cache/blobs
    max_size: 1000000000
proxy:
  grpc:
    address: "http://upstream:9092"
    instance_name: main
num_uploaders: 10
max_queued_uploads: 1024
validate_ac_deps: true
mangle_ac_keys: true
enable_asset_api: true
allow_unauthenticated_reads: true
credentials:
  - username: builder
    password: hunter2
"#,
        )
        .unwrap();

        match &config.store {
            StoreConfig::Disk(disk) => {
                assert_eq!(disk.base_path, "/var/cache/blobs");
                assert_eq!(disk.max_size, Some(1_000_000_000));
            }
            other => panic!("unexpected store config: {other:?}"),
        }
        match &config.proxy {
            Some(ProxyConfig::Grpc(grpc)) => {
                assert_eq!(grpc.address, "http://upstream:9092");
                assert_eq!(grpc.instance_name.as_deref(), Some("main"));
            }
            other => panic!("unexpected proxy config: {other:?}"),
        }
        assert_eq!(config.num_uploaders, Some(10));
        assert_eq!(config.max_queued_uploads, Some(1024));
        assert_eq!(config.validate_ac_deps, Some(true));
        assert_eq!(config.credentials.as_ref().unwrap().len(), 1);
    }
}
