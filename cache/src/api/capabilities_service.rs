// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use protos::build::bazel::remote::execution::v2::{
    capabilities_server::Capabilities, compressor, digest_function,
    priority_capabilities::PriorityRange, symlink_absolute_path_strategy,
    ActionCacheUpdateCapabilities, CacheCapabilities, GetCapabilitiesRequest,
    PriorityCapabilities, ServerCapabilities,
};
use protos::build::bazel::semver::SemVer;
use tonic::{Request, Response, Status};

use crate::api::InnerServer;

pub(super) struct CapabilitiesService {
    #[allow(dead_code)]
    pub(super) inner: Arc<InnerServer>,
}

#[tonic::async_trait]
impl Capabilities for CapabilitiesService {
    #[tracing::instrument(skip_all)]
    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        let response = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![digest_function::Value::Sha256 as i32],
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    update_enabled: true,
                }),
                cache_priority_capabilities: Some(PriorityCapabilities {
                    priorities: vec![PriorityRange {
                        min_priority: 0,
                        max_priority: 0,
                    }],
                }),
                // 0 means "no limit" for the batch APIs.
                max_batch_total_size_bytes: 0,
                symlink_absolute_path_strategy: symlink_absolute_path_strategy::Value::Allowed
                    as i32,
                supported_compressors: vec![compressor::Value::Zstd as i32],
                supported_batch_update_compressors: vec![compressor::Value::Zstd as i32],
                blob_splice_support: true,
            }),
            low_api_version: Some(SemVer {
                major: 2,
                ..Default::default()
            }),
            high_api_version: Some(SemVer {
                major: 2,
                minor: 3,
                ..Default::default()
            }),
        };

        Ok(Response::new(response))
    }
}
