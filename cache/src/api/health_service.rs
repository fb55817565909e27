// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;

use futures::Stream;
use protos::grpc::health::v1::health_check_response::ServingStatus;
use protos::grpc::health::v1::health_server::Health;
use protos::grpc::health::v1::{HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status};

/// Answers load-balancer health probes. The server has no degraded mode: if the process
/// answers at all, it is serving.
pub(super) struct HealthService;

#[tonic::async_trait]
impl Health for HealthService {
    #[tracing::instrument(skip_all)]
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("Not supported"))
    }
}
