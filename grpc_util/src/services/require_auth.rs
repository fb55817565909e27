// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::task::{Context, Poll};

use hyper::header::HeaderValue;
use hyper::{Body, Request as HyperRequest, Response as HyperResponse};
use tonic::body::BoxBody;
use tonic::transport::NamedService;
use tonic::Code;
use tower::Service;

use crate::auth::AuthPolicy;

/// A `tower::Service` that authenticates gRPC requests before they reach an underlying
/// service. Requests that fail the policy are answered directly with an `UNAUTHENTICATED`
/// gRPC status and never reach the wrapped service.
#[derive(Clone)]
pub struct RequireAuth<S> {
    inner: S,
    policy: AuthPolicy,
}

impl<S> RequireAuth<S> {
    pub fn new(service: S, policy: AuthPolicy) -> Self {
        RequireAuth {
            inner: service,
            policy,
        }
    }
}

fn unauthenticated_response() -> HyperResponse<BoxBody> {
    let mut response = HyperResponse::new(tonic::body::empty_body());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    response
        .headers_mut()
        .insert("grpc-status", HeaderValue::from(Code::Unauthenticated as i32));
    response.headers_mut().insert(
        "grpc-message",
        HeaderValue::from_static("missing or invalid credentials"),
    );
    response
}

impl<S> Service<HyperRequest<Body>> for RequireAuth<S>
where
    S: Service<HyperRequest<Body>, Response = HyperResponse<BoxBody>>
        + NamedService
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: HyperRequest<Body>) -> Self::Future {
        let mut svc = self.inner.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            if policy
                .check_grpc(request.uri().path(), request.headers())
                .is_err()
            {
                return Ok(unauthenticated_response());
            }
            svc.call(request).await
        })
    }
}

impl<S: NamedService> NamedService for RequireAuth<S> {
    const NAME: &'static str = S::NAME;
}
