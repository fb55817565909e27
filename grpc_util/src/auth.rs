// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![allow(clippy::result_large_err)]

use std::sync::Arc;

use base64::Engine;
use http::header::HeaderMap;
use serde::Deserialize;
use tonic::Status;

/// How incoming requests should be authenticated.
#[derive(Copy, Clone, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Basic,
    DevOnlyNoAuth,
}

/// A username/password pair accepted by the server.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct BasicCredential {
    pub username: String,
    pub password: String,
}

/// The gRPC methods which only read cache state. When unauthenticated reads are allowed,
/// these (and only these) may be called without credentials.
pub const READ_ONLY_GRPC_METHODS: &[&str] = &[
    "/build.bazel.remote.execution.v2.ActionCache/GetActionResult",
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs",
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs",
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/GetTree",
    "/build.bazel.remote.execution.v2.Capabilities/GetCapabilities",
    "/google.bytestream.ByteStream/Read",
];

/// Health checks bypass authentication entirely so that load balancers can probe the server.
pub const HEALTH_CHECK_GRPC_METHOD: &str = "/grpc.health.v1.Health/Check";

/// Extract the basic-auth credential from the request's headers.
///
/// Logs if there are any issues with the header.
pub fn get_basic_credential(headers: &HeaderMap) -> Result<BasicCredential, Status> {
    fn get(headers: &HeaderMap) -> Result<BasicCredential, String> {
        let auth_value = headers
            .get(http::header::AUTHORIZATION)
            .ok_or("authorization header not provided")?
            .to_str()
            .map_err(|err| err.to_string())?;
        let encoded = auth_value
            .strip_prefix("Basic ")
            .ok_or_else(|| "authorization header did not start with `Basic `".to_owned())?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| format!("invalid base64 in authorization header: {err}"))?;
        let decoded =
            String::from_utf8(decoded).map_err(|err| format!("non-utf8 credential: {err}"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| "credential did not contain `:`".to_owned())?;
        Ok(BasicCredential {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    get(headers).map_err(|err| {
        log::error!("auth_failure: missing or malformed authorization header: {err}");
        Status::unauthenticated("missing or invalid authorization header")
    })
}

/// Check a provided credential against the configured set.
///
/// This intentionally returns a vague message for obfuscation/security, but it logs the
/// offending username.
pub fn validate_basic_credential(
    provided: &BasicCredential,
    allowed: &[BasicCredential],
) -> Result<(), Status> {
    if allowed.iter().any(|c| c == provided) {
        Ok(())
    } else {
        log::error!(
            "auth_failure: credentials for user {:?} not valid",
            provided.username
        );
        Err(Status::unauthenticated("invalid credentials"))
    }
}

/// Per-request authorization policy shared by the gRPC and HTTP surfaces.
#[derive(Clone)]
pub struct AuthPolicy {
    credentials: Arc<Vec<BasicCredential>>,
    allow_unauthenticated_reads: bool,
}

impl AuthPolicy {
    pub fn new(credentials: Vec<BasicCredential>, allow_unauthenticated_reads: bool) -> Self {
        AuthPolicy {
            credentials: Arc::new(credentials),
            allow_unauthenticated_reads,
        }
    }

    /// A policy that accepts every request. Used when no credentials are configured.
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), true)
    }

    fn requires_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Check an incoming gRPC request by its full method path.
    pub fn check_grpc(&self, path: &str, headers: &HeaderMap) -> Result<(), Status> {
        if !self.requires_credentials() || path == HEALTH_CHECK_GRPC_METHOD {
            return Ok(());
        }
        if self.allow_unauthenticated_reads && READ_ONLY_GRPC_METHODS.contains(&path) {
            return Ok(());
        }
        let credential = get_basic_credential(headers)?;
        validate_basic_credential(&credential, &self.credentials)
    }

    /// Check an incoming HTTP cache request. `GET` and `HEAD` are the read-only methods.
    pub fn check_http(&self, method: &http::Method, headers: &HeaderMap) -> Result<(), Status> {
        if !self.requires_credentials() {
            return Ok(());
        }
        if self.allow_unauthenticated_reads
            && (method == http::Method::GET || method == http::Method::HEAD)
        {
            return Ok(());
        }
        let credential = get_basic_credential(headers)?;
        validate_basic_credential(&credential, &self.credentials)
    }
}
