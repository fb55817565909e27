// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use digest::Digest;
use protos::build::bazel::remote::asset::v1::{
    fetch_server::Fetch, FetchBlobRequest, FetchBlobResponse,
};
use storage::driver::{stream_of, EntryKind, StorageError, UNKNOWN_SIZE};
use tonic::{Request, Response, Status};

use crate::api::InnerServer;

pub(super) struct AssetService {
    pub(super) inner: Arc<InnerServer>,
}

const CHECKSUM_SRI_QUALIFIER: &str = "checksum.sri";
const HTTP_HEADER_QUALIFIER_PREFIX: &str = "http_header:";
const HTTP_HEADER_URL_QUALIFIER_PREFIX: &str = "http_header_url:";

/// The qualifiers this service understands: an expected SHA-256 (the only strong one),
/// request headers applied to every URI, and request headers applied to one URI by index.
#[derive(Default)]
struct ParsedQualifiers {
    expected_hash: Option<String>,
    headers: Vec<(String, String)>,
    headers_by_uri: HashMap<usize, Vec<(String, String)>>,
}

fn parse_qualifiers(request: &FetchBlobRequest) -> Result<ParsedQualifiers, Status> {
    let mut parsed = ParsedQualifiers::default();

    for qualifier in &request.qualifiers {
        if qualifier.name == CHECKSUM_SRI_QUALIFIER {
            let encoded = qualifier.value.strip_prefix("sha256-").ok_or_else(|| {
                Status::invalid_argument(format!(
                    "unsupported checksum.sri value: {:?}",
                    qualifier.value
                ))
            })?;
            let raw = base64_decode(encoded).map_err(|err| {
                Status::invalid_argument(format!("invalid checksum.sri base64: {err}"))
            })?;
            if raw.len() != 32 {
                return Err(Status::invalid_argument(format!(
                    "checksum.sri decodes to {} bytes, expected 32",
                    raw.len()
                )));
            }
            parsed.expected_hash = Some(hex::encode(raw));
        } else if let Some(header_name) = qualifier.name.strip_prefix(HTTP_HEADER_QUALIFIER_PREFIX)
        {
            parsed
                .headers
                .push((header_name.to_owned(), qualifier.value.clone()));
        } else if let Some(rest) = qualifier.name.strip_prefix(HTTP_HEADER_URL_QUALIFIER_PREFIX) {
            let (index, header_name) = rest.split_once(':').ok_or_else(|| {
                Status::invalid_argument(format!("malformed qualifier name {:?}", qualifier.name))
            })?;
            let index: usize = index.parse().map_err(|_| {
                Status::invalid_argument(format!("malformed qualifier name {:?}", qualifier.name))
            })?;
            parsed
                .headers_by_uri
                .entry(index)
                .or_default()
                .push((header_name.to_owned(), qualifier.value.clone()));
        }
        // Other qualifiers carry no meaning for a cache; they are ignored.
    }

    Ok(parsed)
}

// The base64 crate lives behind this helper so only one spelling of the engine setup exists.
fn base64_decode(encoded: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| err.to_string())
}

fn response_for(status_code: tonic::Code, message: &str, uri: &str) -> FetchBlobResponse {
    FetchBlobResponse {
        status: Some(protos::google::rpc::Status {
            code: status_code as i32,
            message: message.to_owned(),
            ..Default::default()
        }),
        uri: uri.to_owned(),
        ..Default::default()
    }
}

impl AssetService {
    async fn store_fetched_blob(&self, body: Bytes) -> Result<Digest, StorageError> {
        let digest = Digest::of_bytes(&body);
        self.inner
            .store
            .put(
                EntryKind::Cas,
                &digest.hex(),
                digest.size_bytes,
                stream_of(body),
            )
            .await?;
        self.inner
            .enqueue_proxy_upload(EntryKind::Cas, &digest.hex())
            .await;
        Ok(digest)
    }
}

#[tonic::async_trait]
impl Fetch for AssetService {
    /// Resolve a blob by qualifier or download it from one of the request URIs into the
    /// CAS. URIs are tried in order; the first success wins.
    #[tracing::instrument(skip_all)]
    async fn fetch_blob(
        &self,
        request: Request<FetchBlobRequest>,
    ) -> Result<Response<FetchBlobResponse>, Status> {
        let request = request.into_inner();
        let qualifiers = parse_qualifiers(&request)?;

        // A known hash already present locally short-circuits any network fetch.
        if let Some(hash) = &qualifiers.expected_hash {
            let (present, size) = self
                .inner
                .store
                .contains(EntryKind::Cas, hash, UNKNOWN_SIZE)
                .await;
            if present {
                return Ok(Response::new(FetchBlobResponse {
                    status: Some(protos::google::rpc::Status::default()),
                    blob_digest: Some(protos::build::bazel::remote::execution::v2::Digest {
                        hash: hash.clone(),
                        size_bytes: size,
                    }),
                    ..Default::default()
                }));
            }
        }

        let client = {
            let mut builder = reqwest::Client::builder();
            if let Some(timeout) = &request.timeout {
                let duration = std::time::Duration::new(
                    timeout.seconds.max(0) as u64,
                    timeout.nanos.max(0) as u32,
                );
                if !duration.is_zero() {
                    builder = builder.timeout(duration);
                }
            }
            builder
                .build()
                .map_err(|err| Status::internal(format!("http client setup: {err}")))?
        };

        let mut resource_exhausted = false;

        for (index, uri) in request.uris.iter().enumerate() {
            let mut http_request = client.get(uri);
            for (name, value) in &qualifiers.headers {
                http_request = http_request.header(name, value);
            }
            if let Some(headers) = qualifiers.headers_by_uri.get(&index) {
                for (name, value) in headers {
                    http_request = http_request.header(name, value);
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("asset fetch of {uri} failed: {err}");
                    continue;
                }
            };
            if !response.status().is_success() {
                log::warn!("asset fetch of {uri}: HTTP {}", response.status());
                continue;
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    log::warn!("asset fetch of {uri}: body read failed: {err}");
                    continue;
                }
            };

            if let Some(expected_hash) = &qualifiers.expected_hash {
                let actual = Digest::of_bytes(&body);
                if actual.hex() != *expected_hash {
                    log::warn!(
                        "asset fetch of {uri}: content hash {} does not match checksum.sri {expected_hash}",
                        actual.hex()
                    );
                    continue;
                }
            }

            match self.store_fetched_blob(body).await {
                Ok(digest) => {
                    return Ok(Response::new(FetchBlobResponse {
                        status: Some(protos::google::rpc::Status::default()),
                        uri: uri.clone(),
                        blob_digest: Some(digest.into()),
                        ..Default::default()
                    }));
                }
                Err(StorageError::ResourceExhausted(message)) => {
                    log::warn!("asset fetch of {uri}: {message}");
                    resource_exhausted = true;
                }
                Err(err) => {
                    log::warn!("asset fetch of {uri}: store failed: {err}");
                }
            }
        }

        let response = if resource_exhausted {
            response_for(tonic::Code::ResourceExhausted, "cache is full", "")
        } else {
            response_for(tonic::Code::NotFound, "no uri could be fetched", "")
        };
        Ok(Response::new(response))
    }
}
