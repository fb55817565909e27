// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_compression::tokio::bufread::ZstdDecoder;
use digest::validate_hash;
use futures::{Future, StreamExt};
use grpc_util::auth::AuthPolicy;
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prost::Message;
use protos::build::bazel::remote::execution::v2::ActionResult;
use storage::consolidate_stream;
use storage::driver::{stream_of, BoxBlobStream, EntryKind, StorageError, UNKNOWN_SIZE};
use storage::validate::validate_action_result;
use storage::zstd;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::api::InnerServer;

mod json;

/// Name of the request header carrying the authoritative uncompressed size of a PUT body.
/// Required when the body is zstd-framed, optional (overriding Content-Length) otherwise.
pub const DIGEST_SIZE_HEADER: &str = "X-Digest-SizeBytes";

/// Which half of the cache a request addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CacheSection {
    ActionCache,
    Cas,
}

#[derive(Debug, Eq, PartialEq)]
struct ParsedCachePath<'a> {
    instance_name: String,
    section: CacheSection,
    hash: &'a str,
}

/// Parses a cache URL path of the form `/[{instance}/]{ac|cas|cas.v2}/{hash}`. The optional
/// `.v2` suffix is accepted and treated as `cas`. The instance name may contain `/`.
fn parse_cache_path(path: &str) -> Result<ParsedCachePath<'_>, String> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() < 2 {
        return Err(format!("malformed cache path: {path:?}"));
    }

    let hash = parts[parts.len() - 1];
    validate_hash(hash, 0).map_err(|err| format!("malformed cache path: {err}"))?;

    let section = match parts[parts.len() - 2] {
        "ac" => CacheSection::ActionCache,
        "cas" | "cas.v2" => CacheSection::Cas,
        other => return Err(format!("unknown cache section {other:?}")),
    };

    Ok(ParsedCachePath {
        instance_name: parts[..parts.len() - 2].join("/"),
        section,
        hash,
    })
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

fn storage_error_response(err: StorageError) -> Response<Body> {
    let status = match &err {
        StorageError::NotFound(_) | StorageError::HttpStatus(404) => StatusCode::NOT_FOUND,
        StorageError::InvalidArgument(_)
        | StorageError::InvalidHash { .. }
        | StorageError::InvalidSize { .. }
        | StorageError::OutOfRange(_) => StatusCode::BAD_REQUEST,
        StorageError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, String::from(err))
}

/// Convert a hyper request body into the storage stream shape.
fn body_stream(body: Body) -> BoxBlobStream {
    Box::pin(body.map(|chunk| {
        chunk.map_err(|err| StorageError::Cancelled(format!("client body error: {err}")))
    }))
}

/// Wrap a zstd-framed stream in a streaming decoder so storage receives uncompressed
/// bytes. Producer errors close the frame early, which the decoder reports downstream.
fn decode_zstd_stream(mut input: BoxBlobStream) -> BoxBlobStream {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        while let Some(chunk) = input.next().await {
            match chunk {
                Ok(chunk) => {
                    if writer.write_all(&chunk).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    log::debug!("upload body failed mid-stream: {err}");
                    return;
                }
            }
        }
        let _ = writer.shutdown().await;
    });
    zstd::chunk_reader(ZstdDecoder::new(BufReader::new(reader)), 64 * 1024)
}

/// The REST surface of the cache: `GET|HEAD|PUT /[{instance}/]{ac|cas|cas.v2}/{hash}` plus
/// the `/status` page.
#[derive(Clone)]
pub struct HttpCacheHandler {
    inner: Arc<InnerServer>,
    auth_policy: AuthPolicy,
}

impl HttpCacheHandler {
    pub fn new(server: &crate::api::Server, auth_policy: AuthPolicy) -> Self {
        HttpCacheHandler {
            inner: server.inner(),
            auth_policy,
        }
    }

    pub async fn serve_with_shutdown<F>(
        self,
        address: SocketAddr,
        shutdown_signal: F,
    ) -> Result<(), hyper::Error>
    where
        F: Future<Output = ()>,
    {
        let make_svc = make_service_fn(move |_conn| {
            let handler = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.handle(request).await) }
                }))
            }
        });

        hyper::Server::bind(&address)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown_signal)
            .await
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let response = self.handle_inner(request).await;
        metrics::increment_counter!(
            "http_cache_requests_total",
            "method" => method.to_string(),
            "status" => response.status().as_u16().to_string(),
        );
        response
    }

    async fn handle_inner(&self, request: Request<Body>) -> Response<Body> {
        if self
            .auth_policy
            .check_http(request.method(), request.headers())
            .is_err()
        {
            let mut response = text_response(StatusCode::UNAUTHORIZED, "authentication required");
            response.headers_mut().insert(
                hyper::header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"cache\""),
            );
            return response;
        }

        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        if path == "/status" {
            return if method == Method::GET {
                self.status_page()
            } else {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            };
        }

        let parsed = match parse_cache_path(&path) {
            Ok(parsed) => parsed,
            Err(err) => return text_response(StatusCode::BAD_REQUEST, err),
        };

        let result = if method == Method::GET {
            self.handle_get(&parsed, &request).await
        } else if method == Method::HEAD {
            self.handle_head(&parsed).await
        } else if method == Method::PUT {
            let (parts, body) = request.into_parts();
            self.handle_put(&parsed, &parts.headers, body).await
        } else {
            Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ))
        };

        match result {
            Ok(response) => response,
            Err(err) => storage_error_response(err),
        }
    }

    fn status_page(&self) -> Response<Body> {
        let stats = self.inner.store.stats();
        let page = serde_json::json!({
            "MaxSize": stats.total_size,
            "ReservedSize": stats.reserved_size,
            "NumFiles": stats.num_items,
            "UncompressedSize": stats.uncompressed_size,
        });
        let mut response = Response::new(Body::from(page.to_string()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    async fn handle_get(
        &self,
        parsed: &ParsedCachePath<'_>,
        request: &Request<Body>,
    ) -> Result<Response<Body>, StorageError> {
        match parsed.section {
            CacheSection::ActionCache => {
                let key = self.inner.ac_key(&parsed.instance_name, parsed.hash);
                let found = self
                    .inner
                    .fetch_action_result(&key)
                    .await
                    .map_err(|status| StorageError::Internal(status.message().to_owned()))?;
                let (action_result, raw) = match found {
                    Some(found) => found,
                    None => return Ok(text_response(StatusCode::NOT_FOUND, "not found")),
                };

                let wants_json = request
                    .headers()
                    .get(hyper::header::ACCEPT)
                    .and_then(|v| v.to_str().ok())
                    .map(|accept| accept.contains("application/json"))
                    .unwrap_or(false);

                let mut response = if wants_json {
                    let rendered = json::action_result_to_json(&action_result).to_string();
                    let mut response = Response::new(Body::from(rendered));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    response
                } else {
                    let mut response = Response::new(Body::from(raw.clone()));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    );
                    response
                        .headers_mut()
                        .insert(CONTENT_LENGTH, HeaderValue::from(raw.len()));
                    response
                };
                response.headers_mut().insert(
                    hyper::header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                );
                Ok(response)
            }
            CacheSection::Cas => {
                let wants_zstd = request
                    .headers()
                    .get(hyper::header::ACCEPT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(|encodings| encodings.split(',').any(|e| e.trim() == "zstd"))
                    .unwrap_or(false);

                if wants_zstd {
                    let found = self
                        .inner
                        .get_zstd_blob(parsed.hash, UNKNOWN_SIZE, 0)
                        .await?;
                    let (stream, _) = match found {
                        Some(found) => found,
                        None => return Ok(text_response(StatusCode::NOT_FOUND, "not found")),
                    };
                    let mut response = Response::new(Body::wrap_stream(stream));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    );
                    // The compressed length is unknown up front; no Content-Length here.
                    response
                        .headers_mut()
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
                    Ok(response)
                } else {
                    let found = self
                        .inner
                        .get_blob(EntryKind::Cas, parsed.hash, UNKNOWN_SIZE, 0)
                        .await?;
                    let (stream, size) = match found {
                        Some(found) => found,
                        None => return Ok(text_response(StatusCode::NOT_FOUND, "not found")),
                    };
                    let mut response = Response::new(Body::wrap_stream(stream));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    );
                    response
                        .headers_mut()
                        .insert(CONTENT_LENGTH, HeaderValue::from(size));
                    Ok(response)
                }
            }
        }
    }

    async fn handle_head(
        &self,
        parsed: &ParsedCachePath<'_>,
    ) -> Result<Response<Body>, StorageError> {
        let (kind, key) = match parsed.section {
            CacheSection::ActionCache => (
                self.inner.ac_kind(),
                self.inner.ac_key(&parsed.instance_name, parsed.hash),
            ),
            CacheSection::Cas => (EntryKind::Cas, parsed.hash.to_owned()),
        };

        let (present, size) = self
            .inner
            .contains_with_proxy(kind, &key, UNKNOWN_SIZE)
            .await;
        if !present {
            return Ok(text_response(StatusCode::NOT_FOUND, ""));
        }

        let mut response = Response::new(Body::empty());
        if size >= 0 {
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(size));
        }
        Ok(response)
    }

    async fn handle_put(
        &self,
        parsed: &ParsedCachePath<'_>,
        headers: &hyper::HeaderMap,
        body: Body,
    ) -> Result<Response<Body>, StorageError> {
        let content_encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("identity");
        let zstd_encoded = match content_encoding {
            "identity" | "" => false,
            "zstd" => true,
            other => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    format!("unsupported Content-Encoding {other:?}"),
                ))
            }
        };

        // X-Digest-SizeBytes is the authoritative uncompressed size; Content-Length only
        // works for identity bodies.
        let declared_size: Option<i64> = match headers
            .get(DIGEST_SIZE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) => match value.parse::<i64>() {
                Ok(size) if size >= 0 => Some(size),
                _ => {
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        format!("malformed {DIGEST_SIZE_HEADER} header"),
                    ))
                }
            },
            None if zstd_encoded => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    format!("{DIGEST_SIZE_HEADER} is required for zstd-encoded uploads"),
                ))
            }
            None => match headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok()) {
                Some(value) => match value.parse::<i64>() {
                    Ok(size) if size >= 0 => Some(size),
                    _ => {
                        return Ok(text_response(
                            StatusCode::BAD_REQUEST,
                            "malformed Content-Length header",
                        ))
                    }
                },
                None => {
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        format!("Content-Length or {DIGEST_SIZE_HEADER} is required"),
                    ))
                }
            },
        };
        let logical_size = declared_size.unwrap_or(UNKNOWN_SIZE);

        let mut content = body_stream(body);
        if zstd_encoded {
            content = decode_zstd_stream(content);
        }

        match parsed.section {
            CacheSection::Cas => {
                if logical_size == 0 && parsed.hash != digest::EMPTY_HASH_HEX {
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        "zero-length upload for a non-empty digest",
                    ));
                }

                self.inner
                    .store
                    .put(EntryKind::Cas, parsed.hash, logical_size, content)
                    .await?;
                self.inner
                    .enqueue_proxy_upload(EntryKind::Cas, parsed.hash)
                    .await;
                Ok(Response::new(Body::empty()))
            }
            CacheSection::ActionCache => {
                let raw = consolidate_stream(content).await?;
                if logical_size >= 0 && raw.len() as i64 != logical_size {
                    return Err(StorageError::InvalidSize {
                        expected_size: logical_size,
                        actual_size: raw.len() as i64,
                    });
                }

                let action_result = match ActionResult::decode(raw.clone()) {
                    Ok(action_result) => action_result,
                    Err(err) => {
                        return Ok(text_response(
                            StatusCode::BAD_REQUEST,
                            format!("malformed ActionResult: {err}"),
                        ))
                    }
                };
                if self.inner.options.validate_ac_deps {
                    if let Err(err) = validate_action_result(&action_result) {
                        return Ok(text_response(StatusCode::BAD_REQUEST, String::from(err)));
                    }
                }

                let key = self.inner.ac_key(&parsed.instance_name, parsed.hash);
                let ac_kind = self.inner.ac_kind();
                self.inner
                    .store
                    .put(ac_kind, &key, raw.len() as i64, stream_of(raw))
                    .await?;
                self.inner.enqueue_proxy_upload(ac_kind, &key).await;
                Ok(Response::new(Body::empty()))
            }
        }
    }
}

#[cfg(test)]
mod tests;
