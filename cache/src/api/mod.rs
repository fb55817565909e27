// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::convert::TryInto;
use std::sync::Arc;

use bytes::Bytes;
use digest::Digest;
use futures::{Future, Stream, StreamExt};
use grpc_util::auth::AuthPolicy;
use grpc_util::infra::GrpcConfig;
use grpc_util::services::{GrpcMetrics, RequireAuth};
use itertools::{Either, Itertools};
use protos::build::bazel::remote::asset::v1::fetch_server::FetchServer;
use protos::build::bazel::remote::execution::v2 as remoting_protos;
use protos::build::bazel::remote::execution::v2::action_cache_server::ActionCacheServer;
use protos::build::bazel::remote::execution::v2::capabilities_server::CapabilitiesServer;
use protos::build::bazel::remote::execution::v2::content_addressable_storage_server::ContentAddressableStorageServer;
use protos::google::bytestream::byte_stream_server::ByteStreamServer;
use protos::grpc::health::v1::health_server::HealthServer;
use proxy::{ProxyBackend, UploadQueue, UploadRequest};
use storage::driver::{BlobStore, BoxBlobStream, EntryKind, StorageError, UNKNOWN_SIZE};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::CompressionEncoding;
use tonic::transport::server::Connected;
use tonic::Status;
use tower::ServiceBuilder;
use tower_http::metrics::in_flight_requests::InFlightRequestsCounter;
use tower_http::metrics::InFlightRequestsLayer;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;

use crate::api::action_cache_service::ActionCacheService;
use crate::api::asset_service::AssetService;
use crate::api::byte_stream_service::ByteStreamService;
use crate::api::capabilities_service::CapabilitiesService;
use crate::api::cas_service::CasService;
use crate::api::health_service::HealthService;

mod action_cache_service;
mod asset_service;
mod byte_stream_service;
mod capabilities_service;
mod cas_service;
mod health_service;

#[cfg(test)]
mod tests;

/// Behavior toggles for the cache surface, provided by the server binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheOptions {
    /// Validate stored ActionResults and confirm their referenced CAS blobs exist before
    /// returning them. When disabled, AC entries are served as raw bytes.
    pub validate_ac_deps: bool,

    /// Mangle AC keys with the instance name, namespacing instances on a shared store.
    pub mangle_ac_keys: bool,

    /// Serve the remote asset Fetch API.
    pub enable_asset_api: bool,
}

pub(crate) struct InnerServer {
    pub(crate) store: Arc<dyn BlobStore + Send + Sync + 'static>,
    pub(crate) proxy: Option<Arc<dyn ProxyBackend + 'static>>,
    pub(crate) upload_queue: Option<UploadQueue>,
    pub(crate) options: CacheOptions,
}

/// The `Server` implements the REAPI cache surface and adapts it to call into a `BlobStore`
/// implementation, with an optional read-through/write-behind proxy backend.
pub struct Server {
    inner: Arc<InnerServer>,
}

/// Convert a list of REAPI digests into the internal Digest type.
pub fn convert_digests(digests: Vec<remoting_protos::Digest>) -> Result<Vec<Digest>, Status> {
    let (digests, errors): (Vec<_>, Vec<_>) = digests
        .into_iter()
        .map(|d| d.try_into())
        .partition_map(|r: Result<Digest, String>| match r {
            Ok(d) => Either::Left(d),
            Err(e) => Either::Right(e),
        });

    if !errors.is_empty() {
        return Err(Status::invalid_argument(format!(
            "digest errors: {}",
            errors.join(", ")
        )));
    }

    Ok(digests)
}

impl InnerServer {
    /// The Action Cache key presented to storage for this request.
    pub(crate) fn ac_key(&self, instance_name: &str, hash: &str) -> String {
        crate::ac_key(self.options.mangle_ac_keys, instance_name, hash)
    }

    /// The namespace AC entries are stored under: validated when deps checking is on, raw
    /// otherwise.
    pub(crate) fn ac_kind(&self) -> EntryKind {
        if self.options.validate_ac_deps {
            EntryKind::Ac
        } else {
            EntryKind::Raw
        }
    }

    /// Local get with transparent read-through: a local miss consults the proxy backend and
    /// populates the local store while the caller's stream is served.
    pub(crate) async fn get_blob(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        if let Some(found) = self.store.get(kind, hash, size_bytes, offset).await? {
            return Ok(Some(found));
        }

        let backend = match &self.proxy {
            Some(backend) => backend.clone(),
            None => return Ok(None),
        };
        let (proxy_stream, actual_size) = match backend.get(kind, hash, size_bytes).await? {
            Some(found) => found,
            None => return Ok(None),
        };
        metrics::increment_counter!("cache_proxy_fills_total");

        if offset != 0 {
            // Offset reads are rare; fill the local store first, then serve from it.
            self.store.put(kind, hash, actual_size, proxy_stream).await?;
            return self.store.get(kind, hash, size_bytes, offset).await;
        }

        // Tee the proxy stream: the caller gets the bytes as they arrive while a spawned put
        // populates the local store. Local population is best-effort.
        let (fill_sender, fill_receiver) = tokio::sync::mpsc::channel::<Result<Bytes, StorageError>>(8);
        let store = self.store.clone();
        let fill_hash = hash.to_owned();
        tokio::spawn(async move {
            let fill_stream: BoxBlobStream = Box::pin(ReceiverStream::new(fill_receiver));
            if let Err(err) = store.put(kind, &fill_hash, actual_size, fill_stream).await {
                log::error!("proxy fill of {kind} {fill_hash} failed: {err}");
            }
        });

        let tee = async_stream::stream! {
            let mut proxy_stream = proxy_stream;
            while let Some(chunk) = proxy_stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        // A lagging local fill must not stall the caller.
                        let _ = fill_sender.try_send(Ok(chunk.clone()));
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        let _ = fill_sender.try_send(Err(err.clone()));
                        yield Err(err);
                        return;
                    }
                }
            }
        };

        Ok(Some((Box::pin(tee), actual_size)))
    }

    /// Like `get_blob` for zstd-framed CAS reads: a local miss fills from the proxy (which
    /// speaks identity) and then serves the zstd framing from the local store.
    pub(crate) async fn get_zstd_blob(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        if let Some(found) = self.store.get_zstd(hash, size_bytes, offset).await? {
            return Ok(Some(found));
        }

        let backend = match &self.proxy {
            Some(backend) => backend.clone(),
            None => return Ok(None),
        };
        let (proxy_stream, actual_size) = match backend.get(EntryKind::Cas, hash, size_bytes).await?
        {
            Some(found) => found,
            None => return Ok(None),
        };
        metrics::increment_counter!("cache_proxy_fills_total");

        self.store
            .put(EntryKind::Cas, hash, actual_size, proxy_stream)
            .await?;
        self.store.get_zstd(hash, size_bytes, offset).await
    }

    /// Fetch an ActionResult by storage key, consulting the proxy backend on a local miss.
    /// With dependency checking enabled the result has been validated and its referenced
    /// CAS blobs confirmed present; otherwise the raw stored bytes are decoded as-is.
    /// Returns the decoded record alongside its serialized form.
    pub(crate) async fn fetch_action_result(
        &self,
        key: &str,
    ) -> Result<Option<(remoting_protos::ActionResult, Bytes)>, Status> {
        use prost::Message;

        if self.options.validate_ac_deps {
            if let Some(found) = self
                .store
                .get_validated_action_result(key)
                .await
                .map_err(Status::from)?
            {
                return Ok(Some(found));
            }

            let backend = match &self.proxy {
                Some(backend) => backend.clone(),
                None => return Ok(None),
            };
            let (stream, _) = match backend
                .get(EntryKind::Ac, key, UNKNOWN_SIZE)
                .await
                .map_err(Status::from)?
            {
                Some(found) => found,
                None => return Ok(None),
            };
            let raw = storage::consolidate_stream(stream)
                .await
                .map_err(Status::from)?;
            if raw.is_empty() {
                return Ok(None);
            }

            // Populate locally, then serve through the validated path so the proxy's copy
            // is held to the same standard as direct writes.
            self.store
                .put(
                    EntryKind::Ac,
                    key,
                    raw.len() as i64,
                    storage::driver::stream_of(raw),
                )
                .await
                .map_err(Status::from)?;
            Ok(self
                .store
                .get_validated_action_result(key)
                .await
                .map_err(Status::from)?)
        } else {
            let found = self
                .get_blob(EntryKind::Raw, key, UNKNOWN_SIZE, 0)
                .await
                .map_err(Status::from)?;
            let (stream, _) = match found {
                Some(found) => found,
                None => return Ok(None),
            };
            let raw = storage::consolidate_stream(stream)
                .await
                .map_err(Status::from)?;
            let action_result =
                remoting_protos::ActionResult::decode(raw.clone()).map_err(|err| {
                    log::error!("Failed to decode ActionResult for key {key}: {err:?}");
                    Status::data_loss("Failed to decode ActionResult from storage")
                })?;
            Ok(Some((action_result, raw)))
        }
    }

    /// Like `contains` on the local store, falling back to the proxy backend.
    pub(crate) async fn contains_with_proxy(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
    ) -> (bool, i64) {
        let (present, actual_size) = self.store.contains(kind, hash, size_bytes).await;
        if present {
            return (present, actual_size);
        }
        match &self.proxy {
            Some(backend) => backend.contains(kind, hash, size_bytes).await,
            None => (false, UNKNOWN_SIZE),
        }
    }

    /// Relay a locally completed write to the proxy backend through the bounded queue.
    /// Never blocks and never surfaces errors to the caller.
    pub(crate) async fn enqueue_proxy_upload(&self, kind: EntryKind, hash: &str) {
        let queue = match &self.upload_queue {
            Some(queue) => queue.clone(),
            None => return,
        };

        match self.store.get(kind, hash, UNKNOWN_SIZE, 0).await {
            Ok(Some((content, size))) => queue.enqueue(UploadRequest {
                hash: hash.to_owned(),
                kind,
                logical_size: size,
                size_on_disk: size,
                content,
            }),
            Ok(None) => {
                log::debug!("not relaying {kind} {hash}: no longer present locally");
            }
            Err(err) => {
                log::error!("not relaying {kind} {hash}: {err}");
            }
        }
    }
}

/// Split a content stream into chunks of at most `max_chunk_size` bytes.
pub(crate) fn rechunk(stream: BoxBlobStream, max_chunk_size: usize) -> BoxBlobStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let mut position = 0;
            while position < chunk.len() {
                let end = (position + max_chunk_size).min(chunk.len());
                yield Ok(chunk.slice(position..end));
                position = end;
            }
        }
    })
}

impl Server {
    pub fn new(
        store: Box<dyn BlobStore + Send + Sync + 'static>,
        proxy: Option<Arc<dyn ProxyBackend + 'static>>,
        upload_queue: Option<UploadQueue>,
        options: CacheOptions,
    ) -> Self {
        Server {
            inner: Arc::new(InnerServer {
                store: Arc::from(store),
                proxy,
                upload_queue,
                options,
            }),
        }
    }

    pub(crate) fn inner(&self) -> Arc<InnerServer> {
        self.inner.clone()
    }

    pub async fn serve_with_incoming_shutdown<I, IO, IE, F>(
        self,
        incoming: I,
        shutdown_signal: F,
        grpc_config: Option<GrpcConfig>,
        auth_policy: AuthPolicy,
        in_flight_requests_counter: InFlightRequestsCounter,
    ) -> Result<(), tonic::transport::Error>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
        F: Future<Output = ()>,
    {
        let cas_server = ContentAddressableStorageServer::new(CasService {
            inner: self.inner.clone(),
        })
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

        let byte_stream_server = ByteStreamServer::new(ByteStreamService {
            inner: self.inner.clone(),
        })
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

        let action_cache_server = ActionCacheServer::new(ActionCacheService {
            inner: self.inner.clone(),
        })
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

        let capabilities_server = CapabilitiesServer::new(CapabilitiesService {
            inner: self.inner.clone(),
        });

        let health_server = HealthServer::new(HealthService);

        let asset_server = if self.inner.options.enable_asset_api {
            Some(FetchServer::new(AssetService {
                inner: self.inner.clone(),
            }))
        } else {
            None
        };

        let mut server = tonic::transport::Server::builder();
        if let Some(c) = grpc_config.as_ref() {
            server = c.apply_to_server(server);
        }

        let in_flight_requests_layer = InFlightRequestsLayer::new(in_flight_requests_counter);
        let auth_header_sensitive_layer =
            SetSensitiveHeadersLayer::new(vec![http::header::AUTHORIZATION]);

        let layer = ServiceBuilder::new()
            .layer(in_flight_requests_layer)
            .layer(auth_header_sensitive_layer)
            .into_inner();

        let router = server
            .layer(layer)
            .add_service(RequireAuth::new(
                GrpcMetrics::new(cas_server),
                auth_policy.clone(),
            ))
            .add_service(RequireAuth::new(
                GrpcMetrics::new(byte_stream_server),
                auth_policy.clone(),
            ))
            .add_service(RequireAuth::new(
                GrpcMetrics::new(action_cache_server),
                auth_policy.clone(),
            ))
            .add_service(RequireAuth::new(
                GrpcMetrics::new(capabilities_server),
                auth_policy.clone(),
            ))
            .add_service(RequireAuth::new(
                GrpcMetrics::new(health_server),
                auth_policy.clone(),
            ))
            .add_optional_service(
                asset_server.map(|s| RequireAuth::new(GrpcMetrics::new(s), auth_policy)),
            );

        router
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await
    }
}
