// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::convert::TryInto;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use digest::{required_digest, validate_hash, Digest};
use futures::{Stream, StreamExt};
use prost::Message;
use sha2::{Digest as Sha2Digest, Sha256};
use tonic::{Request, Response, Status};

use protos::build::bazel::remote::execution::v2::{
    batch_read_blobs_response, batch_update_blobs_response, compressor,
    content_addressable_storage_server::ContentAddressableStorage, digest_function,
    BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, Digest as ApiDigest, Directory, FindMissingBlobsRequest,
    FindMissingBlobsResponse, GetTreeRequest, GetTreeResponse, SpliceBlobRequest,
    SpliceBlobResponse,
};
use storage::consolidate_stream;
use storage::driver::{stream_of, BoxBlobStream, EntryKind, StorageError};
use storage::zstd;

use crate::api::{convert_digests, InnerServer};

pub(super) struct CasService {
    pub(super) inner: Arc<InnerServer>,
}

fn ok_status() -> protos::google::rpc::Status {
    protos::google::rpc::Status {
        code: protos::google::rpc::Code::Ok as i32,
        ..protos::google::rpc::Status::default()
    }
}

fn rpc_status(code: protos::google::rpc::Code, message: impl Into<String>) -> protos::google::rpc::Status {
    protos::google::rpc::Status {
        code: code as i32,
        message: message.into(),
        ..protos::google::rpc::Status::default()
    }
}

impl CasService {
    /// Reads a single blob and consolidates all chunks into a single `Bytes`, in the
    /// compression the client accepts. Returns the response struct used by the
    /// `batch_read_blobs` RPC implementation.
    async fn read_blob(
        &self,
        api_digest: ApiDigest,
        accept_zstd: bool,
    ) -> batch_read_blobs_response::Response {
        fn make_response(
            digest: ApiDigest,
            code: protos::google::rpc::Code,
            message: impl Into<String>,
        ) -> batch_read_blobs_response::Response {
            batch_read_blobs_response::Response {
                digest: Some(digest),
                data: Bytes::default(),
                compressor: compressor::Value::Identity as i32,
                status: Some(rpc_status(code, message)),
            }
        }

        let digest: Digest = match api_digest.clone().try_into() {
            Ok(digest) => digest,
            Err(_) => {
                return make_response(
                    api_digest,
                    protos::google::rpc::Code::InvalidArgument,
                    "Invalid digest",
                );
            }
        };

        let found = if accept_zstd {
            self.inner
                .get_zstd_blob(&digest.hex(), digest.size_bytes, 0)
                .await
        } else {
            self.inner
                .get_blob(EntryKind::Cas, &digest.hex(), digest.size_bytes, 0)
                .await
        };

        let stream = match found {
            Ok(Some((stream, _))) => stream,
            Ok(None) => {
                return make_response(api_digest, protos::google::rpc::Code::NotFound, "");
            }
            Err(err) => {
                // Historical client behavior treats any error as a recoverable miss; the
                // true cause is only recorded here.
                log::error!("batch read of {api_digest:?} failed: {err}");
                metrics::increment_counter!("cache_batch_read_failures_total");
                return make_response(api_digest, protos::google::rpc::Code::NotFound, "");
            }
        };

        let data = match consolidate_stream(stream).await {
            Ok(data) => data,
            Err(err) => {
                log::error!("batch read of {api_digest:?} failed mid-stream: {err}");
                metrics::increment_counter!("cache_batch_read_failures_total");
                return make_response(api_digest, protos::google::rpc::Code::NotFound, "");
            }
        };

        if !accept_zstd && data.len() as i64 != digest.size_bytes {
            log::error!(
                "batch read of {api_digest:?}: wrong size (expected={}, actual={})",
                digest.size_bytes,
                data.len()
            );
            metrics::increment_counter!("cache_batch_read_failures_total");
            return make_response(api_digest, protos::google::rpc::Code::NotFound, "");
        }

        batch_read_blobs_response::Response {
            digest: Some(api_digest),
            data,
            compressor: if accept_zstd {
                compressor::Value::Zstd as i32
            } else {
                compressor::Value::Identity as i32
            },
            status: Some(ok_status()),
        }
    }

    /// Write a single blob given a `Bytes` with the entire (possibly compressed) content.
    /// (This is used by `batch_update_blobs`.)
    async fn write_blob(
        &self,
        api_digest_opt: Option<ApiDigest>,
        data: Bytes,
        compressor_value: i32,
    ) -> batch_update_blobs_response::Response {
        fn make_response(
            digest: Option<ApiDigest>,
            code: protos::google::rpc::Code,
            message: impl Into<String>,
        ) -> batch_update_blobs_response::Response {
            batch_update_blobs_response::Response {
                digest,
                status: Some(rpc_status(code, message)),
            }
        }

        let api_digest = match api_digest_opt.clone() {
            Some(api_digest) => api_digest,
            None => {
                return make_response(
                    api_digest_opt,
                    protos::google::rpc::Code::InvalidArgument,
                    "Missing digest",
                );
            }
        };

        let digest: Digest = match api_digest.try_into() {
            Ok(digest) => digest,
            Err(_) => {
                return make_response(
                    api_digest_opt,
                    protos::google::rpc::Code::InvalidArgument,
                    "Invalid digest",
                );
            }
        };

        // Batch payloads are bounded by the batch size limit, so zstd entries are decoded
        // in memory and stored uncompressed.
        let data = if compressor_value == compressor::Value::Zstd as i32 {
            match zstd::codec().decompress(&data, digest.size_bytes as usize) {
                Ok(decoded) => Bytes::from(decoded),
                Err(err) => {
                    return make_response(
                        api_digest_opt,
                        protos::google::rpc::Code::InvalidArgument,
                        format!("{err}"),
                    );
                }
            }
        } else if compressor_value == compressor::Value::Identity as i32 {
            data
        } else {
            return make_response(
                api_digest_opt,
                protos::google::rpc::Code::InvalidArgument,
                format!("unsupported compressor {compressor_value}"),
            );
        };

        let write_result = self
            .inner
            .store
            .put(
                EntryKind::Cas,
                &digest.hex(),
                digest.size_bytes,
                stream_of(data),
            )
            .await;

        match write_result {
            Ok(()) => {
                self.inner
                    .enqueue_proxy_upload(EntryKind::Cas, &digest.hex())
                    .await;
                make_response(api_digest_opt, protos::google::rpc::Code::Ok, "")
            }
            Err(StorageError::InvalidHash { .. } | StorageError::InvalidSize { .. }) => {
                make_response(
                    api_digest_opt,
                    protos::google::rpc::Code::InvalidArgument,
                    "content does not match digest",
                )
            }
            Err(StorageError::ResourceExhausted(message)) => make_response(
                api_digest_opt,
                protos::google::rpc::Code::ResourceExhausted,
                message,
            ),
            Err(err) => make_response(
                api_digest_opt,
                protos::google::rpc::Code::Internal,
                String::from(err),
            ),
        }
    }

    /// Stream every chunk through the given visitor, failing with NotFound on the first
    /// missing chunk. Used both for computing the digest of a splice result and for feeding
    /// the assembled blob into storage.
    fn chunk_stream(&self, chunks: Vec<Digest>) -> BoxBlobStream {
        let inner = self.inner.clone();
        Box::pin(async_stream::stream! {
            for chunk in chunks {
                let found = match inner.get_blob(EntryKind::Cas, &chunk.hex(), chunk.size_bytes, 0).await {
                    Ok(found) => found,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let (mut stream, _) = match found {
                    Some(found) => found,
                    None => {
                        yield Err(StorageError::NotFound(format!("missing chunk {chunk:?}")));
                        return;
                    }
                };
                while let Some(piece) = stream.next().await {
                    match piece {
                        Ok(piece) => yield Ok(piece),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasService {
    #[tracing::instrument(skip_all)]
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let digests = convert_digests(request.blob_digests)?;
        let missing_digests = self
            .inner
            .store
            .find_missing_cas_blobs(digests)
            .await
            .map_err(Status::from)?;
        let response = FindMissingBlobsResponse {
            missing_blob_digests: missing_digests.into_iter().map(|d| d.into()).collect(),
        };
        Ok(Response::new(response))
    }

    #[tracing::instrument(skip_all)]
    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let request = request.into_inner();

        let write_futures: Vec<_> = request
            .requests
            .into_iter()
            .map(|req| self.write_blob(req.digest, req.data, req.compressor))
            .collect();

        let responses = futures::future::join_all(write_futures).await;

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    #[tracing::instrument(skip_all)]
    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let request = request.into_inner();
        let accept_zstd = request
            .acceptable_compressors
            .contains(&(compressor::Value::Zstd as i32));

        let read_futures: Vec<_> = request
            .digests
            .into_iter()
            .map(|digest| self.read_blob(digest, accept_zstd))
            .collect();

        let responses = futures::future::join_all(read_futures).await;

        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream =
        Pin<Box<dyn Stream<Item = Result<GetTreeResponse, Status>> + Send + 'static>>;

    /// Traverse the directory tree rooted at the request digest and return every Directory
    /// in it. The traversal is best-effort: missing children are logged and skipped.
    /// The entire result is currently sent as a single message.
    /// TODO: honor page_size and emit next_page_token for very large trees.
    #[tracing::instrument(skip_all)]
    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        let request = request.into_inner();
        let root_digest =
            required_digest("root_digest", request.root_digest).map_err(Status::invalid_argument)?;

        let mut directories = Vec::new();
        let mut pending = vec![root_digest];
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut is_root = true;

        while let Some(digest) = pending.pop() {
            if !seen.insert(digest) {
                continue;
            }

            let found = self
                .inner
                .get_blob(EntryKind::Cas, &digest.hex(), digest.size_bytes, 0)
                .await
                .map_err(Status::from)?;
            let (stream, _) = match found {
                Some(found) => found,
                None if is_root => return Err(Status::not_found("root directory not found")),
                None => {
                    log::warn!("get_tree: missing child directory {digest:?}; skipping");
                    continue;
                }
            };
            is_root = false;

            let raw = consolidate_stream(stream).await.map_err(Status::from)?;
            let directory = Directory::decode(raw)
                .map_err(|err| Status::data_loss(format!("undecodable Directory: {err}")))?;

            for child in &directory.directories {
                if let Some(child_digest) = &child.digest {
                    match Digest::new(&child_digest.hash, child_digest.size_bytes) {
                        Ok(child_digest) => pending.push(child_digest),
                        Err(err) => {
                            log::warn!("get_tree: invalid child digest: {err}; skipping");
                        }
                    }
                }
            }

            directories.push(directory);
        }

        let response = GetTreeResponse {
            directories,
            next_page_token: String::new(),
        };
        let stream = futures::stream::once(async move { Ok(response) });
        Ok(Response::new(Box::pin(stream)))
    }

    /// Assemble a new CAS blob by concatenating already-stored chunks, without buffering the
    /// whole result in memory.
    #[tracing::instrument(skip_all)]
    async fn splice_blob(
        &self,
        request: Request<SpliceBlobRequest>,
    ) -> Result<Response<SpliceBlobResponse>, Status> {
        let request = request.into_inner();

        if request.digest_function != digest_function::Value::Unknown as i32
            && request.digest_function != digest_function::Value::Sha256 as i32
        {
            return Err(Status::invalid_argument(
                "only the SHA256 digest function is supported",
            ));
        }

        if request.chunk_digests.is_empty() {
            return Err(Status::invalid_argument("no chunks to splice"));
        }

        let mut chunks = Vec::with_capacity(request.chunk_digests.len());
        let mut total_size: i64 = 0;
        for chunk in &request.chunk_digests {
            validate_hash(&chunk.hash, chunk.size_bytes).map_err(Status::invalid_argument)?;
            if chunk.size_bytes <= 0 || chunk.hash == digest::EMPTY_HASH_HEX {
                return Err(Status::invalid_argument(format!(
                    "the empty blob cannot be a splice chunk: {}/{}",
                    chunk.hash, chunk.size_bytes
                )));
            }
            total_size = total_size.checked_add(chunk.size_bytes).ok_or_else(|| {
                Status::invalid_argument("sum of chunk sizes overflows int64")
            })?;
            chunks.push(
                Digest::new(&chunk.hash, chunk.size_bytes).map_err(Status::invalid_argument)?,
            );
        }

        let blob_digest = match request.blob_digest {
            Some(api_digest) => {
                let supplied: Digest = api_digest
                    .try_into()
                    .map_err(|err: String| Status::invalid_argument(err))?;
                if supplied.size_bytes != total_size {
                    return Err(Status::invalid_argument(format!(
                        "blob digest size {} does not match sum of chunk sizes {total_size}",
                        supplied.size_bytes
                    )));
                }
                supplied
            }
            None => {
                // Compute the digest by streaming all chunks once through a hasher.
                let mut hasher = Sha256::default();
                let mut hashed: i64 = 0;
                let mut stream = self.chunk_stream(chunks.clone());
                while let Some(piece) = stream.next().await {
                    let piece = piece.map_err(Status::from)?;
                    hasher.update(&piece[..]);
                    hashed += piece.len() as i64;
                }
                if hashed != total_size {
                    return Err(Status::invalid_argument(format!(
                        "chunks provided {hashed} bytes but their digests sum to {total_size}"
                    )));
                }
                let computed = hasher.finalize();
                Digest::from_slice(computed.as_slice(), total_size).map_err(Status::internal)?
            }
        };

        let hash = blob_digest.hex();
        let (present, _) = self
            .inner
            .store
            .contains(EntryKind::Cas, &hash, total_size)
            .await;
        if !present {
            // Feed the chunks sequentially into the store. A missing chunk fails the stream
            // with NotFound; a storage failure surfaces as the put error.
            let assembled = self.chunk_stream(chunks);
            self.inner
                .store
                .put(EntryKind::Cas, &hash, total_size, assembled)
                .await
                .map_err(Status::from)?;
        }

        self.inner.enqueue_proxy_upload(EntryKind::Cas, &hash).await;

        Ok(Response::new(SpliceBlobResponse {
            blob_digest: Some(blob_digest.into()),
        }))
    }
}
