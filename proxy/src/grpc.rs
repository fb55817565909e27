// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use protos::build::bazel::remote::asset::v1::{
    fetch_client::FetchClient, FetchBlobRequest, Qualifier,
};
use protos::build::bazel::remote::execution::v2::{
    action_cache_client::ActionCacheClient,
    content_addressable_storage_client::ContentAddressableStorageClient, ActionResult,
    Digest as ApiDigest, FindMissingBlobsRequest, GetActionResultRequest,
    UpdateActionResultRequest,
};
use protos::google::bytestream::{byte_stream_client::ByteStreamClient, ReadRequest, WriteRequest};
use storage::driver::{stream_of, BoxBlobStream, EntryKind, StorageError, UNKNOWN_SIZE};
use storage::consolidate_stream;

use crate::{ProxyBackend, UploadRequest};

/// Maximum bytes carried by a single ByteStream write message.
const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// A proxy backend speaking REAPI to another cache server: AC reads/writes via the
/// ActionCache service, CAS reads/writes via ByteStream, existence via FindMissingBlobs,
/// and size discovery for unknown-size CAS gets via the asset Fetch service's
/// `checksum.sri` qualifier.
pub struct GrpcProxy {
    cas: ContentAddressableStorageClient<Channel>,
    action_cache: ActionCacheClient<Channel>,
    bytestream: ByteStreamClient<Channel>,
    fetch: FetchClient<Channel>,
    instance_name: String,
}

fn status_to_error(status: Status) -> StorageError {
    let message = status.message().to_owned();
    match status.code() {
        Code::NotFound => StorageError::NotFound(message),
        Code::InvalidArgument => StorageError::InvalidArgument(message),
        Code::OutOfRange => StorageError::OutOfRange(message),
        Code::ResourceExhausted => StorageError::ResourceExhausted(message),
        Code::Cancelled => StorageError::Cancelled(message),
        Code::Unavailable => StorageError::Unavailable(message),
        Code::DataLoss => StorageError::DataLoss(message),
        _ => StorageError::Internal(message),
    }
}

impl GrpcProxy {
    pub fn new(address: &str, instance_name: impl Into<String>) -> Result<Self, String> {
        let endpoint = Endpoint::from_shared(address.to_owned())
            .map_err(|err| format!("invalid proxy address {address:?}: {err}"))?;
        let channel = endpoint.connect_lazy();
        Ok(GrpcProxy {
            cas: ContentAddressableStorageClient::new(channel.clone()),
            action_cache: ActionCacheClient::new(channel.clone()),
            bytestream: ByteStreamClient::new(channel.clone()),
            fetch: FetchClient::new(channel),
            instance_name: instance_name.into(),
        })
    }

    fn read_resource(&self, hash: &str, size_bytes: i64) -> String {
        if self.instance_name.is_empty() {
            format!("blobs/{hash}/{size_bytes}")
        } else {
            format!("{}/blobs/{hash}/{size_bytes}", self.instance_name)
        }
    }

    fn upload_resource(&self, hash: &str, size_bytes: i64) -> String {
        let uuid = new_upload_uuid();
        if self.instance_name.is_empty() {
            format!("uploads/{uuid}/blobs/{hash}/{size_bytes}")
        } else {
            format!(
                "{}/uploads/{uuid}/blobs/{hash}/{size_bytes}",
                self.instance_name
            )
        }
    }

    /// Discover the size of a CAS blob the caller only knows by hash, by issuing a
    /// `FetchBlob` with the `checksum.sri` qualifier. The returned digest's size unlocks a
    /// subsequent ByteStream read.
    async fn resolve_size(&self, hash: &str) -> Result<Option<i64>, StorageError> {
        let raw_hash =
            hex::decode(hash).map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        let sri = format!(
            "sha256-{}",
            base64::engine::general_purpose::STANDARD.encode(raw_hash)
        );

        let request = FetchBlobRequest {
            instance_name: self.instance_name.clone(),
            qualifiers: vec![Qualifier {
                name: "checksum.sri".to_owned(),
                value: sri,
            }],
            ..Default::default()
        };

        let response = match self.fetch.clone().fetch_blob(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => return Ok(None),
            Err(status) => return Err(status_to_error(status)),
        };

        if let Some(status) = &response.status {
            if status.code != Code::Ok as i32 {
                return Ok(None);
            }
        }

        Ok(response.blob_digest.map(|d| d.size_bytes))
    }

    async fn get_cas(
        &self,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        let size_bytes = if size_bytes >= 0 {
            size_bytes
        } else {
            match self.resolve_size(hash).await? {
                Some(size) => size,
                None => return Ok(None),
            }
        };

        let request = ReadRequest {
            resource_name: self.read_resource(hash, size_bytes),
            read_offset: 0,
            read_limit: 0,
        };
        let response = match self.bytestream.clone().read(request).await {
            Ok(response) => response,
            Err(status) if status.code() == Code::NotFound => return Ok(None),
            Err(status) => return Err(status_to_error(status)),
        };

        let stream = response.into_inner().map(|message| {
            message
                .map(|m| m.data)
                .map_err(|status| StorageError::Unavailable(format!("proxy read: {status}")))
        });
        Ok(Some((Box::pin(stream), size_bytes)))
    }

    async fn get_action_result(
        &self,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        let request = GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(ApiDigest {
                hash: hash.to_owned(),
                size_bytes: size_bytes.max(0),
            }),
            ..Default::default()
        };

        let action_result = match self.action_cache.clone().get_action_result(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => return Ok(None),
            Err(status) => return Err(status_to_error(status)),
        };

        let encoded = Bytes::from(action_result.encode_to_vec());
        let logical_size = encoded.len() as i64;
        Ok(Some((stream_of(encoded), logical_size)))
    }

    async fn upload_cas(&self, request: UploadRequest) -> Result<(), StorageError> {
        let resource_name = self.upload_resource(&request.hash, request.logical_size);
        let logical_size = request.logical_size;
        let content = request.content;

        let message_stream = write_request_stream(resource_name, logical_size, content);

        let response = self
            .bytestream
            .clone()
            .write(message_stream)
            .await
            .map_err(status_to_error)?
            .into_inner();

        if response.committed_size >= 0 && response.committed_size != logical_size {
            return Err(StorageError::Internal(format!(
                "proxy committed {} bytes of {logical_size}",
                response.committed_size
            )));
        }
        Ok(())
    }

    async fn upload_action_result(&self, request: UploadRequest) -> Result<(), StorageError> {
        let raw = consolidate_stream(request.content).await?;
        if request.size_on_disk >= 0 && raw.len() as i64 != request.size_on_disk {
            return Err(StorageError::InvalidSize {
                expected_size: request.size_on_disk,
                actual_size: raw.len() as i64,
            });
        }

        let action_result = ActionResult::decode(raw)
            .map_err(|err| StorageError::DataLoss(format!("undecodable ActionResult: {err}")))?;

        let update = UpdateActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(ApiDigest {
                hash: request.hash.clone(),
                size_bytes: request.logical_size.max(0),
            }),
            action_result: Some(action_result),
            ..Default::default()
        };

        self.action_cache
            .clone()
            .update_action_result(update)
            .await
            .map_err(status_to_error)?;
        Ok(())
    }
}

#[async_trait]
impl ProxyBackend for GrpcProxy {
    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        match kind {
            EntryKind::Cas => self.get_cas(hash, size_bytes).await,
            EntryKind::Ac | EntryKind::Raw => self.get_action_result(hash, size_bytes).await,
        }
    }

    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64) {
        match kind {
            EntryKind::Cas => {
                let size_bytes = if size_bytes >= 0 {
                    size_bytes
                } else {
                    match self.resolve_size(hash).await {
                        Ok(Some(size)) => size,
                        _ => return (false, UNKNOWN_SIZE),
                    }
                };

                let request = FindMissingBlobsRequest {
                    instance_name: self.instance_name.clone(),
                    blob_digests: vec![ApiDigest {
                        hash: hash.to_owned(),
                        size_bytes,
                    }],
                    ..Default::default()
                };
                match self.cas.clone().find_missing_blobs(request).await {
                    Ok(response) if response.get_ref().missing_blob_digests.is_empty() => {
                        (true, size_bytes)
                    }
                    _ => (false, UNKNOWN_SIZE),
                }
            }
            EntryKind::Ac | EntryKind::Raw => {
                match self.get_action_result(hash, size_bytes).await {
                    Ok(Some((_, size))) => (true, size),
                    _ => (false, UNKNOWN_SIZE),
                }
            }
        }
    }

    async fn upload(&self, request: UploadRequest) -> Result<(), StorageError> {
        match request.kind {
            EntryKind::Cas => self.upload_cas(request).await,
            EntryKind::Ac | EntryKind::Raw => self.upload_action_result(request).await,
        }
    }
}

fn write_request_stream(
    resource_name: String,
    logical_size: i64,
    mut content: BoxBlobStream,
) -> impl futures::Stream<Item = WriteRequest> + Send + 'static {
    async_stream::stream! {
        let mut resource_name = Some(resource_name);
        let mut offset: i64 = 0;

        if logical_size == 0 {
            yield WriteRequest {
                resource_name: resource_name.take().unwrap_or_default(),
                write_offset: 0,
                finish_write: true,
                data: Bytes::new(),
            };
            return;
        }

        while let Some(chunk) = content.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(err) => {
                    // Ending the stream without finish_write makes the server reject
                    // the upload; the error surfaces through the RPC result.
                    log::error!("proxy upload source failed: {err}");
                    return;
                }
            };

            let mut position = 0;
            while position < chunk.len() {
                let end = (position + MAX_CHUNK_SIZE).min(chunk.len());
                let data = chunk.slice(position..end);
                let data_len = data.len() as i64;
                // Only the first message carries the resource name.
                yield WriteRequest {
                    resource_name: resource_name.take().unwrap_or_default(),
                    write_offset: offset,
                    finish_write: offset + data_len == logical_size,
                    data,
                };
                offset += data_len;
                position = end;
            }
        }
    }
}

fn new_upload_uuid() -> String {
    // The `rand` crate's thread-local RNG rather than `getrandom`, matching how the rest of
    // the workspace generates UUIDs.
    let bytes: [u8; 16] = rand::Rng::gen(&mut rand::thread_rng());
    uuid::Uuid::from_slice(&bytes).expect("16 bytes").to_string()
}
