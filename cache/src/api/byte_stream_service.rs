// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::sync::Arc;

use async_compression::tokio::bufread::ZstdDecoder;
use digest::validate_hash;
use futures::{Stream, StreamExt};
use protos::google::bytestream::byte_stream_server::ByteStream;
use protos::google::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use storage::driver::{BoxBlobStream, EntryKind};
use storage::zstd;
use tokio::io::{AsyncWriteExt, BufReader};
use tonic::{Request, Response, Status, Streaming};

use crate::api::{rechunk, InnerServer};
use crate::MAX_CHUNK_SIZE;

/// Capacity of the in-memory pipe pairing the receive loop with the storage put.
const PIPE_CAPACITY: usize = 64 * 1024;

pub(super) struct ByteStreamService {
    pub(super) inner: Arc<InnerServer>,
}

/// The compression encoded in a bytestream resource name. Only the lowercase literal `zstd`
/// is recognized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Compression {
    Identity,
    Zstd,
}

/// Path segments that may not appear inside an instance name.
const RESERVED_SEGMENTS: &[&str] = &["blobs", "uploads", "compressed-blobs"];

fn instance_name<'a>(
    resource: &'a str,
    parts: &[&'a str],
    marker_index: usize,
) -> Result<&'a str, String> {
    let instance_parts = &parts[0..marker_index];
    for part in instance_parts {
        if RESERVED_SEGMENTS.contains(part) {
            return Err(format!(
                "Malformed resource name: instance name contains reserved segment {part:?}"
            ));
        }
    }
    if instance_parts.is_empty() {
        Ok("")
    } else {
        let last_instance_name_index =
            instance_parts.iter().map(|x| (*x).len()).sum::<usize>() + instance_parts.len() - 1;
        Ok(&resource[0..last_instance_name_index])
    }
}

/// Decimal-only int64 size parsing; negatives, signs and overflow are all rejected.
fn parse_size(part: &str) -> Result<i64, String> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("Malformed resource name: cannot parse size {part:?}"));
    }
    part.parse::<i64>()
        .map_err(|_| format!("Malformed resource name: size out of range {part:?}"))
}

#[derive(Debug, Eq, PartialEq)]
struct ParsedReadResourceName<'a> {
    instance_name: &'a str,
    hash: &'a str,
    size: i64,
    compression: Compression,
}

/// Parses a read resource name of the form `{instance_name}/blobs/{hash}/{size}` or
/// `{instance_name}/compressed-blobs/zstd/{hash}/{size}` into a struct with references to
/// the individual components. The `{instance_name}` may be blank (with no leading slash).
/// Trailing segments after the size are forbidden on reads.
fn parse_read_resource_name(resource: &str) -> Result<ParsedReadResourceName<'_>, String> {
    if resource.is_empty() {
        return Err("Missing resource name".to_owned());
    }

    let parts: Vec<_> = resource.split('/').collect();

    let marker_index = parts
        .iter()
        .position(|p| *p == "blobs" || *p == "compressed-blobs")
        .ok_or_else(|| "Malformed resource name: missing `blobs` component".to_owned())?;
    let instance_name = instance_name(resource, &parts, marker_index)?;

    let (compression, hash_index) = if parts[marker_index] == "blobs" {
        (Compression::Identity, marker_index + 1)
    } else {
        match parts.get(marker_index + 1) {
            Some(&"zstd") => (Compression::Zstd, marker_index + 2),
            Some(other) => {
                return Err(format!(
                    "Malformed resource name: unsupported compressor {other:?}"
                ))
            }
            None => {
                return Err(
                    "Malformed resource name: missing compressor after `compressed-blobs`"
                        .to_owned(),
                )
            }
        }
    };

    if parts.len() < hash_index + 2 {
        return Err("Malformed resource name: not enough path components".to_owned());
    }
    if parts.len() > hash_index + 2 {
        return Err("Malformed resource name: unexpected trailing components".to_owned());
    }

    Ok(ParsedReadResourceName {
        instance_name,
        hash: parts[hash_index],
        size: parse_size(parts[hash_index + 1])?,
        compression,
    })
}

#[derive(Debug, Eq, PartialEq)]
struct ParsedWriteResourceName<'a> {
    instance_name: &'a str,
    uuid: &'a str,
    hash: &'a str,
    size: i64,
    compression: Compression,
}

/// Parses a write resource name of the form
/// `{instance_name}/uploads/{uuid}/blobs/{hash}/{size}` or
/// `{instance_name}/uploads/{uuid}/compressed-blobs/zstd/{hash}/{size}`. Extra components
/// after the size are tolerated (clients may append metadata there).
fn parse_write_resource_name(resource: &str) -> Result<ParsedWriteResourceName<'_>, String> {
    if resource.is_empty() {
        return Err("Missing resource name".to_owned());
    }

    let parts: Vec<_> = resource.split('/').collect();

    let uploads_index = parts
        .iter()
        .position(|p| *p == "uploads")
        .ok_or_else(|| "Malformed resource name: missing `uploads` component".to_owned())?;
    let instance_name = instance_name(resource, &parts, uploads_index)?;

    if (parts.len() - uploads_index) < 5 {
        return Err(
            "Malformed resource name: not enough path components after `uploads`".to_owned(),
        );
    }

    let uuid = parts[uploads_index + 1];
    if uuid.is_empty() {
        return Err("Malformed resource name: empty uuid".to_owned());
    }

    let (compression, hash_index) = match parts[uploads_index + 2] {
        "blobs" => (Compression::Identity, uploads_index + 3),
        "compressed-blobs" => match parts[uploads_index + 3] {
            "zstd" => (Compression::Zstd, uploads_index + 4),
            other => {
                return Err(format!(
                    "Malformed resource name: unsupported compressor {other:?}"
                ))
            }
        },
        _ => return Err("Malformed resource name: expected `blobs` component".to_owned()),
    };

    if parts.len() < hash_index + 2 {
        return Err("Malformed resource name: not enough path components".to_owned());
    }

    Ok(ParsedWriteResourceName {
        instance_name,
        uuid,
        hash: parts[hash_index],
        size: parse_size(parts[hash_index + 1])?,
        compression,
    })
}

/// Serve at most `limit` bytes from the stream, truncating the final chunk to fit.
fn enforce_read_limit(stream: BoxBlobStream, limit: usize) -> BoxBlobStream {
    Box::pin(async_stream::stream! {
        let mut remaining = limit;
        let mut stream = stream;
        while remaining > 0 {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    yield Err(err);
                    return;
                }
                None => return,
            };
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                yield Ok(chunk);
            } else {
                yield Ok(chunk.slice(0..remaining));
                return;
            }
        }
    })
}

enum RecvFailure {
    /// The client misbehaved or went away; its error is authoritative.
    Client(Status),
    /// The pipe's read end went away, meaning the storage put finished first. Its result is
    /// authoritative.
    PipeClosed,
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send + 'static>>;

    #[tracing::instrument(skip_all)]
    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let request = request.into_inner();

        let parsed =
            parse_read_resource_name(&request.resource_name).map_err(Status::invalid_argument)?;
        validate_hash(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;

        if request.read_offset < 0 {
            return Err(Status::out_of_range("negative read_offset"));
        }
        if request.read_limit < 0 {
            return Err(Status::out_of_range("negative read_limit"));
        }
        if parsed.compression == Compression::Zstd && request.read_limit != 0 {
            return Err(Status::invalid_argument(
                "read_limit is not supported for compressed-blobs",
            ));
        }
        if request.read_offset > parsed.size {
            return Err(Status::out_of_range(format!(
                "read_offset {} exceeds size of resource {}",
                request.read_offset, parsed.size
            )));
        }

        // The empty blob needs no storage round trip: identity reads carry no data at all,
        // compressed reads carry the canonical empty frame.
        if parsed.size == 0 {
            let stream: Self::ReadStream = match parsed.compression {
                Compression::Identity => Box::pin(futures::stream::empty()),
                Compression::Zstd => Box::pin(futures::stream::once(async {
                    Ok(ReadResponse {
                        data: zstd::empty_frame(),
                    })
                })),
            };
            return Ok(Response::new(stream));
        }

        let found = match parsed.compression {
            Compression::Zstd => {
                self.inner
                    .get_zstd_blob(parsed.hash, parsed.size, request.read_offset)
                    .await
            }
            Compression::Identity => {
                self.inner
                    .get_blob(EntryKind::Cas, parsed.hash, parsed.size, request.read_offset)
                    .await
            }
        };

        let (mut stream, _) = match found.map_err(Status::from)? {
            Some(found) => found,
            None => return Err(Status::not_found("")),
        };

        if parsed.compression == Compression::Identity && request.read_limit > 0 {
            stream = enforce_read_limit(stream, request.read_limit as usize);
        }

        let chunked = rechunk(stream, MAX_CHUNK_SIZE).map(|chunk| {
            chunk
                .map(|data| ReadResponse { data })
                .map_err(Status::from)
        });
        Ok(Response::new(Box::pin(chunked)))
    }

    /// Receive a blob from the client. The receive loop forwards chunk bytes into an
    /// in-memory pipe while a spawned put task drains the pipe into storage, so receiving
    /// and storing proceed in parallel with bounded memory. For zstd uploads the pipe's
    /// read end is wrapped in a streaming decoder so storage always sees uncompressed
    /// bytes.
    #[tracing::instrument(skip_all)]
    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();

        // The first message must carry the resource name to write to.
        let first_msg = match stream.next().await {
            Some(Ok(m)) => m,
            Some(Err(err)) => return Err(err),
            None => return Err(Status::cancelled("client disconnected")),
        };

        let parsed =
            parse_write_resource_name(&first_msg.resource_name).map_err(Status::invalid_argument)?;
        validate_hash(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;

        let size = parsed.size;
        let compression = parsed.compression;
        let hash = parsed.hash.to_owned();
        let resource_name = first_msg.resource_name.clone();

        // REAPI specifies -1 as the committed size for compressed uploads, where the number
        // of (compressed) bytes on the wire is not predictable.
        let committed_size = match compression {
            Compression::Identity => size,
            Compression::Zstd => -1,
        };

        // Early skip: if the blob already exists (the empty blob always does), reply with
        // the committed size without storing anything.
        let (exists, _) = self.inner.store.contains(EntryKind::Cas, &hash, size).await;
        if exists {
            return Ok(Response::new(WriteResponse { committed_size }));
        }

        if first_msg.write_offset != 0 {
            return Err(Status::invalid_argument(
                "resumable writes are not supported (write_offset must be 0)",
            ));
        }

        let (mut pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);

        let put_task = {
            let store = self.inner.store.clone();
            let hash = hash.clone();
            let content: BoxBlobStream = match compression {
                Compression::Identity => zstd::chunk_reader(pipe_reader, PIPE_CAPACITY),
                Compression::Zstd => {
                    zstd::chunk_reader(ZstdDecoder::new(BufReader::new(pipe_reader)), PIPE_CAPACITY)
                }
            };
            tokio::spawn(
                async move { store.put(EntryKind::Cas, &hash, size, content).await },
            )
        };

        let recv_result: Result<(), RecvFailure> = async {
            let mut received: i64 = 0;
            let mut next_msg = Some(first_msg);
            while let Some(msg) = next_msg.take() {
                // Subsequent messages may omit the resource name; a present one must match.
                if !msg.resource_name.is_empty() && msg.resource_name != resource_name {
                    return Err(RecvFailure::Client(Status::invalid_argument(
                        "resource_name changed mid-stream",
                    )));
                }
                if msg.write_offset != received {
                    return Err(RecvFailure::Client(Status::invalid_argument(format!(
                        "write_offset {} does not match {received} bytes received",
                        msg.write_offset
                    ))));
                }
                if compression == Compression::Identity
                    && received + msg.data.len() as i64 > size
                {
                    return Err(RecvFailure::Client(Status::out_of_range(
                        "write exceeds declared blob size",
                    )));
                }

                if !msg.data.is_empty() && pipe_writer.write_all(&msg.data).await.is_err() {
                    return Err(RecvFailure::PipeClosed);
                }
                received += msg.data.len() as i64;

                if msg.finish_write {
                    return Ok(());
                }

                next_msg = match stream.next().await {
                    Some(Ok(m)) => Some(m),
                    Some(Err(status)) => {
                        return Err(RecvFailure::Client(Status::cancelled(format!(
                            "client stream error: {status}"
                        ))))
                    }
                    None => {
                        return Err(RecvFailure::Client(Status::cancelled(
                            "write stream closed without specifying finish_write",
                        )))
                    }
                };
            }
            Ok(())
        }
        .await;

        // Closing the write end delivers EOF (or unwinds an abandoned upload) to the put
        // task; it always terminates after this.
        drop(pipe_writer);

        let put_result = put_task
            .await
            .map_err(|err| Status::internal(format!("storage task failed: {err}")))?;

        match (recv_result, put_result) {
            (Ok(()), Ok(())) => {
                self.inner.enqueue_proxy_upload(EntryKind::Cas, &hash).await;
                Ok(Response::new(WriteResponse { committed_size }))
            }
            (Ok(()), Err(err)) => Err(err.into()),
            // The broken pipe was caused by the put ending first; its error is the real one.
            (Err(RecvFailure::PipeClosed), Err(err)) => Err(err.into()),
            (Err(RecvFailure::PipeClosed), Ok(())) => {
                Err(Status::internal("pipe closed before the upload completed"))
            }
            (Err(RecvFailure::Client(status)), _) => Err(status),
        }
    }

    /// Report whether a write resource has already been committed. Resumable writes are not
    /// supported, so the answer is all-or-nothing: `{size, true}` when the blob exists and
    /// `{0, false}` otherwise. The empty blob is always complete.
    #[tracing::instrument(skip_all)]
    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let request = request.into_inner();
        let parsed =
            parse_write_resource_name(&request.resource_name).map_err(Status::invalid_argument)?;
        validate_hash(parsed.hash, parsed.size).map_err(Status::invalid_argument)?;

        let (present, _) = self
            .inner
            .store
            .contains(EntryKind::Cas, parsed.hash, parsed.size)
            .await;

        Ok(Response::new(QueryWriteStatusResponse {
            committed_size: if present { parsed.size } else { 0 },
            complete: present,
        }))
    }
}
