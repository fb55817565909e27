// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use grpc_util::auth::AuthPolicy;
use grpc_util::hyper::AddrIncomingWithStream;
use hyper::server::conn::AddrIncoming;
use prost::Message;
use protos::build::bazel::remote::execution::v2::{
    action_cache_client::ActionCacheClient, batch_read_blobs_response,
    batch_update_blobs_request, batch_update_blobs_response,
    capabilities_client::CapabilitiesClient, compressor,
    content_addressable_storage_client::ContentAddressableStorageClient,
    digest_function, symlink_absolute_path_strategy, ActionResult, BatchReadBlobsRequest,
    BatchUpdateBlobsRequest, BatchUpdateBlobsResponse, Digest as ApiDigest, Directory,
    DirectoryNode, ExecutedActionMetadata, FileNode, FindMissingBlobsRequest,
    GetActionResultRequest, GetTreeRequest, SpliceBlobRequest, UpdateActionResultRequest,
};
use protos::grpc::health::v1::health_check_response::ServingStatus;
use protos::grpc::health::v1::{health_client::HealthClient, HealthCheckRequest};
use protos::google::bytestream::{
    byte_stream_client::ByteStreamClient, QueryWriteStatusRequest, ReadRequest, WriteRequest,
    WriteResponse,
};
use proxy::{start_uploaders, ProxyBackend, UploadQueue, UploadRequest};
use storage::driver::{
    BlobStore, BoxBlobStream, EntryKind, MemoryStore, StorageError, UNKNOWN_SIZE,
};
use storage::testutil::{CountMethodCallsStore, TestData};
use storage::zstd;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tower_http::metrics::in_flight_requests::InFlightRequestsCounter;

use crate::api::{CacheOptions, Server};
use crate::MAX_CHUNK_SIZE;

/// Create a Tonic `Endpoint` from a string containing a schema and IP address/name.
fn create_endpoint(addr: &str) -> Result<Endpoint, String> {
    let uri =
        tonic::transport::Uri::try_from(addr).map_err(|err| format!("invalid address: {err}"))?;
    let endpoint = Channel::builder(uri);
    Ok(endpoint)
}

struct TestServer {
    pub local_addr: SocketAddr,
    shutdown_sender: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    fn channel(&self) -> Channel {
        let endpoint = create_endpoint(&format!("http://{}", self.local_addr)).unwrap();
        Channel::balance_list(vec![endpoint].into_iter())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(s) = self.shutdown_sender.take() {
            let _ = s.send(());
        }
    }
}

fn spawn_server<BS>(
    store: BS,
    proxy: Option<Arc<dyn ProxyBackend + 'static>>,
    upload_queue: Option<UploadQueue>,
    options: CacheOptions,
) -> TestServer
where
    BS: BlobStore + Send + Sync + 'static,
{
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let incoming = AddrIncoming::bind(&addr).expect("failed to bind port");
    let local_addr = incoming.local_addr();
    let incoming = AddrIncomingWithStream(incoming);

    let (shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let server = Server::new(Box::new(store), proxy, upload_queue, options);

        server
            .serve_with_incoming_shutdown(
                incoming,
                shutdown_receiver.map(drop),
                None,
                AuthPolicy::allow_all(),
                InFlightRequestsCounter::new(),
            )
            .await
            .unwrap();
    });

    TestServer {
        local_addr,
        shutdown_sender: Some(shutdown_sender),
    }
}

fn spawn_memory_server() -> TestServer {
    spawn_server(MemoryStore::new(), None, None, CacheOptions::default())
}

fn write_requests(resource_name: &str, content: Bytes, chunk_size: usize) -> Vec<WriteRequest> {
    let mut requests = Vec::new();
    let mut offset = 0usize;
    loop {
        let end = (offset + chunk_size).min(content.len());
        requests.push(WriteRequest {
            resource_name: if offset == 0 {
                resource_name.to_owned()
            } else {
                String::new()
            },
            write_offset: offset as i64,
            finish_write: end == content.len(),
            data: content.slice(offset..end),
        });
        offset = end;
        if offset == content.len() {
            return requests;
        }
    }
}

async fn upload_via_batch(channel: Channel, content: &TestData) {
    let mut cas_client = ContentAddressableStorageClient::new(channel);
    let request = BatchUpdateBlobsRequest {
        instance_name: "main".to_owned(),
        requests: vec![batch_update_blobs_request::Request {
            digest: Some(content.digest.into()),
            data: content.bytes.clone(),
            compressor: compressor::Value::Identity as i32,
        }],
        ..Default::default()
    };
    let response = cas_client
        .batch_update_blobs(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses[0].status.as_ref().unwrap().code,
        protos::google::rpc::Code::Ok as i32
    );
}

#[tokio::test]
async fn check_cas_apis() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut cas_client = ContentAddressableStorageClient::new(channel.clone());

    let content = TestData::from_static(b"foobar");

    // Verify that the digest is missing.
    let request = FindMissingBlobsRequest {
        instance_name: "main".to_owned(),
        blob_digests: vec![content.digest.into()],
        ..Default::default()
    };
    let response = cas_client.find_missing_blobs(request).await.unwrap();
    assert_eq!(
        response.into_inner().missing_blob_digests,
        vec![content.digest.into()]
    );

    // Write the blob to the storage.
    let write_request = BatchUpdateBlobsRequest {
        instance_name: "main".to_owned(),
        requests: vec![batch_update_blobs_request::Request {
            digest: Some(content.digest.into()),
            data: content.bytes.clone(),
            compressor: compressor::Value::Identity as i32,
        }],
        ..Default::default()
    };
    let response = cas_client
        .batch_update_blobs(write_request.clone())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response,
        BatchUpdateBlobsResponse {
            responses: vec![batch_update_blobs_response::Response {
                digest: Some(content.digest.into()),
                status: Some(protos::google::rpc::Status {
                    code: protos::google::rpc::Code::Ok as i32,
                    ..protos::google::rpc::Status::default()
                })
            }]
        }
    );

    // Verify that the digest is now present.
    let request = FindMissingBlobsRequest {
        instance_name: "main".to_owned(),
        blob_digests: vec![content.digest.into()],
        ..Default::default()
    };
    let response = cas_client.find_missing_blobs(request).await.unwrap();
    assert!(response.into_inner().missing_blob_digests.is_empty());

    // The empty blob is always present.
    let request = FindMissingBlobsRequest {
        instance_name: "main".to_owned(),
        blob_digests: vec![storage::Digest::EMPTY.into()],
        ..Default::default()
    };
    let response = cas_client.find_missing_blobs(request).await.unwrap();
    assert!(response.into_inner().missing_blob_digests.is_empty());

    // Read the digest back from the storage and verify its contents.
    let request = BatchReadBlobsRequest {
        instance_name: "main".to_owned(),
        digests: vec![content.digest.into()],
        ..Default::default()
    };
    let response = cas_client
        .batch_read_blobs(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses,
        vec![batch_read_blobs_response::Response {
            digest: Some(content.digest.into()),
            data: content.bytes.clone(),
            compressor: compressor::Value::Identity as i32,
            status: Some(protos::google::rpc::Status {
                code: protos::google::rpc::Code::Ok as i32,
                ..protos::google::rpc::Status::default()
            }),
        }]
    );

    // Confirm that re-writing it succeeds.
    let response = cas_client
        .batch_update_blobs(write_request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses[0].status.as_ref().unwrap().code,
        protos::google::rpc::Code::Ok as i32
    );

    // A missing digest reads back as a per-blob NOT_FOUND.
    let absent = TestData::from_static(b"never uploaded");
    let request = BatchReadBlobsRequest {
        instance_name: "main".to_owned(),
        digests: vec![absent.digest.into()],
        ..Default::default()
    };
    let response = cas_client
        .batch_read_blobs(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses[0].status.as_ref().unwrap().code,
        protos::google::rpc::Code::NotFound as i32
    );
}

#[tokio::test]
async fn check_batch_zstd_compressors() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut cas_client = ContentAddressableStorageClient::new(channel);

    let content = TestData::from_bytes(b"batch zstd content ".repeat(100).into());
    let compressed = Bytes::from(zstd::codec().compress(&content.bytes).unwrap());

    // Upload zstd-framed.
    let request = BatchUpdateBlobsRequest {
        instance_name: "main".to_owned(),
        requests: vec![batch_update_blobs_request::Request {
            digest: Some(content.digest.into()),
            data: compressed,
            compressor: compressor::Value::Zstd as i32,
        }],
        ..Default::default()
    };
    let response = cas_client
        .batch_update_blobs(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses[0].status.as_ref().unwrap().code,
        protos::google::rpc::Code::Ok as i32
    );

    // Read back zstd-framed.
    let request = BatchReadBlobsRequest {
        instance_name: "main".to_owned(),
        digests: vec![content.digest.into()],
        acceptable_compressors: vec![compressor::Value::Zstd as i32],
        ..Default::default()
    };
    let response = cas_client
        .batch_read_blobs(request)
        .await
        .unwrap()
        .into_inner();
    let blob_response = &response.responses[0];
    assert_eq!(
        blob_response.status.as_ref().unwrap().code,
        protos::google::rpc::Code::Ok as i32
    );
    assert_eq!(blob_response.compressor, compressor::Value::Zstd as i32);
    let decoded = zstd::codec()
        .decompress(&blob_response.data, content.bytes.len())
        .unwrap();
    assert_eq!(decoded, content.bytes);

    // An unsupported compressor on upload is a per-blob InvalidArgument.
    let request = BatchUpdateBlobsRequest {
        instance_name: "main".to_owned(),
        requests: vec![batch_update_blobs_request::Request {
            digest: Some(content.digest.into()),
            data: content.bytes.clone(),
            compressor: compressor::Value::Brotli as i32,
        }],
        ..Default::default()
    };
    let response = cas_client
        .batch_update_blobs(request)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.responses[0].status.as_ref().unwrap().code,
        protos::google::rpc::Code::InvalidArgument as i32
    );
}

#[tokio::test]
async fn check_bytestream_chunked_write_and_read() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut bs_client = ByteStreamClient::new(channel.clone());

    // A blob of 1.5 chunks, sent in two messages with the resource name only on the first.
    let content = TestData::from_bytes(vec![0xa5u8; MAX_CHUNK_SIZE * 3 / 2].into());
    let resource_name = format!(
        "main/uploads/u-12345/blobs/{}/{}",
        content.digest.hex(),
        content.digest.size_bytes
    );
    let requests = write_requests(&resource_name, content.bytes.clone(), MAX_CHUNK_SIZE);
    assert_eq!(requests.len(), 2);

    let response = bs_client
        .write(futures::stream::iter(requests))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response,
        WriteResponse {
            committed_size: content.digest.size_bytes
        }
    );

    // Read the content back across multiple messages.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut read_back = Vec::new();
    let mut messages = 0;
    while let Some(message) = stream.next().await {
        read_back.extend_from_slice(&message.unwrap().data);
        messages += 1;
    }
    assert!(messages > 1);
    assert_eq!(read_back, content.bytes);

    // Offset reads return the tail.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: content.digest.size_bytes - 10,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut tail = Vec::new();
    while let Some(message) = stream.next().await {
        tail.extend_from_slice(&message.unwrap().data);
    }
    assert_eq!(tail.len(), 10);

    // Reads past the end are OUT_OF_RANGE.
    let status = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: content.digest.size_bytes + 1,
            read_limit: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);
}

#[tokio::test]
async fn check_bytestream_zstd_write_and_read() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut bs_client = ByteStreamClient::new(channel.clone());

    let content = TestData::from_bytes(b"zstd bytestream content ".repeat(500).into());
    let compressed = Bytes::from(zstd::codec().compress(&content.bytes).unwrap());

    let resource_name = format!(
        "main/uploads/u-1/compressed-blobs/zstd/{}/{}",
        content.digest.hex(),
        content.digest.size_bytes
    );
    let requests = write_requests(&resource_name, compressed, 1024);
    let response = bs_client
        .write(futures::stream::iter(requests))
        .await
        .unwrap()
        .into_inner();
    // Compressed writes report -1 (REAPI's "unknown") as the committed size.
    assert_eq!(response.committed_size, -1);

    // The stored blob is the uncompressed content.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut read_back = Vec::new();
    while let Some(message) = stream.next().await {
        read_back.extend_from_slice(&message.unwrap().data);
    }
    assert_eq!(read_back, content.bytes);

    // A compressed read returns a decodable zstd frame.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/compressed-blobs/zstd/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut frame = Vec::new();
    while let Some(message) = stream.next().await {
        frame.extend_from_slice(&message.unwrap().data);
    }
    let decoded = zstd::codec().decompress(&frame, content.bytes.len()).unwrap();
    assert_eq!(decoded, content.bytes);

    // read_limit is not defined for compressed reads.
    let status = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/compressed-blobs/zstd/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn check_bytestream_empty_blob_reads() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut bs_client = ByteStreamClient::new(channel);

    // Identity: zero messages of data.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!("main/blobs/{}/0", digest::EMPTY_HASH_HEX),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut total = 0;
    while let Some(message) = stream.next().await {
        total += message.unwrap().data.len();
    }
    assert_eq!(total, 0);

    // Compressed: exactly the canonical empty frame.
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!("main/compressed-blobs/zstd/{}/0", digest::EMPTY_HASH_HEX),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut frame = Vec::new();
    while let Some(message) = stream.next().await {
        frame.extend_from_slice(&message.unwrap().data);
    }
    assert_eq!(frame, zstd::EMPTY_ZSTD_FRAME);
}

#[tokio::test]
async fn repeated_writes_of_one_digest_put_once() {
    let store = CountMethodCallsStore::new(MemoryStore::new());
    let put_count = store.put_count.clone();
    let server = spawn_server(store, None, None, CacheOptions::default());
    let channel = server.channel();

    let content = TestData::from_static(b"written just once");
    let resource_name = format!(
        "main/uploads/u-1/blobs/{}/{}",
        content.digest.hex(),
        content.digest.size_bytes
    );

    // First write stores the blob.
    let mut bs_client = ByteStreamClient::new(channel.clone());
    let requests = write_requests(&resource_name, content.bytes.clone(), 4);
    let response = bs_client
        .write(futures::stream::iter(requests))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.committed_size, content.digest.size_bytes);

    // A second write of the same digest is answered from the existence check alone.
    let requests = write_requests(&resource_name, content.bytes.clone(), 4);
    let response = bs_client
        .write(futures::stream::iter(requests))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.committed_size, content.digest.size_bytes);

    assert_eq!(put_count.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The content is intact.
    let mut stream = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap()
        .into_inner();
    let mut read_back = Vec::new();
    while let Some(message) = stream.next().await {
        read_back.extend_from_slice(&message.unwrap().data);
    }
    assert_eq!(read_back, content.bytes);
}

#[tokio::test]
async fn abandoned_write_stores_nothing() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut bs_client = ByteStreamClient::new(channel.clone());

    let content = TestData::from_static(b"this write never finishes");
    let resource_name = format!(
        "main/uploads/u-1/blobs/{}/{}",
        content.digest.hex(),
        content.digest.size_bytes
    );

    // Send a partial write and close the stream without finish_write.
    let requests = vec![WriteRequest {
        resource_name,
        write_offset: 0,
        finish_write: false,
        data: content.bytes.slice(0..4),
    }];
    let status = bs_client
        .write(futures::stream::iter(requests))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);

    // No partial blob was committed.
    let mut cas_client = ContentAddressableStorageClient::new(channel);
    let response = cas_client
        .find_missing_blobs(FindMissingBlobsRequest {
            instance_name: "main".to_owned(),
            blob_digests: vec![content.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        response.into_inner().missing_blob_digests,
        vec![content.digest.into()]
    );
}

#[tokio::test]
async fn check_query_write_status() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut bs_client = ByteStreamClient::new(channel.clone());

    let content = TestData::from_static(b"query me");
    let resource_name = format!(
        "main/uploads/u-1/blobs/{}/{}",
        content.digest.hex(),
        content.digest.size_bytes
    );

    // Absent: {0, false}.
    let response = bs_client
        .query_write_status(QueryWriteStatusRequest {
            resource_name: resource_name.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.committed_size, 0);
    assert!(!response.complete);

    // The empty blob is always complete.
    let response = bs_client
        .query_write_status(QueryWriteStatusRequest {
            resource_name: format!("main/uploads/u-1/blobs/{}/0", digest::EMPTY_HASH_HEX),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.committed_size, 0);
    assert!(response.complete);

    // Present: {size, true}.
    upload_via_batch(channel, &content).await;
    let response = bs_client
        .query_write_status(QueryWriteStatusRequest { resource_name })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.committed_size, content.digest.size_bytes);
    assert!(response.complete);
}

#[tokio::test]
async fn check_ac_update_and_inline_get() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut ac_client = ActionCacheClient::new(channel);

    let action = TestData::from_static(b"the action");
    let input = ActionResult {
        exit_code: 42,
        stdout_raw: Bytes::from_static(b"pretend action stdout"),
        ..Default::default()
    };

    let updated = ac_client
        .update_action_result(UpdateActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(action.digest.into()),
            action_result: Some(input.clone()),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();

    // The server injects the peer as the worker.
    let worker = updated
        .execution_metadata
        .as_ref()
        .expect("execution metadata")
        .worker
        .clone();
    assert!(!worker.is_empty());

    // Reading back with inlining returns the input modulo the injected worker.
    let fetched = ac_client
        .get_action_result(GetActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(action.digest.into()),
            inline_stdout: true,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();

    let mut expected = input;
    expected.execution_metadata = Some(ExecutedActionMetadata {
        worker,
        ..Default::default()
    });
    assert_eq!(fetched, expected);

    // Without inlining the stdout is displaced to the CAS and referenced by digest.
    let fetched = ac_client
        .get_action_result(GetActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(action.digest.into()),
            inline_stdout: false,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(fetched.stdout_raw.is_empty());
    let stdout_digest = fetched.stdout_digest.expect("stdout digest");
    assert_eq!(
        stdout_digest.hash,
        storage::Digest::of_bytes(b"pretend action stdout").hex()
    );

    // A miss is NOT_FOUND.
    let absent = TestData::from_static(b"not an action");
    let status = ac_client
        .get_action_result(GetActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(absent.digest.into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn ac_update_rejects_malformed_results() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut ac_client = ActionCacheClient::new(channel);

    let action = TestData::from_static(b"the action");
    let malformed = ActionResult {
        output_files: vec![
            protos::build::bazel::remote::execution::v2::OutputFile {
                path: "/absolute/path".to_owned(),
                digest: Some(storage::Digest::EMPTY.into()),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let status = ac_client
        .update_action_result(UpdateActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(action.digest.into()),
            action_result: Some(malformed),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn check_splice_blob() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut cas_client = ContentAddressableStorageClient::new(channel.clone());

    let hello = TestData::from_static(b"hello");
    let world = TestData::from_static(b"world");
    let helloworld = TestData::from_static(b"helloworld");

    upload_via_batch(channel.clone(), &hello).await;
    upload_via_batch(channel.clone(), &world).await;

    // Splice with a supplied digest.
    let response = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: Some(helloworld.digest.into()),
            chunk_digests: vec![hello.digest.into(), world.digest.into()],
            digest_function: digest_function::Value::Sha256 as i32,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.blob_digest, Some(helloworld.digest.into()));

    // The assembled blob reads back as the concatenation.
    let response = cas_client
        .batch_read_blobs(BatchReadBlobsRequest {
            instance_name: "main".to_owned(),
            digests: vec![helloworld.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    let blob_response = &response.responses[0];
    assert_eq!(
        blob_response.status.as_ref().unwrap().code,
        protos::google::rpc::Code::Ok as i32
    );
    assert_eq!(blob_response.data, helloworld.bytes);

    // Omitting the digest computes the same result.
    let response = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: None,
            chunk_digests: vec![hello.digest.into(), world.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.blob_digest, Some(helloworld.digest.into()));

    // A supplied digest that does not match the chunks is InvalidArgument.
    let wrong = TestData::from_static(b"worldhello");
    let status = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: Some(wrong.digest.into()),
            chunk_digests: vec![hello.digest.into(), world.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // A supplied digest whose size disagrees with the chunk sizes is InvalidArgument.
    let status = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: Some(ApiDigest {
                hash: helloworld.digest.hex(),
                size_bytes: 3,
            }),
            chunk_digests: vec![hello.digest.into(), world.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Unsupported digest functions are rejected.
    let status = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: Some(helloworld.digest.into()),
            chunk_digests: vec![hello.digest.into(), world.digest.into()],
            digest_function: digest_function::Value::Md5 as i32,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // An empty chunk list is rejected.
    let status = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            chunk_digests: vec![],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn splice_with_missing_chunk_creates_nothing() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut cas_client = ContentAddressableStorageClient::new(channel.clone());

    let hello = TestData::from_static(b"hello");
    let world = TestData::from_static(b"world");
    let missing = TestData::from_static(b"missing chunk");
    let spliced = TestData::from_bytes(b"helloworldmissing chunk".to_vec().into());

    upload_via_batch(channel.clone(), &hello).await;
    upload_via_batch(channel.clone(), &world).await;

    let status = cas_client
        .splice_blob(SpliceBlobRequest {
            instance_name: "main".to_owned(),
            blob_digest: Some(spliced.digest.into()),
            chunk_digests: vec![
                hello.digest.into(),
                world.digest.into(),
                missing.digest.into(),
            ],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // No new blob was created.
    let response = cas_client
        .find_missing_blobs(FindMissingBlobsRequest {
            instance_name: "main".to_owned(),
            blob_digests: vec![spliced.digest.into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        response.into_inner().missing_blob_digests,
        vec![spliced.digest.into()]
    );
}

#[tokio::test]
async fn check_get_tree() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut cas_client = ContentAddressableStorageClient::new(channel.clone());

    let file = TestData::from_static(b"file content");
    let child = Directory {
        files: vec![FileNode {
            name: "leaf.txt".to_owned(),
            digest: Some(file.digest.into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let child_blob = TestData::from_bytes(child.encode_to_vec().into());

    let root = Directory {
        directories: vec![DirectoryNode {
            name: "subdir".to_owned(),
            digest: Some(child_blob.digest.into()),
        }],
        ..Default::default()
    };
    let root_blob = TestData::from_bytes(root.encode_to_vec().into());

    upload_via_batch(channel.clone(), &child_blob).await;
    upload_via_batch(channel.clone(), &root_blob).await;

    let response = cas_client
        .get_tree(GetTreeRequest {
            instance_name: "main".to_owned(),
            root_digest: Some(root_blob.digest.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let responses: Vec<_> = response.into_inner().collect().await;
    assert_eq!(responses.len(), 1);
    let tree_response = responses[0].as_ref().unwrap();
    assert_eq!(tree_response.directories, vec![root.clone(), child.clone()]);
    assert!(tree_response.next_page_token.is_empty());

    // A missing root is NOT_FOUND.
    let absent = TestData::from_static(b"no such directory");
    let result = cas_client
        .get_tree(GetTreeRequest {
            instance_name: "main".to_owned(),
            root_digest: Some(absent.digest.into()),
            ..Default::default()
        })
        .await;
    match result {
        Err(status) => assert_eq!(status.code(), Code::NotFound),
        Ok(response) => {
            let statuses: Vec<_> = response.into_inner().collect().await;
            assert!(statuses.iter().any(|r| r.is_err()));
        }
    }
}

#[tokio::test]
async fn check_capabilities() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut capabilities_client = CapabilitiesClient::new(channel);

    let response = capabilities_client
        .get_capabilities(
            protos::build::bazel::remote::execution::v2::GetCapabilitiesRequest {
                instance_name: "main".to_owned(),
            },
        )
        .await
        .unwrap()
        .into_inner();

    let cache = response.cache_capabilities.expect("cache capabilities");
    assert_eq!(
        cache.digest_functions,
        vec![digest_function::Value::Sha256 as i32]
    );
    assert_eq!(cache.max_batch_total_size_bytes, 0);
    assert_eq!(
        cache.symlink_absolute_path_strategy,
        symlink_absolute_path_strategy::Value::Allowed as i32
    );
    assert_eq!(
        cache.supported_compressors,
        vec![compressor::Value::Zstd as i32]
    );
    assert_eq!(
        cache.supported_batch_update_compressors,
        vec![compressor::Value::Zstd as i32]
    );
    assert!(cache.blob_splice_support);
    assert!(cache
        .action_cache_update_capabilities
        .expect("ac update capabilities")
        .update_enabled);

    let low = response.low_api_version.expect("low api version");
    assert_eq!((low.major, low.minor), (2, 0));
    let high = response.high_api_version.expect("high api version");
    assert_eq!((high.major, high.minor), (2, 3));
}

#[tokio::test]
async fn check_health() {
    let server = spawn_memory_server();
    let channel = server.channel();
    let mut health_client = HealthClient::new(channel);

    let response = health_client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, ServingStatus::Serving as i32);
}

#[tokio::test]
async fn inline_responses_respect_the_budget() {
    use protos::build::bazel::remote::execution::v2::action_cache_server::ActionCache;

    // Exercise the service directly: budget-sized payloads are bigger than comfortable
    // gRPC transport messages.
    let store = MemoryStore::new();
    let action = TestData::from_static(b"the action");

    let stdout = TestData::from_bytes(vec![0x61u8; 2 * 1024 * 1024].into());
    let stderr = TestData::from_bytes(vec![0x62u8; 2 * 1024 * 1024].into());
    let stored = ActionResult {
        exit_code: 0,
        stdout_raw: stdout.bytes.clone(),
        stderr_raw: stderr.bytes.clone(),
        execution_metadata: Some(ExecutedActionMetadata {
            worker: "worker-1".to_owned(),
            ..Default::default()
        }),
        ..Default::default()
    };
    store
        .put(
            EntryKind::Raw,
            &action.digest.hex(),
            UNKNOWN_SIZE,
            storage::driver::stream_of(stored.encode_to_vec().into()),
        )
        .await
        .unwrap();

    let server = Server::new(
        Box::new(store.clone()),
        None,
        None,
        CacheOptions::default(),
    );
    let service = super::action_cache_service::ActionCacheService {
        inner: server.inner(),
    };

    let response = service
        .get_action_result(tonic::Request::new(GetActionResultRequest {
            instance_name: "main".to_owned(),
            action_digest: Some(action.digest.into()),
            inline_stdout: true,
            inline_stderr: true,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();

    // 2 MiB of stdout fits the 3 MiB budget; the 2 MiB of stderr no longer does. The
    // displaced content is recoverable from the CAS by its digest.
    assert_eq!(response.stdout_raw, stdout.bytes);
    assert!(response.stderr_raw.is_empty());
    let stderr_digest = response.stderr_digest.expect("stderr digest");
    assert_eq!(stderr_digest.hash, stderr.digest.hex());

    let (present, size) = store
        .contains(EntryKind::Cas, &stderr.digest.hex(), UNKNOWN_SIZE)
        .await;
    assert!(present);
    assert_eq!(size, stderr.digest.size_bytes);
}

/// A proxy backend over a shared in-memory store, standing in for an upstream cache.
struct MemoryProxy {
    store: MemoryStore,
}

#[async_trait]
impl ProxyBackend for MemoryProxy {
    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        self.store.get(kind, hash, size_bytes, 0).await
    }

    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64) {
        self.store.contains(kind, hash, size_bytes).await
    }

    async fn upload(&self, request: UploadRequest) -> Result<(), StorageError> {
        self.store
            .put(
                request.kind,
                &request.hash,
                request.logical_size,
                request.content,
            )
            .await
    }
}

#[tokio::test]
async fn proxy_propagates_writes_between_replicas() {
    // Two servers share one upstream through asynchronous uploads and read-through fills.
    let upstream = MemoryStore::new();
    let proxy_a: Arc<dyn ProxyBackend> = Arc::new(MemoryProxy {
        store: upstream.clone(),
    });
    let proxy_b: Arc<dyn ProxyBackend> = Arc::new(MemoryProxy {
        store: upstream.clone(),
    });

    let queue_a = start_uploaders(proxy_a.clone(), 2, 16);
    let server_a = spawn_server(
        MemoryStore::new(),
        Some(proxy_a),
        Some(queue_a),
        CacheOptions::default(),
    );
    let server_b = spawn_server(
        MemoryStore::new(),
        Some(proxy_b),
        None,
        CacheOptions::default(),
    );

    let content = TestData::from_static(b"shared between replicas");
    upload_via_batch(server_a.channel(), &content).await;

    // Wait for the asynchronous relay to reach the upstream.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let (present, _) = upstream
                .contains(EntryKind::Cas, &content.digest.hex(), UNKNOWN_SIZE)
                .await;
            if present {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload propagated to the upstream");

    // Server B never saw the PUT but serves the blob through the proxy.
    let mut bs_client = ByteStreamClient::new(server_b.channel());
    let response = bs_client
        .read(ReadRequest {
            resource_name: format!(
                "main/blobs/{}/{}",
                content.digest.hex(),
                content.digest.size_bytes
            ),
            read_offset: 0,
            read_limit: 0,
        })
        .await
        .unwrap();
    let mut stream = response.into_inner();
    let mut read_back = Vec::new();
    while let Some(message) = stream.next().await {
        read_back.extend_from_slice(&message.unwrap().data);
    }
    assert_eq!(read_back, content.bytes);

    // And the fill populated B's local store: a second read works even if the proxy
    // disappears. (Exercised by reading again; the tee path has committed by now.)
    let mut cas_client = ContentAddressableStorageClient::new(server_b.channel());
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let response = cas_client
                .find_missing_blobs(FindMissingBlobsRequest {
                    instance_name: "main".to_owned(),
                    blob_digests: vec![content.digest.into()],
                    ..Default::default()
                })
                .await
                .unwrap();
            if response.into_inner().missing_blob_digests.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("read-through fill landed locally");
}
