// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use async_trait::async_trait;

use storage::driver::{BoxBlobStream, EntryKind, StorageError};

mod grpc;
mod http;
mod uploader;

pub use crate::grpc::GrpcProxy;
pub use crate::http::HttpProxy;
pub use crate::uploader::{start_uploaders, UploadQueue};

/// A queued relay of a locally completed write to the proxy backend.
///
/// `logical_size` is the uncompressed blob size exposed on the wire; `size_on_disk` may
/// differ when the local store keeps the data compressed. The request owns `content`; every
/// path through the uploader must consume or drop it.
pub struct UploadRequest {
    pub hash: String,
    pub kind: EntryKind,
    pub logical_size: i64,
    pub size_on_disk: i64,
    pub content: BoxBlobStream,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("hash", &self.hash)
            .field("kind", &self.kind)
            .field("logical_size", &self.logical_size)
            .field("size_on_disk", &self.size_on_disk)
            .finish()
    }
}

/// An optional upstream cache which extends local capacity and shares entries across
/// replicas. Reads are synchronous (consulted on local miss); writes are relayed
/// asynchronously through the bounded uploader queue and are best-effort.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Fetch an entry from the upstream. `size_bytes` may be negative when unknown; the
    /// backend is responsible for discovering the actual size. `None` signals a miss.
    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError>;

    /// Whether the upstream has the entry, along with its size when known.
    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64);

    /// Synchronously relay one entry to the upstream. Called by uploader workers only;
    /// request handlers go through `UploadQueue::enqueue` instead.
    async fn upload(&self, request: UploadRequest) -> Result<(), StorageError>;
}
