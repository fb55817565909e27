// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use protos::build::bazel::remote::execution::v2::ActionResult;

use crate::driver::{BlobStore, BoxBlobStream, EntryKind, StorageError, StoreStats};
use crate::Digest;

/// Container for digest/bytes of test content.
#[derive(Clone, Debug)]
pub struct TestData {
    /// The actual bytes of the content.
    pub bytes: Bytes,

    /// Digest of the content.
    pub digest: Digest,
}

impl TestData {
    pub fn from_static(content: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(content))
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let digest = Digest::of_bytes(&bytes);
        Self { bytes, digest }
    }
}

/// Wraps a `BlobStore` and counts method calls. Lets tests assert how many physical writes
/// the API layer actually issued without flaky sleeps.
#[derive(Clone)]
pub struct CountMethodCallsStore<S> {
    inner: S,
    pub contains_count: Arc<AtomicUsize>,
    pub get_count: Arc<AtomicUsize>,
    pub put_count: Arc<AtomicUsize>,
}

impl<S> CountMethodCallsStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            contains_count: Arc::new(AtomicUsize::new(0)),
            get_count: Arc::new(AtomicUsize::new(0)),
            put_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.contains_count.load(Ordering::SeqCst),
            self.get_count.load(Ordering::SeqCst),
            self.put_count.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl<S> BlobStore for CountMethodCallsStore<S>
where
    S: BlobStore + Send + Sync + 'static,
{
    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64) {
        self.contains_count.fetch_add(1, Ordering::SeqCst);
        self.inner.contains(kind, hash, size_bytes).await
    }

    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.inner.get(kind, hash, size_bytes, offset).await
    }

    async fn get_zstd(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        self.inner.get_zstd(hash, size_bytes, offset).await
    }

    async fn put(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        content: BoxBlobStream,
    ) -> Result<(), StorageError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.inner.put(kind, hash, size_bytes, content).await
    }

    async fn find_missing_cas_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>, StorageError> {
        self.inner.find_missing_cas_blobs(digests).await
    }

    async fn get_validated_action_result(
        &self,
        hash: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError> {
        self.inner.get_validated_action_result(hash).await
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }
}

/// A store whose every method fails. Useful for exercising error mapping.
pub struct AlwaysErrorsStore;

#[async_trait]
impl BlobStore for AlwaysErrorsStore {
    async fn contains(&self, _: EntryKind, _: &str, _: i64) -> (bool, i64) {
        (false, crate::driver::UNKNOWN_SIZE)
    }

    async fn get(
        &self,
        _: EntryKind,
        _: &str,
        _: i64,
        _: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        Err(StorageError::Unavailable("always errors".to_owned()))
    }

    async fn get_zstd(
        &self,
        _: &str,
        _: i64,
        _: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        Err(StorageError::Unavailable("always errors".to_owned()))
    }

    async fn put(
        &self,
        _: EntryKind,
        _: &str,
        _: i64,
        _: BoxBlobStream,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("always errors".to_owned()))
    }

    async fn find_missing_cas_blobs(&self, _: Vec<Digest>) -> Result<Vec<Digest>, StorageError> {
        Err(StorageError::Unavailable("always errors".to_owned()))
    }

    async fn get_validated_action_result(
        &self,
        _: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError> {
        Err(StorageError::Unavailable("always errors".to_owned()))
    }

    fn stats(&self) -> StoreStats {
        StoreStats::default()
    }
}
