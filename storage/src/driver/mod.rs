// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use protos::build::bazel::remote::execution::v2::ActionResult;

use crate::Digest;

mod disk;
mod error;
mod memory;

pub use disk::DiskStore;
pub use error::StorageError;
pub use memory::MemoryStore;

/// The namespaces a cached entry can live in.
///
/// `Ac` entries are serialized `ActionResult`s which passed structural validation on the way
/// in; `Raw` entries are AC-shaped bytes stored without validation (used when AC validation
/// is disabled). The two share a namespace and are interchangeable from the storage layer's
/// perspective.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::Display)]
pub enum EntryKind {
    #[strum(serialize = "cas")]
    Cas,
    #[strum(serialize = "ac")]
    Ac,
    #[strum(serialize = "ac")]
    Raw,
}

impl EntryKind {
    /// The directory/URL component for this namespace.
    pub fn namespace(&self) -> &'static str {
        match self {
            EntryKind::Cas => "cas",
            EntryKind::Ac | EntryKind::Raw => "ac",
        }
    }
}

/// The sentinel used on lookups when the caller does not know the blob's size
/// (AC lookups, HEAD requests).
pub const UNKNOWN_SIZE: i64 = -1;

/// Counters describing the contents of a store, surfaced on the status page.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    /// Maximum size of the store in bytes, or 0 if unbounded.
    pub total_size: i64,

    /// Bytes reserved for writes in progress.
    pub reserved_size: i64,

    /// Number of entries currently stored.
    pub num_items: u64,

    /// Sum of the logical (uncompressed) sizes of all entries.
    pub uncompressed_size: i64,
}

/// Alias for the type of a blob content stream.
pub type BoxBlobStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send + 'static>>;

/// The contract the cache surface consumes from the underlying (externally managed, bounded)
/// blob store. Eviction policy is the store's own business; the surface only sees presence,
/// content streams and writes.
///
/// The empty blob is always present: `contains` answers `(true, 0)` and `get` returns an
/// empty stream for it even if nothing was ever written.
#[async_trait]
pub trait BlobStore {
    /// Whether `hash` is present under `kind`. `size_bytes` may be `UNKNOWN_SIZE`; the actual
    /// logical size is returned when the entry is present.
    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64);

    /// Return a stream of the uncompressed bytes of the entry, starting at `offset`, along
    /// with the entry's logical size. A `None` return signals not-found (not an error).
    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError>;

    /// Like `get` for a CAS entry, but the returned stream carries zstd-framed bytes.
    /// `offset` still applies to the uncompressed content.
    async fn get_zstd(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError>;

    /// Store an entry from a content stream. The store hashes CAS content while copying and
    /// rejects digest mismatches with `InvalidArgument`; a declared `size_bytes >= 0` is
    /// enforced for all kinds. Concurrent puts of the same digest are de-duplicated so that
    /// at most one physical write occurs and every caller observes success.
    async fn put(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        content: BoxBlobStream,
    ) -> Result<(), StorageError>;

    /// Given a list of digests, return the subset not present in the CAS.
    async fn find_missing_cas_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>, StorageError>;

    /// Fetch an AC entry, decode and structurally validate it, and (when the store was built
    /// with dependency checking) confirm its referenced CAS blobs exist. Returns the decoded
    /// record alongside the raw stored bytes, or `None` on a miss or failed deps check.
    async fn get_validated_action_result(
        &self,
        hash: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError>;

    /// Current store counters for the status page.
    fn stats(&self) -> StoreStats;
}

#[async_trait]
impl<BS> BlobStore for Box<BS>
where
    BS: BlobStore + Send + Sync + 'static + ?Sized,
{
    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64) {
        (**self).contains(kind, hash, size_bytes).await
    }

    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        (**self).get(kind, hash, size_bytes, offset).await
    }

    async fn get_zstd(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        (**self).get_zstd(hash, size_bytes, offset).await
    }

    async fn put(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        content: BoxBlobStream,
    ) -> Result<(), StorageError> {
        (**self).put(kind, hash, size_bytes, content).await
    }

    async fn find_missing_cas_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>, StorageError> {
        (**self).find_missing_cas_blobs(digests).await
    }

    async fn get_validated_action_result(
        &self,
        hash: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError> {
        (**self).get_validated_action_result(hash).await
    }

    fn stats(&self) -> StoreStats {
        (**self).stats()
    }
}

/// Produce a single-chunk stream over already-buffered content.
pub fn stream_of(content: Bytes) -> BoxBlobStream {
    Box::pin(async_stream::stream! {
        if !content.is_empty() {
            yield Ok(content);
        }
    })
}

/// An always-empty stream.
pub fn empty_stream() -> BoxBlobStream {
    Box::pin(futures::stream::empty())
}
