// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use protos::build::bazel::remote::execution::v2::{ActionResult, Tree};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::driver::{
    empty_stream, stream_of, BlobStore, BoxBlobStream, EntryKind, StorageError, StoreStats,
    UNKNOWN_SIZE,
};
use crate::validate::validate_action_result;
use crate::zstd;
use crate::Digest;

struct Inner {
    cas: HashMap<String, Bytes>,
    ac: HashMap<String, Bytes>,
}

impl Inner {
    fn map(&self, kind: EntryKind) -> &HashMap<String, Bytes> {
        match kind {
            EntryKind::Cas => &self.cas,
            EntryKind::Ac | EntryKind::Raw => &self.ac,
        }
    }

    fn map_mut(&mut self, kind: EntryKind) -> &mut HashMap<String, Bytes> {
        match kind {
            EntryKind::Cas => &mut self.cas,
            EntryKind::Ac | EntryKind::Raw => &mut self.ac,
        }
    }
}

/// A `BlobStore` holding everything in process memory. Used by tests and available as a
/// configuration option for ephemeral deployments.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    validate_ac_deps: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(false)
    }

    pub fn with_options(validate_ac_deps: bool) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                cas: HashMap::new(),
                ac: HashMap::new(),
            })),
            validate_ac_deps,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn contains(&self, kind: EntryKind, hash: &str, _size_bytes: i64) -> (bool, i64) {
        if kind == EntryKind::Cas && hash == digest::EMPTY_HASH_HEX {
            return (true, 0);
        }
        let inner = self.inner.lock();
        match inner.map(kind).get(hash) {
            Some(blob) => (true, blob.len() as i64),
            None => (false, UNKNOWN_SIZE),
        }
    }

    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        if kind == EntryKind::Cas && hash == digest::EMPTY_HASH_HEX {
            return Ok(Some((empty_stream(), 0)));
        }

        let blob = {
            let inner = self.inner.lock();
            match inner.map(kind).get(hash) {
                Some(b) => b.clone(),
                None => return Ok(None),
            }
        };

        if size_bytes >= 0 && blob.len() as i64 != size_bytes {
            return Ok(None);
        }
        if offset < 0 || offset > blob.len() as i64 {
            return Err(StorageError::OutOfRange(format!(
                "offset {offset} exceeds blob size {}",
                blob.len()
            )));
        }

        let logical_size = blob.len() as i64;
        Ok(Some((stream_of(blob.slice(offset as usize..)), logical_size)))
    }

    async fn get_zstd(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        if hash == digest::EMPTY_HASH_HEX && offset == 0 {
            return Ok(Some((stream_of(zstd::empty_frame()), 0)));
        }

        let blob = {
            let inner = self.inner.lock();
            match inner.cas.get(hash) {
                Some(b) => b.clone(),
                None => return Ok(None),
            }
        };

        if size_bytes >= 0 && blob.len() as i64 != size_bytes {
            return Ok(None);
        }
        if offset < 0 || offset > blob.len() as i64 {
            return Err(StorageError::OutOfRange(format!(
                "offset {offset} exceeds blob size {}",
                blob.len()
            )));
        }

        let logical_size = blob.len() as i64;
        let frame = zstd::codec().compress(&blob[offset as usize..])?;
        Ok(Some((stream_of(Bytes::from(frame)), logical_size)))
    }

    async fn put(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        mut content: BoxBlobStream,
    ) -> Result<(), StorageError> {
        let mut buffer = BytesMut::new();
        let mut hasher = Sha256::default();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            hasher.update(&chunk[..]);
            buffer.extend_from_slice(&chunk[..]);
        }

        if size_bytes >= 0 && buffer.len() as i64 != size_bytes {
            return Err(StorageError::InvalidSize {
                expected_size: size_bytes,
                actual_size: buffer.len() as i64,
            });
        }

        if kind == EntryKind::Cas {
            let actual_hash = hex::encode(hasher.finalize());
            if actual_hash != hash {
                return Err(StorageError::InvalidHash {
                    expected_digest: Digest::new(hash, buffer.len() as i64)
                        .map_err(StorageError::InvalidArgument)?,
                    actual_digest: Digest::new(&actual_hash, buffer.len() as i64)
                        .map_err(StorageError::Internal)?,
                });
            }
        }

        metrics::counter!("cache_blobs_written_total", 1, "driver" => "memory");

        let content = buffer.freeze();
        let mut inner = self.inner.lock();
        match kind {
            // Concurrent CAS writes of one digest keep the first copy.
            EntryKind::Cas => {
                inner.cas.entry(hash.to_owned()).or_insert(content);
            }
            // AC entries are replaced wholesale.
            EntryKind::Ac | EntryKind::Raw => {
                inner.map_mut(kind).insert(hash.to_owned(), content);
            }
        }
        Ok(())
    }

    async fn find_missing_cas_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>, StorageError> {
        let inner = self.inner.lock();
        let missing = digests
            .into_iter()
            .filter(|d| !d.is_empty() && !inner.cas.contains_key(&d.hex()))
            .collect();
        Ok(missing)
    }

    async fn get_validated_action_result(
        &self,
        hash: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError> {
        let raw = {
            let inner = self.inner.lock();
            match inner.ac.get(hash) {
                Some(b) => b.clone(),
                None => return Ok(None),
            }
        };

        let action_result = ActionResult::decode(raw.clone())
            .map_err(|err| StorageError::DataLoss(format!("undecodable ActionResult: {err}")))?;
        validate_action_result(&action_result)?;

        if self.validate_ac_deps && action_result_deps_missing(self, &action_result).await? {
            return Ok(None);
        }

        Ok(Some((action_result, raw)))
    }

    fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let uncompressed: i64 = inner
            .cas
            .values()
            .chain(inner.ac.values())
            .map(|b| b.len() as i64)
            .sum();
        StoreStats {
            total_size: 0,
            reserved_size: 0,
            num_items: (inner.cas.len() + inner.ac.len()) as u64,
            uncompressed_size: uncompressed,
        }
    }
}

/// Collect every CAS digest an `ActionResult` references (expanding output directory trees)
/// and report whether any of them is missing from the store.
pub(crate) async fn action_result_deps_missing<S>(
    store: &S,
    action_result: &ActionResult,
) -> Result<bool, StorageError>
where
    S: BlobStore + Sync + ?Sized,
{
    let mut digests = Vec::new();

    if let Some(d) = &action_result.stdout_digest {
        digests.push(Digest::new(&d.hash, d.size_bytes).map_err(StorageError::InvalidArgument)?);
    }
    if let Some(d) = &action_result.stderr_digest {
        digests.push(Digest::new(&d.hash, d.size_bytes).map_err(StorageError::InvalidArgument)?);
    }
    for output_file in &action_result.output_files {
        if let Some(d) = &output_file.digest {
            digests
                .push(Digest::new(&d.hash, d.size_bytes).map_err(StorageError::InvalidArgument)?);
        }
    }

    for output_directory in &action_result.output_directories {
        let tree_digest = match &output_directory.tree_digest {
            Some(d) => d,
            None => continue,
        };

        let stream_opt = store
            .get(EntryKind::Cas, &tree_digest.hash, tree_digest.size_bytes, 0)
            .await?;
        let (stream, _) = match stream_opt {
            Some(s) => s,
            None => return Ok(true),
        };
        let tree_bytes = crate::consolidate_stream(stream).await?;
        let tree = Tree::decode(tree_bytes)
            .map_err(|err| StorageError::DataLoss(format!("undecodable Tree: {err}")))?;

        let directories = tree.root.iter().chain(tree.children.iter());
        for directory in directories {
            for file_node in &directory.files {
                if let Some(d) = &file_node.digest {
                    digests.push(
                        Digest::new(&d.hash, d.size_bytes).map_err(StorageError::InvalidArgument)?,
                    );
                }
            }
        }
    }

    let missing = store.find_missing_cas_blobs(digests).await?;
    Ok(!missing.is_empty())
}
