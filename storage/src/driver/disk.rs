// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use prost::Message;
use protos::build::bazel::remote::execution::v2::ActionResult;
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::driver::memory::action_result_deps_missing;
use crate::driver::{
    empty_stream, BlobStore, BoxBlobStream, EntryKind, StorageError, StoreStats, UNKNOWN_SIZE,
};
use crate::validate::validate_action_result;
use crate::zstd;
use crate::Digest;

/// Preferred size of chunks read from disk.
const READ_CHUNK_SIZE: usize = 512 * 1024;

struct Inner {
    /// Path under which blobs are stored, one subdirectory per namespace.
    blobs_path: PathBuf,

    /// Path to the temporary directory where in-flight writes are staged.
    tmp_path: PathBuf,

    /// Sequence number added to temporary filenames for writes.
    blob_sequence: AtomicUsize,

    /// Configured capacity in bytes, or 0 when unbounded. Eviction is handled externally;
    /// this is only reported on the status page.
    max_size: i64,

    num_items: AtomicU64,
    uncompressed_size: AtomicI64,
}

impl Inner {
    /// Compute the path where the content for `hash` is or will be stored. The path uses a
    /// two-level directory structure based on a prefix of the hash in order to reduce the
    /// potential number of files per directory.
    fn path_for(&self, kind: EntryKind, hash: &str) -> PathBuf {
        let mut path = self.blobs_path.clone();
        path.push(kind.namespace());
        path.push(&hash[0..2]);
        path.push(&hash[2..4]);
        path.push(hash);
        path
    }

    async fn entry_size(&self, kind: EntryKind, hash: &str) -> Option<i64> {
        let path = self.path_for(kind, hash);
        // Note: We treat all errors as a missing digest, not just "file not found."
        tokio::fs::metadata(path).await.ok().map(|m| m.len() as i64)
    }
}

/// A `BlobStore` that keeps blob content in files in the filesystem, one file per digest
/// under `{base}/{ac|cas}/XX/YY/{hash}`. Writes are staged in a temporary file and renamed
/// into place on success, which keeps concurrent writers of one digest from observing each
/// other's partial content. Capacity management (LRU eviction) runs outside this process.
pub struct DiskStore {
    inner: Arc<Inner>,
    validate_ac_deps: bool,
}

impl DiskStore {
    pub async fn new(
        base_path: impl AsRef<Path>,
        max_size: i64,
        validate_ac_deps: bool,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().join("v1");

        let blobs_path = base_path.join("blobs");
        for namespace in ["ac", "cas"] {
            let path = blobs_path.join(namespace);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| format!("failed to make directory: {path:?}: {err}"))?;
        }

        let tmp_path = base_path.join("tmp");
        tokio::fs::create_dir_all(&tmp_path)
            .await
            .map_err(|err| format!("failed to make directory: {tmp_path:?}: {err}"))?;

        let (num_items, uncompressed_size) = {
            let blobs_path = blobs_path.clone();
            tokio::task::spawn_blocking(move || scan_counters(&blobs_path))
                .await
                .map_err(|err| format!("startup scan failed: {err}"))??
        };

        Ok(DiskStore {
            inner: Arc::new(Inner {
                blobs_path,
                tmp_path,
                blob_sequence: AtomicUsize::new(0),
                max_size,
                num_items: AtomicU64::new(num_items),
                uncompressed_size: AtomicI64::new(uncompressed_size),
            }),
            validate_ac_deps,
        })
    }

    /// Open the blob file for reading, positioned at `offset`, after checking any declared
    /// size against the on-disk length. Returns the file and its logical size.
    async fn open_at(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(File, i64)>, StorageError> {
        let path = self.inner.path_for(kind, hash);
        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!("error while accessing digest {hash}: {err}").into());
            }
        };

        let metadata = file
            .metadata()
            .await
            .map_err(|err| format!("error while accessing digest {hash}: {err}"))?;
        let actual_size = metadata.len() as i64;

        if size_bytes >= 0 && actual_size != size_bytes {
            // A stored file with the wrong length is unusable for the requested digest.
            return Ok(None);
        }

        if offset < 0 || offset > actual_size {
            return Err(StorageError::OutOfRange(format!(
                "offset {offset} exceeds blob size {actual_size}"
            )));
        }
        if offset > 0 {
            file.seek(SeekFrom::Start(offset as u64))
                .await
                .map_err(|err| format!("error while seeking in digest {hash}: {err}"))?;
        }

        Ok(Some((file, actual_size)))
    }
}

#[async_trait]
impl BlobStore for DiskStore {
    async fn contains(&self, kind: EntryKind, hash: &str, size_bytes: i64) -> (bool, i64) {
        if kind == EntryKind::Cas && hash == digest::EMPTY_HASH_HEX {
            return (true, 0);
        }
        match self.inner.entry_size(kind, hash).await {
            Some(actual_size) if size_bytes < 0 || actual_size == size_bytes => {
                (true, actual_size)
            }
            _ => (false, UNKNOWN_SIZE),
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

        let (mut file, actual_size) = match self.open_at(kind, hash, size_bytes, offset).await? {
            Some(opened) => opened,
            None => return Ok(None),
        };

        let mut amount_to_read = (actual_size - offset) as usize;
        let stream = async_stream::stream! {
            while amount_to_read > 0 {
                let chunk_amount = READ_CHUNK_SIZE.min(amount_to_read);
                let mut buffer = BytesMut::zeroed(chunk_amount);
                if let Err(err) = file.read_exact(&mut buffer).await {
                    yield Err(StorageError::Unavailable(err.to_string()));
                    return;
                }
                yield Ok(buffer.freeze());
                amount_to_read -= chunk_amount;
            }
        };

        Ok(Some((Box::pin(stream), actual_size)))
    }

    async fn get_zstd(
        &self,
        hash: &str,
        size_bytes: i64,
        offset: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        if hash == digest::EMPTY_HASH_HEX && offset == 0 {
            return Ok(Some((
                crate::driver::stream_of(zstd::empty_frame()),
                0,
            )));
        }

        let (file, actual_size) = match self
            .open_at(EntryKind::Cas, hash, size_bytes, offset)
            .await?
        {
            Some(opened) => opened,
            None => return Ok(None),
        };

        Ok(Some((
            zstd::encode_reader(file, READ_CHUNK_SIZE),
            actual_size,
        )))
    }

    async fn put(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
        mut content: BoxBlobStream,
    ) -> Result<(), StorageError> {
        // Concurrent CAS writes of one digest are deduplicated here: a blob that is already
        // on disk is complete, so the incoming copy is drained and discarded. AC entries are
        // replaced wholesale instead.
        if kind == EntryKind::Cas && self.inner.entry_size(kind, hash).await.is_some() {
            while let Some(chunk) = content.next().await {
                chunk?;
            }
            return Ok(());
        }

        metrics::counter!("cache_blobs_written_total", 1, "driver" => "disk");

        let final_path = self.inner.path_for(kind, hash);
        let blob_directory_path = final_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| StorageError::Internal("No parent directory for blob path.".into()))?;
        tokio::fs::create_dir_all(&blob_directory_path)
            .await
            .map_err(|err| format!("failed to create directory: {blob_directory_path:?}: {err}"))?;

        let sequence = self.inner.blob_sequence.fetch_add(1, Ordering::SeqCst);
        let tmp_path = self
            .inner
            .tmp_path
            .join(format!("{hash}.{}.{sequence}", uuid_suffix()));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|err| format!("failed to create file: {tmp_path:?}: {err}"))?;

        let write_result = async {
            let mut hasher = Sha256::default();
            let mut written: i64 = 0;
            while let Some(chunk) = content.next().await {
                let chunk = chunk?;
                hasher.update(&chunk[..]);
                written += chunk.len() as i64;
                file.write_all(&chunk)
                    .await
                    .map_err(|err| format!("error while writing digest {hash}: {err}"))?;
            }

            if size_bytes >= 0 && written != size_bytes {
                return Err(StorageError::InvalidSize {
                    expected_size: size_bytes,
                    actual_size: written,
                });
            }

            if kind == EntryKind::Cas {
                let actual_hash = hex::encode(hasher.finalize());
                if actual_hash != hash {
                    return Err(StorageError::InvalidHash {
                        expected_digest: Digest::new(hash, written)
                            .map_err(StorageError::InvalidArgument)?,
                        actual_digest: Digest::new(&actual_hash, written)
                            .map_err(StorageError::Internal)?,
                    });
                }
            }

            file.shutdown()
                .await
                .map_err(|err| format!("error while writing digest {hash}: {err}"))?;

            Ok(written)
        }
        .await;

        let written = match write_result {
            Ok(written) => written,
            Err(err) => {
                let cleanup = tokio::spawn(tokio::fs::remove_file(tmp_path));
                drop(cleanup);
                return Err(err);
            }
        };

        // Rename the temporary file to the final path. This makes the digest visible to
        // readers. Racing against another writer is fine: for CAS all copies carry the same
        // content, and for AC the later ActionResult takes precedence.
        if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                let cleanup = tokio::spawn(tokio::fs::remove_file(tmp_path));
                drop(cleanup);
                return Err(StorageError::Internal(format!(
                    "error while writing digest {hash}: {err}"
                )));
            }
        }

        self.inner.num_items.fetch_add(1, Ordering::Relaxed);
        self.inner
            .uncompressed_size
            .fetch_add(written, Ordering::Relaxed);

        Ok(())
    }

    async fn find_missing_cas_blobs(
        &self,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>, StorageError> {
        let mut checks = Vec::new();
        for digest in digests.into_iter() {
            if digest.is_empty() {
                continue;
            }
            let inner = self.inner.clone();
            checks.push(async move {
                match inner.entry_size(EntryKind::Cas, &digest.hex()).await {
                    Some(_) => None,
                    None => Some(digest),
                }
            });
        }

        let missing = futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(missing)
    }

    async fn get_validated_action_result(
        &self,
        hash: &str,
    ) -> Result<Option<(ActionResult, Bytes)>, StorageError> {
        let stream_opt = self.get(EntryKind::Ac, hash, UNKNOWN_SIZE, 0).await?;
        let (stream, _) = match stream_opt {
            Some(s) => s,
            None => return Ok(None),
        };
        let raw = crate::consolidate_stream(stream).await?;

        let action_result = ActionResult::decode(raw.clone())
            .map_err(|err| StorageError::DataLoss(format!("undecodable ActionResult: {err}")))?;
        validate_action_result(&action_result)?;

        if self.validate_ac_deps && action_result_deps_missing(self, &action_result).await? {
            return Ok(None);
        }

        Ok(Some((action_result, raw)))
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            total_size: self.inner.max_size,
            reserved_size: 0,
            num_items: self.inner.num_items.load(Ordering::Relaxed),
            uncompressed_size: self.inner.uncompressed_size.load(Ordering::Relaxed),
        }
    }
}

fn uuid_suffix() -> String {
    // Unlike `Uuid::new_v4` which uses the `getrandom` crate, this uses the `rand` crate
    // including its thread-local RNG.
    let bytes: [u8; 16] = rand::Rng::gen(&mut rand::thread_rng());
    uuid::Uuid::from_slice(&bytes).expect("16 bytes").to_string()
}

fn scan_counters(blobs_path: &Path) -> Result<(u64, i64), StorageError> {
    fn walk(dir: &Path, num_items: &mut u64, total: &mut i64) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(&entry.path(), num_items, total)?;
            } else if file_type.is_file() {
                *num_items += 1;
                *total += entry.metadata()?.len() as i64;
            }
        }
        Ok(())
    }

    let mut num_items = 0;
    let mut total = 0;
    walk(blobs_path, &mut num_items, &mut total)
        .map_err(|err| StorageError::Internal(format!("startup scan of {blobs_path:?}: {err}")))?;
    Ok((num_items, total))
}
