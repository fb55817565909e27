// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_channel::TrySendError;

use crate::{ProxyBackend, UploadRequest};

/// Handle for enqueueing asynchronous proxy uploads.
#[derive(Clone)]
pub struct UploadQueue {
    sender: async_channel::Sender<UploadRequest>,
}

impl UploadQueue {
    /// Enqueue a relay of a completed local write. Never blocks: when the queue is full the
    /// request is dropped (closing its content stream) and the drop is logged. Proxy
    /// slowness must not add latency to the primary path, and proxy writes are best-effort.
    pub fn enqueue(&self, request: UploadRequest) {
        match self.sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                metrics::increment_counter!("cache_proxy_uploads_dropped_total");
                log::error!(
                    "upload queue full; dropping proxy upload of {} {}",
                    request.kind,
                    request.hash
                );
            }
            Err(TrySendError::Closed(request)) => {
                log::error!(
                    "upload queue closed; dropping proxy upload of {} {}",
                    request.kind,
                    request.hash
                );
            }
        }
    }
}

/// Start `num_uploaders` workers relaying queued local writes to `backend` through a bounded
/// queue of depth `max_queued_uploads`. Worker failures are logged and never surfaced to the
/// client that triggered the upload.
pub fn start_uploaders(
    backend: Arc<dyn ProxyBackend + 'static>,
    num_uploaders: usize,
    max_queued_uploads: usize,
) -> UploadQueue {
    let (sender, receiver) = async_channel::bounded::<UploadRequest>(max_queued_uploads.max(1));

    for worker_id in 0..num_uploaders.max(1) {
        let receiver = receiver.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            while let Ok(request) = receiver.recv().await {
                let kind = request.kind;
                let hash = request.hash.clone();
                match backend.upload(request).await {
                    Ok(()) => {
                        metrics::increment_counter!("cache_proxy_uploads_total");
                        log::debug!("uploader {worker_id}: relayed {kind} {hash}");
                    }
                    Err(err) => {
                        metrics::increment_counter!("cache_proxy_upload_failures_total");
                        log::error!("uploader {worker_id}: failed to relay {kind} {hash}: {err}");
                    }
                }
            }
        });
    }

    UploadQueue { sender }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use storage::driver::{BoxBlobStream, EntryKind, StorageError};
    use tokio::sync::Semaphore;

    use super::start_uploaders;
    use crate::{ProxyBackend, UploadRequest};

    /// Records uploaded hashes; holds each upload until a permit is released.
    struct GatedBackend {
        gate: Arc<Semaphore>,
        uploaded: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProxyBackend for GatedBackend {
        async fn get(
            &self,
            _: EntryKind,
            _: &str,
            _: i64,
        ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
            Ok(None)
        }

        async fn contains(&self, _: EntryKind, _: &str, _: i64) -> (bool, i64) {
            (false, -1)
        }

        async fn upload(&self, request: UploadRequest) -> Result<(), StorageError> {
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.uploaded.lock().push(request.hash);
            Ok(())
        }
    }

    fn request(name: &str) -> UploadRequest {
        UploadRequest {
            hash: name.to_owned(),
            kind: EntryKind::Cas,
            logical_size: 0,
            size_on_disk: 0,
            content: storage::driver::empty_stream(),
        }
    }

    #[tokio::test]
    async fn uploads_are_relayed() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(16));
        let backend = Arc::new(GatedBackend {
            gate,
            uploaded: uploaded.clone(),
        });

        let queue = start_uploaders(backend, 2, 8);
        queue.enqueue(request("one"));
        queue.enqueue(request("two"));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if uploaded.lock().len() == 2 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both uploads relayed");

        let mut uploaded = uploaded.lock().clone();
        uploaded.sort();
        assert_eq!(uploaded, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        // No permits: the single worker parks on the first request.
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(GatedBackend {
            gate: gate.clone(),
            uploaded: uploaded.clone(),
        });

        let queue = start_uploaders(backend, 1, 1);

        // One request occupies the worker, one fills the queue; wait for the worker to have
        // taken the first off the channel so the queue depth is deterministic.
        queue.enqueue(request("held"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        queue.enqueue(request("queued"));

        // This one must be dropped without blocking the caller.
        let start = std::time::Instant::now();
        queue.enqueue(request("dropped"));
        assert!(start.elapsed() < std::time::Duration::from_millis(100));

        // Release the gate; only the first two requests were ever accepted.
        gate.add_permits(16);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if uploaded.lock().len() == 2 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("held and queued uploads relayed");

        let uploaded = uploaded.lock().clone();
        assert_eq!(uploaded, vec!["held".to_owned(), "queued".to_owned()]);
    }
}
