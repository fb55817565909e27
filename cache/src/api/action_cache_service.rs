// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::convert::TryInto;
use std::sync::Arc;

use bytes::Bytes;
use digest::{required_digest, Digest};
use prost::Message;
use protos::build::bazel::remote::execution::v2::{
    action_cache_server::ActionCache, ActionResult, Digest as ApiDigest, ExecutedActionMetadata,
    GetActionResultRequest, UpdateActionResultRequest,
};
use storage::consolidate_stream;
use storage::driver::{stream_of, EntryKind};
use storage::validate::validate_action_result;
use tonic::{Request, Response, Status};

use crate::api::InnerServer;
use crate::MAX_INLINE_SIZE;

pub(super) struct ActionCacheService {
    pub(super) inner: Arc<InnerServer>,
}

impl ActionCacheService {
    /// Ensure displaced inline bytes are recoverable from the CAS, then record their digest.
    async fn displace_inline(
        &self,
        data: Bytes,
        digest_slot: &mut Option<ApiDigest>,
    ) -> Result<(), Status> {
        let digest = Digest::of_bytes(&data);
        let hash = digest.hex();
        let (present, _) = self
            .inner
            .store
            .contains(EntryKind::Cas, &hash, digest.size_bytes)
            .await;
        if !present {
            self.inner
                .store
                .put(EntryKind::Cas, &hash, digest.size_bytes, stream_of(data))
                .await
                .map_err(Status::from)?;
        }
        if digest_slot.is_none() {
            *digest_slot = Some(digest.into());
        }
        Ok(())
    }

    /// Fetch a referenced blob for inlining, if it exists and fits the remaining budget.
    async fn fetch_inline(
        &self,
        digest_slot: &Option<ApiDigest>,
        inlined_so_far: usize,
    ) -> Result<Option<Bytes>, Status> {
        let api_digest = match digest_slot {
            Some(d) => d.clone(),
            None => return Ok(None),
        };
        let digest: Digest = match api_digest.try_into() {
            Ok(d) => d,
            Err(_) => return Ok(None),
        };
        if digest.size_bytes <= 0 || inlined_so_far + digest.size_bytes as usize > MAX_INLINE_SIZE
        {
            return Ok(None);
        }

        let found = self
            .inner
            .get_blob(EntryKind::Cas, &digest.hex(), digest.size_bytes, 0)
            .await
            .map_err(Status::from)?;
        match found {
            Some((stream, _)) => Ok(Some(consolidate_stream(stream).await.map_err(Status::from)?)),
            None => Ok(None),
        }
    }
}

#[tonic::async_trait]
impl ActionCache for ActionCacheService {
    /// Retrieve the action result from storage. Returns NOT_FOUND if the Action's digest
    /// does not have an associated ActionResult. Inline bytes are shaped to the response
    /// budget: requested blobs are attached while they fit, everything else is displaced to
    /// the CAS and referenced by digest.
    #[tracing::instrument(skip_all)]
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let request = request.into_inner();

        let action_digest = required_digest("action_digest", request.action_digest.clone())
            .map_err(Status::invalid_argument)?;
        let key = self
            .inner
            .ac_key(&request.instance_name, &action_digest.hex());

        let mut action_result = match self.inner.fetch_action_result(&key).await? {
            Some((action_result, _)) => action_result,
            None => return Err(Status::not_found("Not found")),
        };

        let mut inlined_so_far: usize = 0;

        // stdout
        if !action_result.stdout_raw.is_empty() {
            let data = std::mem::take(&mut action_result.stdout_raw);
            if request.inline_stdout && inlined_so_far + data.len() <= MAX_INLINE_SIZE {
                inlined_so_far += data.len();
                action_result.stdout_raw = data;
            } else {
                self.displace_inline(data, &mut action_result.stdout_digest)
                    .await?;
            }
        } else if request.inline_stdout {
            if let Some(data) = self
                .fetch_inline(&action_result.stdout_digest, inlined_so_far)
                .await?
            {
                inlined_so_far += data.len();
                action_result.stdout_raw = data;
            }
        }

        // stderr
        if !action_result.stderr_raw.is_empty() {
            let data = std::mem::take(&mut action_result.stderr_raw);
            if request.inline_stderr && inlined_so_far + data.len() <= MAX_INLINE_SIZE {
                inlined_so_far += data.len();
                action_result.stderr_raw = data;
            } else {
                self.displace_inline(data, &mut action_result.stderr_digest)
                    .await?;
            }
        } else if request.inline_stderr {
            if let Some(data) = self
                .fetch_inline(&action_result.stderr_digest, inlined_so_far)
                .await?
            {
                inlined_so_far += data.len();
                action_result.stderr_raw = data;
            }
        }

        // Output files named by the request.
        let requested_files: HashSet<&str> = request
            .inline_output_files
            .iter()
            .map(|p| p.as_str())
            .collect();
        for output_file in &mut action_result.output_files {
            let requested = requested_files.contains(output_file.path.as_str());
            if !output_file.contents.is_empty() {
                let data = std::mem::take(&mut output_file.contents);
                if requested && inlined_so_far + data.len() <= MAX_INLINE_SIZE {
                    inlined_so_far += data.len();
                    output_file.contents = data;
                } else {
                    self.displace_inline(data, &mut output_file.digest).await?;
                }
            } else if requested {
                if let Some(data) = self
                    .fetch_inline(&output_file.digest, inlined_so_far)
                    .await?
                {
                    inlined_so_far += data.len();
                    output_file.contents = data;
                }
            }
        }

        Ok(Response::new(action_result))
    }

    /// Write an action result to storage, then write each inlined payload to the CAS so it
    /// stays recoverable by digest, and relay everything to the proxy backend.
    ///
    /// Note: The action_digest is used as the key into storage. Its size (the length of the
    /// encoded Action) is unrelated to the length of the encoded ActionResult actually
    /// written.
    #[tracing::instrument(skip_all)]
    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let peer = request.remote_addr();
        let request = request.into_inner();

        let action_digest = required_digest("action_digest", request.action_digest.clone())
            .map_err(Status::invalid_argument)?;

        let mut action_result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("Missing action_result"))?;

        validate_action_result(&action_result).map_err(Status::from)?;

        // Record which worker produced the result, unless the client already did. This also
        // guarantees a non-empty serialization below.
        let worker = peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        match action_result.execution_metadata.as_mut() {
            Some(metadata) if metadata.worker.is_empty() => metadata.worker = worker,
            Some(_) => {}
            None => {
                action_result.execution_metadata = Some(ExecutedActionMetadata {
                    worker,
                    ..Default::default()
                });
            }
        }

        // Collect the inlined payloads that must also live in the CAS so they stay
        // recoverable by digest, computing the hash where the client left the digest out.
        // The stored record is not rewritten; displacement happens at read time.
        let mut cas_writes: Vec<(String, Bytes)> = Vec::new();

        if !action_result.stdout_raw.is_empty() {
            let data = action_result.stdout_raw.clone();
            let hash = match &action_result.stdout_digest {
                Some(digest) => digest.hash.clone(),
                None => Digest::of_bytes(&data).hex(),
            };
            cas_writes.push((hash, data));
        }
        if !action_result.stderr_raw.is_empty() {
            let data = action_result.stderr_raw.clone();
            let hash = match &action_result.stderr_digest {
                Some(digest) => digest.hash.clone(),
                None => Digest::of_bytes(&data).hex(),
            };
            cas_writes.push((hash, data));
        }
        for output_file in &action_result.output_files {
            if !output_file.contents.is_empty() {
                let data = output_file.contents.clone();
                let hash = match &output_file.digest {
                    Some(digest) => digest.hash.clone(),
                    None => Digest::of_bytes(&data).hex(),
                };
                cas_writes.push((hash, data));
            }
        }

        let encoded = Bytes::from(action_result.encode_to_vec());
        if encoded.is_empty() {
            return Err(Status::internal("serialized ActionResult is empty"));
        }

        let key = self
            .inner
            .ac_key(&request.instance_name, &action_digest.hex());
        let ac_kind = self.inner.ac_kind();

        self.inner
            .store
            .put(ac_kind, &key, encoded.len() as i64, stream_of(encoded))
            .await
            .map_err(Status::from)?;

        for (hash, data) in cas_writes {
            let (present, _) = self
                .inner
                .store
                .contains(EntryKind::Cas, &hash, data.len() as i64)
                .await;
            if !present {
                self.inner
                    .store
                    .put(EntryKind::Cas, &hash, data.len() as i64, stream_of(data))
                    .await
                    .map_err(Status::from)?;
            }
            self.inner.enqueue_proxy_upload(EntryKind::Cas, &hash).await;
        }

        self.inner.enqueue_proxy_upload(ac_kind, &key).await;

        Ok(Response::new(action_result))
    }
}
