// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;
use futures::StreamExt;

use storage::driver::{BoxBlobStream, EntryKind, StorageError, UNKNOWN_SIZE};

use crate::{ProxyBackend, UploadRequest};

/// A proxy backend speaking the plain HTTP cache protocol: entries live at
/// `{base}/{ac|cas}/{hash}`, reads use `GET`/`HEAD` and uploads use `PUT`.
pub struct HttpProxy {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProxy {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpProxy {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn url_for(&self, kind: EntryKind, hash: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind.namespace(), hash)
    }
}

fn response_stream(response: reqwest::Response) -> BoxBlobStream {
    let stream = response.bytes_stream().map(|chunk| {
        chunk.map_err(|err| StorageError::Unavailable(format!("proxy read error: {err}")))
    });
    Box::pin(stream)
}

#[async_trait]
impl ProxyBackend for HttpProxy {
    async fn get(
        &self,
        kind: EntryKind,
        hash: &str,
        size_bytes: i64,
    ) -> Result<Option<(BoxBlobStream, i64)>, StorageError> {
        let response = self
            .client
            .get(self.url_for(kind, hash))
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(format!("proxy GET error: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StorageError::HttpStatus(status.as_u16()));
        }

        let actual_size = response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(size_bytes);
        Ok(Some((response_stream(response), actual_size)))
    }

    async fn contains(&self, kind: EntryKind, hash: &str, _size_bytes: i64) -> (bool, i64) {
        let response = match self.client.head(self.url_for(kind, hash)).send().await {
            Ok(r) => r,
            Err(err) => {
                log::debug!("proxy HEAD error for {kind} {hash}: {err}");
                return (false, UNKNOWN_SIZE);
            }
        };

        if !response.status().is_success() {
            return (false, UNKNOWN_SIZE);
        }
        let size = response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(UNKNOWN_SIZE);
        (true, size)
    }

    async fn upload(&self, request: UploadRequest) -> Result<(), StorageError> {
        let url = self.url_for(request.kind, &request.hash);
        let body_stream = request
            .content
            .map(|chunk| chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)));

        let mut http_request = self
            .client
            .put(url)
            .body(reqwest::Body::wrap_stream(body_stream));
        if request.size_on_disk >= 0 {
            http_request = http_request.header(reqwest::header::CONTENT_LENGTH, request.size_on_disk);
        }

        let response = http_request
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(format!("proxy PUT error: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}
