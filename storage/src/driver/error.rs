// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use tonic::Status;

use crate::Digest;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    Cancelled(String),
    InvalidArgument(String),
    NotFound(String),
    InvalidSize {
        expected_size: i64,
        actual_size: i64,
    },
    InvalidHash {
        expected_digest: Digest,
        actual_digest: Digest,
    },
    OutOfRange(String),
    ResourceExhausted(String),
    DataLoss(String),
    /// A proxy backend answered with a non-2xx HTTP status.
    HttpStatus(u16),
    Internal(String),
    Unavailable(String),
}

impl std::error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
            StorageError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            StorageError::NotFound(msg) => write!(f, "Not found: {msg}"),
            StorageError::InvalidSize {
                expected_size,
                actual_size,
            } => {
                write!(
                    f,
                    "Invalid size for provided content (expected {expected_size}, got {actual_size})"
                )
            }
            StorageError::InvalidHash {
                expected_digest,
                actual_digest,
            } => {
                write!(
                    f,
                    "Invalid hash for provided content (expected digest was {expected_digest:?}, actual digest is {actual_digest:?})"
                )
            }
            StorageError::OutOfRange(msg) => write!(f, "Out of range: {msg}"),
            StorageError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {msg}"),
            StorageError::DataLoss(msg) => write!(f, "Data loss: {msg}"),
            StorageError::HttpStatus(code) => write!(f, "Upstream HTTP status {code}"),
            StorageError::Internal(msg) => write!(f, "{msg}"),
            StorageError::Unavailable(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<String> for StorageError {
    fn from(msg: String) -> Self {
        StorageError::Internal(msg)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        // Decoder errors surface as InvalidData: the client sent a malformed frame.
        if err.kind() == std::io::ErrorKind::InvalidData {
            StorageError::InvalidArgument(format!("{err}"))
        } else {
            StorageError::Internal(format!("I/O error: {err}"))
        }
    }
}

impl From<StorageError> for String {
    fn from(err: StorageError) -> Self {
        format!("{err}")
    }
}

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled(msg) => Status::cancelled(msg),
            StorageError::InvalidArgument(msg) => Status::invalid_argument(msg),
            StorageError::NotFound(msg) => Status::not_found(msg),
            StorageError::InvalidSize { .. } | StorageError::InvalidHash { .. } => {
                Status::invalid_argument(format!("{err}"))
            }
            StorageError::OutOfRange(msg) => Status::out_of_range(msg),
            StorageError::ResourceExhausted(msg) => Status::resource_exhausted(msg),
            StorageError::DataLoss(msg) => Status::data_loss(msg),
            StorageError::HttpStatus(404) => Status::not_found("upstream HTTP status 404"),
            StorageError::HttpStatus(code) => {
                Status::internal(format!("upstream HTTP status {code}"))
            }
            StorageError::Internal(msg) => Status::internal(msg),
            StorageError::Unavailable(msg) => Status::unavailable(msg),
        }
    }
}
