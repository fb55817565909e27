// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::convert::TryFrom;
use std::fmt;

use sha2::{Digest as Sha2Digest, Sha256};

use protos::build::bazel::remote::execution::v2 as remoting_protos;

const HASH_SIZE_BYTES: usize = 32;

/// Length of a SHA-256 hash in lowercase hexadecimal form.
pub const HASH_SIZE_HEX: usize = 2 * HASH_SIZE_BYTES;

/// The well-known SHA-256 of the empty blob.
pub const EMPTY_HASH_HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const EMPTY_HASH_BYTES: [u8; HASH_SIZE_BYTES] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// Validate a hash/size pair as received on the wire. The hash must be exactly 64 lowercase
/// hexadecimal characters and the size must be non-negative. The internal `-1` "unknown size"
/// sentinel used on some lookups must be resolved by the caller before validation.
pub fn validate_hash(hash: &str, size_bytes: i64) -> Result<(), String> {
    if hash.len() != HASH_SIZE_HEX {
        return Err(format!(
            "invalid hash length {} (expected {HASH_SIZE_HEX}): {hash:?}",
            hash.len()
        ));
    }
    if !hash
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(format!("hash is not lowercase hexadecimal: {hash:?}"));
    }
    if size_bytes < 0 {
        return Err(format!("negative size: {size_bytes}"));
    }
    Ok(())
}

#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Digest {
    pub hash: [u8; HASH_SIZE_BYTES],
    pub size_bytes: i64,
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest<{}, {}>", hex::encode(self.hash), self.size_bytes)
    }
}

impl Digest {
    pub const EMPTY: Self = Self {
        hash: EMPTY_HASH_BYTES,
        size_bytes: 0,
    };

    pub fn new(hash_str: &str, size_bytes: i64) -> Result<Self, String> {
        validate_hash(hash_str, size_bytes)?;
        let hash =
            hex::decode(hash_str).map_err(|err| format!("Failed to convert digest: {err}"))?;
        Self::from_slice(&hash, size_bytes)
    }

    pub fn from_slice(hash: &[u8], size_bytes: i64) -> Result<Self, String> {
        if hash.len() != HASH_SIZE_BYTES {
            return Err(format!("Digest had unexpected length {}", hash.len()));
        }
        if size_bytes < 0 {
            return Err(format!("negative size: {size_bytes}"));
        }
        let mut digest = Digest {
            hash: [0; HASH_SIZE_BYTES],
            size_bytes,
        };
        digest.hash.clone_from_slice(hash);
        Ok(digest)
    }

    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(content);
        let hash = hasher.finalize();
        let mut digest = Digest {
            hash: [0; HASH_SIZE_BYTES],
            size_bytes: content.len() as i64,
        };
        digest.hash.clone_from_slice(hash.as_slice());
        digest
    }

    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl TryFrom<remoting_protos::Digest> for Digest {
    type Error = String;

    fn try_from(d: remoting_protos::Digest) -> Result<Self, Self::Error> {
        Digest::new(&d.hash, d.size_bytes)
    }
}

impl From<Digest> for remoting_protos::Digest {
    fn from(digest: Digest) -> Self {
        remoting_protos::Digest {
            hash: hex::encode(digest.hash),
            size_bytes: digest.size_bytes,
        }
    }
}

pub fn required_digest(
    field_name: &str,
    api_digest_opt: Option<remoting_protos::Digest>,
) -> Result<Digest, String> {
    let api_digest = match api_digest_opt {
        Some(digest) => digest,
        None => return Err(format!("Missing {field_name}")),
    };
    api_digest
        .try_into()
        .map_err(|err| format!("Malformed {field_name}: {err}"))
}
