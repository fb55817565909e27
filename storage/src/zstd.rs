// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::OnceLock;

use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::Level;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::driver::{BoxBlobStream, StorageError};

/// Compression level used for all zstd framing produced by the server.
pub const ZSTD_COMPRESSION_LEVEL: u32 = 1;

/// The canonical zstd frame for the empty blob.
pub const EMPTY_ZSTD_FRAME: [u8; 9] = [0x28, 0xb5, 0x2f, 0xfd, 0x20, 0x00, 0x01, 0x00, 0x00];

/// One-shot frame encode/decode. The trait exists so that tests (and deployments with a
/// different libzstd binding) can substitute an implementation; the active codec is
/// registered once before serving begins and never mutated afterwards.
pub trait ZstdCodec: Send + Sync {
    /// Compress `data` into a single zstd frame.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Decompress a single zstd frame. `max_size` bounds the decoded allocation; inputs that
    /// decode past it are rejected.
    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>, StorageError>;
}

/// The default codec, backed by libzstd via the `zstd` crate.
pub struct LibZstdCodec;

impl ZstdCodec for LibZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        zstd::bulk::compress(data, ZSTD_COMPRESSION_LEVEL as i32)
            .map_err(|err| StorageError::Internal(format!("zstd compress: {err}")))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>, StorageError> {
        zstd::bulk::decompress(data, max_size)
            .map_err(|err| StorageError::InvalidArgument(format!("zstd decompress: {err}")))
    }
}

static CODEC: OnceLock<Box<dyn ZstdCodec>> = OnceLock::new();

/// Register the process-wide codec. Must be called before serving begins; a second call is
/// rejected.
pub fn register_codec(codec: Box<dyn ZstdCodec>) -> Result<(), String> {
    CODEC
        .set(codec)
        .map_err(|_| "zstd codec already registered".to_owned())
}

/// The registered codec, defaulting to libzstd.
pub fn codec() -> &'static dyn ZstdCodec {
    CODEC.get_or_init(|| Box::new(LibZstdCodec)).as_ref()
}

/// Wrap an `AsyncRead` of uncompressed bytes into a stream of zstd-framed chunks.
pub fn encode_reader<R>(reader: R, chunk_size: usize) -> BoxBlobStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let encoder = ZstdEncoder::with_quality(
        BufReader::new(reader),
        Level::Precise(ZSTD_COMPRESSION_LEVEL),
    );
    chunk_reader(encoder, chunk_size)
}

/// Read an `AsyncRead` to exhaustion as a stream of `Bytes` chunks of at most `chunk_size`.
pub fn chunk_reader<R>(mut reader: R, chunk_size: usize) -> BoxBlobStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(async_stream::stream! {
        loop {
            let mut buffer = BytesMut::zeroed(chunk_size);
            let n = match reader.read(&mut buffer).await {
                Ok(n) => n,
                Err(err) => {
                    yield Err(StorageError::from(err));
                    return;
                }
            };
            if n == 0 {
                return;
            }
            buffer.truncate(n);
            yield Ok(buffer.freeze());
        }
    })
}

/// The zstd frame served for an empty blob read over `compressed-blobs`.
pub fn empty_frame() -> Bytes {
    Bytes::from_static(&EMPTY_ZSTD_FRAME)
}
