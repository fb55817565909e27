// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default, clippy::len_without_is_empty)]

pub mod driver;
pub mod validate;
pub mod zstd;

mod bytes;
pub use crate::bytes::consolidate_stream;
pub use digest::Digest;

pub mod testutil;
