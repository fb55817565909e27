// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default, clippy::result_large_err)]

pub mod api;
pub mod http;

mod key;
pub use key::ac_key;

/// Maximum bytes carried by a single streaming message or read buffer.
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Budget for bytes inlined into a `GetActionResult` response.
pub const MAX_INLINE_SIZE: usize = 3 * 1024 * 1024;
