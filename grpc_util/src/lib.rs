// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod auth;
pub mod hyper;
pub mod infra;
pub mod logging;
pub mod services;
