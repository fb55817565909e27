// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod grpc_metrics;
pub use grpc_metrics::{convert_status_code, GrpcMetrics};

mod require_auth;
pub use require_auth::RequireAuth;
