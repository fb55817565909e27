// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    config.disable_comments(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(
            config,
            &[
                "protos/bazelbuild_remote-apis/build/bazel/remote/execution/v2/remote_execution.proto",
                "protos/bazelbuild_remote-apis/build/bazel/remote/asset/v1/remote_asset.proto",
                "protos/bazelbuild_remote-apis/build/bazel/semver/semver.proto",
                "protos/googleapis/google/bytestream/bytestream.proto",
                "protos/googleapis/google/rpc/code.proto",
                "protos/googleapis/google/rpc/status.proto",
                "protos/grpc/grpc/health/v1/health.proto",
            ],
            &[
                "protos/bazelbuild_remote-apis",
                "protos/googleapis",
                "protos/grpc",
            ],
        )?;

    Ok(())
}
