// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use base64::Engine;
use protos::build::bazel::remote::execution::v2::{
    ActionResult, Digest as ApiDigest, OutputSymlink,
};
use serde_json::{json, Map, Value};

/// Render an `ActionResult` in the protobuf-JSON convention: camelCase field names, int64
/// as a decimal string, bytes as standard base64, defaults omitted.
pub(super) fn action_result_to_json(action_result: &ActionResult) -> Value {
    let mut object = Map::new();

    if !action_result.output_files.is_empty() {
        let files: Vec<Value> = action_result
            .output_files
            .iter()
            .map(|file| {
                let mut entry = Map::new();
                entry.insert("path".to_owned(), json!(file.path));
                if let Some(digest) = &file.digest {
                    entry.insert("digest".to_owned(), digest_to_json(digest));
                }
                if file.is_executable {
                    entry.insert("isExecutable".to_owned(), json!(true));
                }
                if !file.contents.is_empty() {
                    entry.insert("contents".to_owned(), bytes_to_json(&file.contents));
                }
                Value::Object(entry)
            })
            .collect();
        object.insert("outputFiles".to_owned(), Value::Array(files));
    }

    if !action_result.output_directories.is_empty() {
        let directories: Vec<Value> = action_result
            .output_directories
            .iter()
            .map(|directory| {
                let mut entry = Map::new();
                entry.insert("path".to_owned(), json!(directory.path));
                if let Some(digest) = &directory.tree_digest {
                    entry.insert("treeDigest".to_owned(), digest_to_json(digest));
                }
                Value::Object(entry)
            })
            .collect();
        object.insert("outputDirectories".to_owned(), Value::Array(directories));
    }

    insert_symlinks(
        &mut object,
        "outputFileSymlinks",
        &action_result.output_file_symlinks,
    );
    insert_symlinks(&mut object, "outputSymlinks", &action_result.output_symlinks);
    insert_symlinks(
        &mut object,
        "outputDirectorySymlinks",
        &action_result.output_directory_symlinks,
    );

    if action_result.exit_code != 0 {
        object.insert("exitCode".to_owned(), json!(action_result.exit_code));
    }
    if !action_result.stdout_raw.is_empty() {
        object.insert(
            "stdoutRaw".to_owned(),
            bytes_to_json(&action_result.stdout_raw),
        );
    }
    if let Some(digest) = &action_result.stdout_digest {
        object.insert("stdoutDigest".to_owned(), digest_to_json(digest));
    }
    if !action_result.stderr_raw.is_empty() {
        object.insert(
            "stderrRaw".to_owned(),
            bytes_to_json(&action_result.stderr_raw),
        );
    }
    if let Some(digest) = &action_result.stderr_digest {
        object.insert("stderrDigest".to_owned(), digest_to_json(digest));
    }

    if let Some(metadata) = &action_result.execution_metadata {
        if !metadata.worker.is_empty() {
            object.insert(
                "executionMetadata".to_owned(),
                json!({ "worker": metadata.worker }),
            );
        }
    }

    Value::Object(object)
}

fn insert_symlinks(object: &mut Map<String, Value>, field: &str, symlinks: &[OutputSymlink]) {
    if symlinks.is_empty() {
        return;
    }
    let rendered: Vec<Value> = symlinks
        .iter()
        .map(|symlink| json!({ "path": symlink.path, "target": symlink.target }))
        .collect();
    object.insert(field.to_owned(), Value::Array(rendered));
}

fn digest_to_json(digest: &ApiDigest) -> Value {
    json!({
        "hash": digest.hash,
        "sizeBytes": digest.size_bytes.to_string(),
    })
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    json!(base64::engine::general_purpose::STANDARD.encode(bytes))
}
