// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use digest::validate_hash;
use protos::build::bazel::remote::execution::v2::{
    ActionResult, Digest as ApiDigest, OutputSymlink,
};

use crate::driver::StorageError;

fn validate_nested_digest(field: &str, digest_opt: Option<&ApiDigest>) -> Result<(), StorageError> {
    let digest = match digest_opt {
        Some(d) => d,
        None => return Ok(()),
    };
    validate_hash(&digest.hash, digest.size_bytes)
        .map_err(|err| StorageError::InvalidArgument(format!("invalid {field}: {err}")))
}

fn require_nested_digest(field: &str, digest_opt: Option<&ApiDigest>) -> Result<(), StorageError> {
    match digest_opt {
        Some(_) => validate_nested_digest(field, digest_opt),
        None => Err(StorageError::InvalidArgument(format!("missing {field}"))),
    }
}

fn validate_symlinks(field: &str, symlinks: &[OutputSymlink]) -> Result<(), StorageError> {
    for symlink in symlinks {
        if symlink.path.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "{field} entry with empty path"
            )));
        }
        if symlink.path.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "{field} entry with absolute path: {:?}",
                symlink.path
            )));
        }
        if symlink.target.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "{field} entry {:?} with empty target",
                symlink.path
            )));
        }
    }
    Ok(())
}

/// Structurally validate an `ActionResult` at ingest time: all output paths must be
/// non-empty and relative, every referenced digest must be well-formed, and symlinks must
/// carry both a path and a target. Existence of the referenced CAS blobs is checked
/// separately (and optionally) by `get_validated_action_result`.
pub fn validate_action_result(action_result: &ActionResult) -> Result<(), StorageError> {
    for output_file in &action_result.output_files {
        if output_file.path.is_empty() {
            return Err(StorageError::InvalidArgument(
                "output file with empty path".to_owned(),
            ));
        }
        if output_file.path.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "output file with absolute path: {:?}",
                output_file.path
            )));
        }
        require_nested_digest(
            &format!("output file digest ({:?})", output_file.path),
            output_file.digest.as_ref(),
        )?;
    }

    for output_directory in &action_result.output_directories {
        if output_directory.path.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "output directory with absolute path: {:?}",
                output_directory.path
            )));
        }
        require_nested_digest(
            &format!("output directory tree digest ({:?})", output_directory.path),
            output_directory.tree_digest.as_ref(),
        )?;
    }

    validate_symlinks("output_file_symlinks", &action_result.output_file_symlinks)?;
    validate_symlinks(
        "output_directory_symlinks",
        &action_result.output_directory_symlinks,
    )?;
    validate_symlinks("output_symlinks", &action_result.output_symlinks)?;

    validate_nested_digest("stdout digest", action_result.stdout_digest.as_ref())?;
    validate_nested_digest("stderr digest", action_result.stderr_digest.as_ref())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use digest::EMPTY_HASH_HEX;
    use protos::build::bazel::remote::execution::v2::{
        ActionResult, Digest as ApiDigest, OutputDirectory, OutputFile, OutputSymlink,
    };

    use super::validate_action_result;

    fn valid_digest() -> ApiDigest {
        ApiDigest {
            hash: EMPTY_HASH_HEX.to_owned(),
            size_bytes: 0,
        }
    }

    fn well_formed() -> ActionResult {
        ActionResult {
            exit_code: 0,
            output_files: vec![OutputFile {
                path: "bin/tool".to_owned(),
                digest: Some(valid_digest()),
                is_executable: true,
                ..Default::default()
            }],
            output_directories: vec![OutputDirectory {
                path: "gen".to_owned(),
                tree_digest: Some(valid_digest()),
            }],
            output_symlinks: vec![OutputSymlink {
                path: "link".to_owned(),
                target: "bin/tool".to_owned(),
            }],
            stdout_digest: Some(valid_digest()),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_well_formed_action_result() {
        validate_action_result(&well_formed()).unwrap();
        validate_action_result(&ActionResult::default()).unwrap();
    }

    #[test]
    fn rejects_output_file_problems() {
        let mut ar = well_formed();
        ar.output_files[0].path = String::new();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_files[0].path = "/etc/passwd".to_owned();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_files[0].digest = None;
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_files[0].digest.as_mut().unwrap().hash = "not-hex".to_owned();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_files[0].digest.as_mut().unwrap().size_bytes = -2;
        assert!(validate_action_result(&ar).is_err());
    }

    #[test]
    fn rejects_output_directory_problems() {
        let mut ar = well_formed();
        ar.output_directories[0].path = "/abs".to_owned();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_directories[0].tree_digest = None;
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_directories[0].tree_digest.as_mut().unwrap().hash =
            EMPTY_HASH_HEX.to_uppercase();
        assert!(validate_action_result(&ar).is_err());
    }

    #[test]
    fn rejects_symlink_problems() {
        let mut ar = well_formed();
        ar.output_symlinks[0].path = String::new();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_symlinks[0].target = String::new();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_symlinks[0].path = "/abs".to_owned();
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_file_symlinks.push(OutputSymlink {
            path: "ok".to_owned(),
            target: String::new(),
        });
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.output_directory_symlinks.push(OutputSymlink {
            path: String::new(),
            target: "t".to_owned(),
        });
        assert!(validate_action_result(&ar).is_err());
    }

    #[test]
    fn rejects_bad_stdio_digests() {
        let mut ar = well_formed();
        ar.stdout_digest.as_mut().unwrap().size_bytes = -5;
        assert!(validate_action_result(&ar).is_err());

        let mut ar = well_formed();
        ar.stderr_digest = Some(ApiDigest {
            hash: "zz".repeat(32),
            size_bytes: 4,
        });
        assert!(validate_action_result(&ar).is_err());
    }

    #[test]
    fn optional_digests_may_be_absent() {
        let mut ar = well_formed();
        ar.stdout_digest = None;
        ar.stderr_digest = None;
        validate_action_result(&ar).unwrap();
    }
}
