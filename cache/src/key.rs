// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use sha2::{Digest as Sha2Digest, Sha256};

/// The Action Cache key presented to storage for `hash` in `instance_name`.
///
/// With mangling disabled this is the action digest itself. With mangling enabled the key is
/// rehashed together with the instance name, giving each instance its own AC namespace on a
/// shared store. Mangling never applies to CAS keys (content addressing must stay global).
pub fn ac_key(mangle: bool, instance_name: &str, hash: &str) -> String {
    if !mangle {
        return hash.to_owned();
    }
    let mut hasher = Sha256::default();
    hasher.update(instance_name.as_bytes());
    hasher.update(hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::ac_key;

    const HASH: &str = "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2";

    #[test]
    fn disabled_mangling_is_identity() {
        assert_eq!(ac_key(false, "main", HASH), HASH);
        assert_eq!(ac_key(false, "", HASH), HASH);
    }

    #[test]
    fn mangled_keys_are_scoped_by_instance() {
        let a = ac_key(true, "instance-a", HASH);
        let b = ac_key(true, "instance-b", HASH);
        assert_ne!(a, b);
        assert_ne!(a, HASH);

        // Deterministic and still a well-formed key.
        assert_eq!(a, ac_key(true, "instance-a", HASH));
        assert_eq!(a.len(), 64);
        assert!(digest::validate_hash(&a, 0).is_ok());
    }
}
