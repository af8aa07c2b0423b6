//! Property-based tests for tag admission.
//!
//! Tests the following invariants:
//! - Verification is idempotent on unchanged files
//! - A matching pair always passes
//! - Any disagreement between tag name, tag file and data file is rejected

use crate::strategies::*;
use bucket::error::VerifyError;
use bucket::space::verify_tag_file;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Two calls on the same files give the same answer.
    #[test]
    fn prop_verification_is_idempotent(
        data_name in file_hash_strategy(),
        tag_stem in file_hash_strategy(),
        declared in file_hash_strategy(),
        use_data_name_for_stem in any::<bool>(),
        use_data_name_for_decl in any::<bool>(),
        data in file_data_strategy(1, 256),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let stem = if use_data_name_for_stem { data_name.clone() } else { tag_stem };
        let decl = if use_data_name_for_decl { data_name.clone() } else { declared };
        let (data_path, tag_path) = write_pair(dir.path(), &data_name, &stem, &decl, &data);

        let first = verify_tag_file(&tag_path, &data_path).is_ok();
        let second = verify_tag_file(&tag_path, &data_path).is_ok();
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, stem == data_name && decl == data_name);
    }

    /// A tag naming a different file is always a mismatch.
    #[test]
    fn prop_foreign_tag_rejected(
        data_name in file_hash_strategy(),
        declared in file_hash_strategy(),
        data in file_data_strategy(1, 64),
    ) {
        prop_assume!(data_name != declared);
        let dir = tempfile::tempdir().unwrap();
        let (data_path, tag_path) = write_pair(dir.path(), &data_name, &data_name, &declared, &data);

        let result = verify_tag_file(&tag_path, &data_path);
        prop_assert!(matches!(result, Err(VerifyError::TagMismatch(_))));
    }
}
