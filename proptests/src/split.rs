//! Property-based tests for splitting files into proof blocks.
//!
//! Tests the following invariants:
//! - Exactly `block_count` blocks of equal size
//! - Concatenated blocks reproduce the file followed by zero padding only

use crate::strategies::*;
use bucket::proof::split_into_blocks;
use proptest::prelude::*;

fn split(data: &[u8], block_count: usize) -> Vec<Vec<u8>> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("file");
    std::fs::write(&path, data).unwrap();
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(split_into_blocks(&path, block_count))
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_split_shape(
        data in file_data_strategy(1, 4096),
        block_count in block_count_strategy(),
    ) {
        let blocks = split(&data, block_count);
        prop_assert_eq!(blocks.len(), block_count);

        let block_size = data.len().div_ceil(block_count);
        prop_assert!(blocks.iter().all(|b| b.len() == block_size));
    }

    #[test]
    fn prop_split_preserves_content(
        data in file_data_strategy(1, 4096),
        block_count in block_count_strategy(),
    ) {
        let blocks = split(&data, block_count);
        let joined: Vec<u8> = blocks.concat();

        prop_assert_eq!(&joined[..data.len()], &data[..]);
        let padding = &joined[data.len()..];
        prop_assert!(padding.iter().all(|b| *b == 0));
    }
}
