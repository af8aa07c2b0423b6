//! Shared proptest strategies for property-based testing.
//!
//! This module provides reusable strategies for generating:
//! - File hashes and data
//! - Height-indexed ledger entries
//! - Tags for a given file

use common::Tag;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Generate a valid 64-character hex file hash.
pub fn file_hash_strategy() -> impl Strategy<Value = String> {
    "[a-f0-9]{64}"
}

/// Generate random file data within a size range.
pub fn file_data_strategy(min_size: usize, max_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), min_size..=max_size)
}

/// Generate a block height, biased towards the ends of the range so the
/// big-endian key encoding is exercised across byte boundaries.
pub fn height_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![
        0u32..1_000,
        250u32..260,
        65_530u32..65_540,
        any::<u32>(),
        Just(u32::MAX),
    ]
}

/// Generate ledger entries as `name -> height`, with unique names.
pub fn ledger_entries_strategy(max_len: usize) -> impl Strategy<Value = BTreeMap<String, u32>> {
    prop::collection::btree_map(file_hash_strategy(), height_strategy(), 0..=max_len)
}

/// Generate a block count that fits a filler file.
pub fn block_count_strategy() -> impl Strategy<Value = usize> {
    1usize..=64
}

/// Build a tag declaring `name` with `blocks` per-block entries.
pub fn tag_for(name: &str, blocks: usize) -> Tag {
    Tag {
        name: name.to_string(),
        u: format!("u-{}", &name[..name.len().min(8)]),
        phi: vec!["phi".to_string(); blocks],
        phi_hash: String::new(),
        attest: String::new(),
    }
}

/// Write a data file and its tag into `dir` as `<data_name>` and
/// `<tag_stem>.tag`, the tag declaring `declared`.
pub fn write_pair(
    dir: &std::path::Path,
    data_name: &str,
    tag_stem: &str,
    declared: &str,
    data: &[u8],
) -> (std::path::PathBuf, std::path::PathBuf) {
    let data_path = dir.join(data_name);
    let tag_path = dir.join(format!("{tag_stem}.tag"));
    std::fs::write(&data_path, data).expect("write data");
    std::fs::write(
        &tag_path,
        serde_json::to_vec(&tag_for(declared, 4)).expect("encode tag"),
    )
    .expect("write tag");
    (data_path, tag_path)
}
