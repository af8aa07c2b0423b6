//! Property-based tests for the height-indexed ledger.
//!
//! Tests the following invariants:
//! - Range scans return exactly the entries at or above the bound
//! - Results come back in ascending height order
//! - Entries under other prefixes never leak into a scan
//! - Key encoding round-trips and orders by height

use crate::strategies::*;
use bucket::ledger::{Ledger, LedgerPrefix, decode_key, encode_key};
use proptest::prelude::*;

fn open_ledger() -> (tempfile::TempDir, Ledger) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(&dir.path().join("ledger")).expect("open ledger");
    (dir, ledger)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A scan from `min` returns every idle entry with height >= min, sorted
    /// by height, and nothing from the other prefixes.
    #[test]
    fn prop_query_above_is_exact_and_ordered(
        idle in ledger_entries_strategy(24),
        meta in ledger_entries_strategy(8),
        pending in prop::collection::vec(file_hash_strategy(), 0..8),
        min in height_strategy(),
    ) {
        let (_dir, ledger) = open_ledger();
        for (name, height) in &idle {
            ledger.record_idle_file(*height, name).unwrap();
        }
        for (name, height) in &meta {
            ledger.record_service_root(*height, name).unwrap();
        }
        for name in &pending {
            ledger.record_pending(name, "0xdead").unwrap();
        }

        let keys = ledger.query_prefix_above(LedgerPrefix::IdleFile, min).unwrap();

        let mut expected: Vec<(u32, String)> = idle
            .iter()
            .filter(|(_, h)| **h >= min)
            .map(|(n, h)| (*h, n.clone()))
            .collect();
        expected.sort();

        let got: Vec<(u32, String)> = keys.iter().map(|k| (k.height, k.name.clone())).collect();
        prop_assert_eq!(got, expected);
    }

    /// Scanning from zero returns the whole prefix.
    #[test]
    fn prop_query_from_zero_returns_everything(
        meta in ledger_entries_strategy(16),
    ) {
        let (_dir, ledger) = open_ledger();
        for (name, height) in &meta {
            ledger.record_service_root(*height, name).unwrap();
        }
        let keys = ledger.query_prefix_above(LedgerPrefix::Metadata, 0).unwrap();
        prop_assert_eq!(keys.len(), meta.len());
        prop_assert!(keys.windows(2).all(|w| w[0].height <= w[1].height));
    }

    /// Encoded keys decode back to the same height and name.
    #[test]
    fn prop_key_roundtrip(
        name in file_hash_strategy(),
        height in height_strategy(),
    ) {
        let key = encode_key(LedgerPrefix::IdleFile, height, &name);
        let decoded = decode_key(LedgerPrefix::IdleFile, &key).unwrap();
        prop_assert_eq!(decoded.height, height);
        prop_assert_eq!(decoded.name, name);
        prop_assert!(decode_key(LedgerPrefix::Metadata, &key).is_err());
    }

    /// Byte order of keys follows numeric order of heights.
    #[test]
    fn prop_key_order_follows_height(
        name_a in file_hash_strategy(),
        name_b in file_hash_strategy(),
        h1 in height_strategy(),
        h2 in height_strategy(),
    ) {
        prop_assume!(h1 != h2);
        let a = encode_key(LedgerPrefix::IdleFile, h1, &name_a);
        let b = encode_key(LedgerPrefix::IdleFile, h2, &name_b);
        prop_assert_eq!(a < b, h1 < h2);
    }
}
