//! Height-indexed persistent key/value ledger (sled).
//!
//! Keys are `prefix ++ u32 BE height ++ name`, so within one prefix the
//! lexicographic order of keys is the order of their heights and a
//! "height >= H" query is a single range scan. Every write is a single-key
//! operation flushed to disk before returning; multi-step procedures built on
//! top (submit then record height) are safe to re-drive from either step.

use crate::error::LedgerError;
use common::ProofCategory;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Sled tree holding every ledger entry.
const ENTRIES_TREE: &str = "entries";

/// Key namespaces in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerPrefix {
    /// Confirmed filler files, keyed by confirmation height.
    IdleFile,
    /// Submissions awaiting reconciliation, value is the transaction hash.
    IdlePending,
    /// Service file roots, keyed by the height they were stored at.
    Metadata,
}

impl LedgerPrefix {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LedgerPrefix::IdleFile => b"idle:",
            LedgerPrefix::IdlePending => b"idle-pending:",
            LedgerPrefix::Metadata => b"meta:",
        }
    }

    /// Prefix scanned to find the files of a proving category.
    pub fn for_category(category: ProofCategory) -> Self {
        match category {
            ProofCategory::Idle => LedgerPrefix::IdleFile,
            ProofCategory::Service => LedgerPrefix::Metadata,
        }
    }
}

/// Decoded ledger key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerKey {
    pub height: u32,
    pub name: String,
}

/// Aggregate signature recorded at the end of a proving round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigmaRecord {
    /// Start height of the challenge window that was proven.
    pub window_start: u32,
    pub sigma: String,
    /// SHA-256 of the round's proof bundle file.
    pub bundle_hash: String,
    pub proven: u32,
    pub recorded_at: u64,
}

fn sigma_key(category: ProofCategory) -> &'static [u8] {
    match category {
        ProofCategory::Idle => b"sigma:idle",
        ProofCategory::Service => b"sigma:service",
    }
}

/// Build the full key for `name` at `height` under `prefix`.
pub fn encode_key(prefix: LedgerPrefix, height: u32, name: &str) -> Vec<u8> {
    let p = prefix.as_bytes();
    let mut key = Vec::with_capacity(p.len() + 4 + name.len());
    key.extend_from_slice(p);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Split a full key back into height and name.
pub fn decode_key(prefix: LedgerPrefix, key: &[u8]) -> Result<LedgerKey, LedgerError> {
    let rest = key
        .strip_prefix(prefix.as_bytes())
        .ok_or_else(|| LedgerError::Corrupt("key outside prefix".to_string()))?;
    if rest.len() < 4 {
        return Err(LedgerError::Corrupt(format!(
            "key too short: {} bytes after prefix",
            rest.len()
        )));
    }
    let (height_bytes, name) = rest.split_at(4);
    let mut h = [0u8; 4];
    h.copy_from_slice(height_bytes);
    let name = String::from_utf8(name.to_vec())
        .map_err(|e| LedgerError::Corrupt(format!("non-utf8 name: {}", e)))?;
    Ok(LedgerKey {
        height: u32::from_be_bytes(h),
        name,
    })
}

/// The keyed ledger shared by both control loops.
///
/// sled is internally synchronized, so the ledger is shared as `Arc<Ledger>`
/// without further locking.
pub struct Ledger {
    db: sled::Db,
    entries: sled::Tree,
}

impl Ledger {
    /// Open (or create) the ledger database at `db_path`.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(db_path)?;
        let entries = db.open_tree(ENTRIES_TREE)?;

        info!(
            path = %db_path.display(),
            entries = entries.len(),
            "Ledger opened"
        );

        Ok(Self { db, entries })
    }

    /// Durable single-key write.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), LedgerError> {
        self.entries.insert(key, value)?;
        self.entries.flush()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, LedgerError> {
        match self.entries.get(key)? {
            Some(v) => Ok(v.to_vec()),
            None => Err(LedgerError::NotFound(String::from_utf8_lossy(key).into_owned())),
        }
    }

    /// Durable single-key delete. Deleting a missing key is not an error.
    pub fn remove(&self, key: &[u8]) -> Result<(), LedgerError> {
        self.entries.remove(key)?;
        self.entries.flush()?;
        Ok(())
    }

    /// Keys under `prefix` whose height is at least `min_height`, ascending.
    pub fn query_prefix_above(
        &self,
        prefix: LedgerPrefix,
        min_height: u32,
    ) -> Result<Vec<LedgerKey>, LedgerError> {
        let start = encode_key(prefix, min_height, "");
        let mut keys = Vec::new();

        for item in self.entries.range(start..) {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match decode_key(prefix, &key) {
                Ok(k) => keys.push(k),
                Err(e) => warn!(error = %e, "Skipping undecodable ledger key"),
            }
        }

        Ok(keys)
    }

    /// Write `value` for `name` at `height` under `prefix`.
    pub fn record_at_height(
        &self,
        prefix: LedgerPrefix,
        height: u32,
        name: &str,
        value: &[u8],
    ) -> Result<(), LedgerError> {
        self.put(&encode_key(prefix, height, name), value)
    }

    /// Record a confirmed filler file. The value is the height as a decimal
    /// string.
    pub fn record_idle_file(&self, height: u32, hash: &str) -> Result<(), LedgerError> {
        debug!(hash = %hash, height, "Recording idle file");
        self.record_at_height(
            LedgerPrefix::IdleFile,
            height,
            hash,
            height.to_string().as_bytes(),
        )
    }

    /// Record a service file root stored at `height`.
    pub fn record_service_root(&self, height: u32, root: &str) -> Result<(), LedgerError> {
        self.record_at_height(
            LedgerPrefix::Metadata,
            height,
            root,
            height.to_string().as_bytes(),
        )
    }

    /// Record a submission that produced a transaction hash but was not
    /// confirmed.
    pub fn record_pending(&self, hash: &str, tx_hash: &str) -> Result<(), LedgerError> {
        self.record_at_height(LedgerPrefix::IdlePending, 0, hash, tx_hash.as_bytes())
    }

    /// All pending submissions as `(file hash, tx hash)`.
    pub fn pending_entries(&self) -> Result<Vec<(String, String)>, LedgerError> {
        let mut out = Vec::new();
        for item in self.entries.scan_prefix(LedgerPrefix::IdlePending.as_bytes()) {
            let (key, value) = item?;
            let key = decode_key(LedgerPrefix::IdlePending, &key)?;
            let tx = String::from_utf8(value.to_vec())
                .map_err(|e| LedgerError::Corrupt(format!("non-utf8 tx hash: {}", e)))?;
            out.push((key.name, tx));
        }
        Ok(out)
    }

    /// Whether `hash` is already registered, confirmed at any height or
    /// pending confirmation.
    pub fn knows_idle_file(&self, hash: &str) -> Result<bool, LedgerError> {
        if self
            .entries
            .contains_key(encode_key(LedgerPrefix::IdlePending, 0, hash))?
        {
            return Ok(true);
        }
        Ok(self
            .query_prefix_above(LedgerPrefix::IdleFile, 0)?
            .iter()
            .any(|k| k.name == hash))
    }

    pub fn clear_pending(&self, hash: &str) -> Result<(), LedgerError> {
        self.remove(&encode_key(LedgerPrefix::IdlePending, 0, hash))
    }

    /// Overwrite the aggregate signature for `category`.
    pub fn store_sigma(
        &self,
        category: ProofCategory,
        record: &SigmaRecord,
    ) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(record)
            .map_err(|e| LedgerError::Corrupt(format!("sigma encode: {}", e)))?;
        self.put(sigma_key(category), &bytes)
    }

    pub fn load_sigma(&self, category: ProofCategory) -> Result<Option<SigmaRecord>, LedgerError> {
        match self.entries.get(sigma_key(category))? {
            Some(v) => bincode::deserialize(&v)
                .map(Some)
                .map_err(|e| LedgerError::Corrupt(format!("sigma decode: {}", e))),
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!(error = %e, "Failed to flush ledger on drop");
        }
    }
}
