//! Shared types and helpers for the bucket storage node.
//!
//! This crate holds the data model exchanged between the node, the chain
//! gateway, the proof-math service and attestation workers:
//!
//! - **Tags**: per-file cryptographic descriptors produced at ingestion time
//! - **Challenge windows**: chain-published proving rounds and their query vector
//! - **Proof artifacts**: per-file fragments and the on-disk round bundles
//! - **Idle files**: metadata submitted on-chain and the fetch request sent to workers
//! - **Delivery framing**: header used when a worker pushes filler files back
//!
//! Everything here is plain data plus a handful of hashing and path helpers;
//! no component state lives in this crate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

// ============================================================================
// Protocol constants
// ============================================================================

/// One mebibyte.
pub const SIZE_1MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const SIZE_1GIB: u64 = 1024 * SIZE_1MIB;

/// Chain block interval in seconds. Every retry/back-off in the node is one block.
pub const BLOCK_INTERVAL_SECS: u64 = 6;

/// Size of a filler file requested from an attestation worker.
pub const FRAGMENT_SIZE: u64 = 8 * SIZE_1MIB;

/// Number of blocks a filler file is split into for tagging and proving.
pub const BLOCK_NUMBER: u32 = 1024;

/// Free disk space below which no new filler file is requested.
pub const MIN_FREE_SPACE: u64 = 100 * SIZE_1MIB;

/// File extension of tag files stored next to their data.
pub const TAG_EXTENSION: &str = "tag";

/// Magic byte that starts every framed idle-file delivery stream.
pub const DELIVERY_MAGIC: u8 = 0x02;

/// Maximum size of a delivery header (JSON).
pub const MAX_DELIVERY_HEADER: usize = 4096;

// ============================================================================
// Tags
// ============================================================================

/// Per-file cryptographic descriptor.
///
/// Produced once when a file is ingested and immutable afterwards. The proof
/// engine consumes it verbatim; the node only reads `name`, `u` and the length
/// of `phi` (which fixes the block count used to split the file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Content hash of the file this tag describes.
    #[serde(rename = "Name")]
    pub name: String,
    /// Encoded public randomizers.
    #[serde(rename = "U")]
    pub u: String,
    /// Ordered per-block tag elements.
    #[serde(rename = "Phi")]
    pub phi: Vec<String>,
    /// Hash over `phi`.
    #[serde(rename = "PhiHash", default)]
    pub phi_hash: String,
    /// Attestation blob issued by the worker that generated the tag.
    #[serde(rename = "Attest", default)]
    pub attest: String,
}

impl Tag {
    /// Number of blocks the tagged file is split into.
    pub fn block_count(&self) -> usize {
        self.phi.len()
    }

    /// Parse a tag from its JSON encoding.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// Challenges
// ============================================================================

/// Chain-published proving round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeWindow {
    /// Block height at which the round starts. Zero means no open window.
    pub start: u32,
    /// Round randomness.
    #[serde(with = "hex_bytes")]
    pub random: Vec<u8>,
}

impl ChallengeWindow {
    /// A window is open once its start height is non-zero.
    pub fn is_open(&self) -> bool {
        self.start != 0
    }

    /// Derive the query vector for this round.
    ///
    /// The vector currently has a single element at index 0 carrying the
    /// round randomness.
    pub fn query(&self) -> Vec<QueryElement> {
        vec![QueryElement {
            index: 0,
            value: self.random.clone(),
        }]
    }
}

/// One element of the challenge query vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryElement {
    pub index: u64,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

// ============================================================================
// Proof artifacts
// ============================================================================

/// Data category proven in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofCategory {
    /// Filler files acquired from attestation workers.
    Idle,
    /// User file shards.
    Service,
}

impl ProofCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofCategory::Idle => "idle",
            ProofCategory::Service => "service",
        }
    }
}

impl std::fmt::Display for ProofCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome class of a single proof computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Success,
    MathFailure,
    IoFailure,
    Timeout,
}

/// Per-file output of the proof engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofFragment {
    pub status: ProofStatus,
    /// Blinded aggregate. Empty unless `status` is `Success`.
    #[serde(default)]
    pub mu: String,
}

impl ProofFragment {
    pub fn failed(status: ProofStatus) -> Self {
        Self {
            status,
            mu: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProofStatus::Success
    }
}

/// Round bundle persisted per category: names and randomizers of every file
/// that was proven successfully, in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    #[serde(rename = "Name")]
    pub names: Vec<String>,
    #[serde(rename = "U")]
    pub u: Vec<String>,
}

/// Companion bundle holding the blinded aggregates, parallel to [`ProofBundle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofMuBundle {
    #[serde(rename = "Mu")]
    pub mu: Vec<String>,
}

// ============================================================================
// Idle files
// ============================================================================

/// Metadata of a filler file, submitted on-chain after it has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleFileMeta {
    pub block_num: u32,
    pub hash: String,
    /// Staking account of this node (hex public key).
    pub miner_acc: String,
}

/// Request sent to an attestation worker asking for one filler file.
///
/// `signature` is the staking key's signature over `peer_id`, which lets the
/// worker bind the delivery target to an on-chain staking account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleFileRequest {
    pub fragment_size: u64,
    pub block_count: u32,
    /// Hex encoded staking public key.
    pub staking_account: String,
    /// Network identity the worker must deliver to.
    pub peer_id: String,
    /// Hex encoded ed25519 signature.
    pub signature: String,
}

/// Which half of a filler pair a delivery stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Data,
    Tag,
}

/// Header of a framed delivery: `[DELIVERY_MAGIC][u32 LE len][JSON header][bytes]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHeader {
    pub kind: DeliveryKind,
    /// Content hash of the filler file (also its basename).
    pub name: String,
    pub len: u64,
}

// ============================================================================
// Helpers
// ============================================================================

/// Current Unix timestamp in seconds, 0 on clock errors.
#[inline]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Checks if a string is a valid 64-character hex content hash.
#[inline]
pub fn is_valid_file_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of a file's contents, streamed in 64 KiB reads.
pub fn calc_path_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Basename of a path as UTF-8, if it has one.
pub fn file_basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Parse a relay URL from configuration or the `IROH_RELAY_URL` environment
/// variable. `None` means the n0 default relays are used.
pub fn get_relay_url(config_url: Option<&str>) -> Option<iroh_base::RelayUrl> {
    config_url
        .map(str::to_owned)
        .or_else(|| std::env::var("IROH_RELAY_URL").ok())
        .and_then(|s| s.parse().ok())
}

/// Build the endpoint relay mode for an optional custom relay.
pub fn build_relay_mode(url: Option<&iroh_base::RelayUrl>) -> iroh::endpoint::RelayMode {
    match url {
        Some(url) => {
            let relay_config = iroh::RelayConfig {
                url: url.clone(),
                quic: None,
            };
            iroh::endpoint::RelayMode::Custom(iroh::RelayMap::from_iter([relay_config]))
        }
        None => iroh::endpoint::RelayMode::Default,
    }
}

/// Serde adapter encoding byte vectors as lowercase hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
