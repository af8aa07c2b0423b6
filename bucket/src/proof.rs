//! Proof-math capability: verifier key, file splitting and the proof engine.
//!
//! The homomorphic tag math itself runs in a separate proof service; this
//! module owns the parts the node is responsible for (key lifetime, splitting
//! file bytes into the block matrix) and the client that talks to the service.

use crate::error::ProofError;
use async_trait::async_trait;
use common::{ProofFragment, ProofStatus, QueryElement, Tag};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Verifier key pair derived from the chain-published public key.
///
/// Immutable once built. The scheduler holds it in an `Arc` and hands clones
/// to every proof invocation; a new value is built only when the on-chain key
/// changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKeyPair {
    public_key: Vec<u8>,
}

impl RsaKeyPair {
    pub fn from_public_key(bytes: &[u8]) -> Result<Self, ProofError> {
        if bytes.is_empty() {
            return Err(ProofError::InvalidKey("empty public key".to_string()));
        }
        Ok(Self {
            public_key: bytes.to_vec(),
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        common::sha256_hex(&self.public_key)[..16].to_string()
    }
}

/// Split a file into `block_count` equally sized blocks.
///
/// Block size is `ceil(len / block_count)`; the last block is zero padded.
pub async fn split_into_blocks(path: &Path, block_count: usize) -> Result<Vec<Vec<u8>>, ProofError> {
    if block_count == 0 {
        return Err(ProofError::Split("block count is zero".to_string()));
    }
    let data = tokio::fs::read(path).await?;
    if data.is_empty() {
        return Err(ProofError::Split(format!("{} is empty", path.display())));
    }

    let block_size = data.len().div_ceil(block_count);
    let mut blocks = Vec::with_capacity(block_count);
    for i in 0..block_count {
        let start = (i * block_size).min(data.len());
        let end = ((i + 1) * block_size).min(data.len());
        let mut block = data[start..end].to_vec();
        block.resize(block_size, 0);
        blocks.push(block);
    }
    Ok(blocks)
}

/// Per-file proof generation and cross-file aggregation.
#[async_trait]
pub trait ProofEngine: Send + Sync {
    /// Prove one file. Failures are reported through the fragment status.
    async fn generate_fragment(
        &self,
        key: &RsaKeyPair,
        query: &[QueryElement],
        tag: &Tag,
        blocks: Vec<Vec<u8>>,
    ) -> ProofFragment;

    /// Combine the tags of every proven file into one aggregate signature.
    async fn aggregate(
        &self,
        key: &RsaKeyPair,
        query: &[QueryElement],
        tags: &[Tag],
    ) -> Result<String, ProofError>;
}

/// Header of a fragment request: `[u32 LE header_len][JSON header][blocks]`.
#[derive(Debug, Serialize)]
struct FragmentRequestHeader<'a> {
    #[serde(with = "common::hex_bytes")]
    public_key: Vec<u8>,
    query: &'a [QueryElement],
    tag: &'a Tag,
    block_count: usize,
    block_size: usize,
}

#[derive(Debug, Serialize)]
struct AggregateRequest<'a> {
    #[serde(with = "common::hex_bytes")]
    public_key: Vec<u8>,
    query: &'a [QueryElement],
    tags: &'a [Tag],
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    sigma: String,
}

/// Proof engine backed by the proof service over HTTP.
pub struct RemoteProofEngine {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteProofEngine {
    pub fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn frame_fragment_request(
        key: &RsaKeyPair,
        query: &[QueryElement],
        tag: &Tag,
        blocks: &[Vec<u8>],
    ) -> Result<Vec<u8>, serde_json::Error> {
        let header = FragmentRequestHeader {
            public_key: key.public_key().to_vec(),
            query,
            tag,
            block_count: blocks.len(),
            block_size: blocks.first().map(Vec::len).unwrap_or(0),
        };
        let header_bytes = serde_json::to_vec(&header)?;
        let data_len: usize = blocks.iter().map(Vec::len).sum();
        let mut body = Vec::with_capacity(4 + header_bytes.len() + data_len);
        body.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(&header_bytes);
        for block in blocks {
            body.extend_from_slice(block);
        }
        Ok(body)
    }
}

#[async_trait]
impl ProofEngine for RemoteProofEngine {
    async fn generate_fragment(
        &self,
        key: &RsaKeyPair,
        query: &[QueryElement],
        tag: &Tag,
        blocks: Vec<Vec<u8>>,
    ) -> ProofFragment {
        let body = match Self::frame_fragment_request(key, query, tag, &blocks) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %tag.name, error = %e, "Failed to encode fragment request");
                return ProofFragment::failed(ProofStatus::MathFailure);
            }
        };
        drop(blocks);

        let url = format!("{}/v1/proof/fragment", self.base_url);
        let resp = match self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %tag.name, error = %e, "Proof service unreachable");
                return ProofFragment::failed(ProofStatus::IoFailure);
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(file = %tag.name, status = %status, body = %text, "Proof service rejected fragment");
            return ProofFragment::failed(ProofStatus::MathFailure);
        }

        match resp.json::<ProofFragment>().await {
            Ok(fragment) => {
                debug!(file = %tag.name, status = ?fragment.status, "Fragment generated");
                fragment
            }
            Err(e) => {
                warn!(file = %tag.name, error = %e, "Malformed fragment response");
                ProofFragment::failed(ProofStatus::MathFailure)
            }
        }
    }

    async fn aggregate(
        &self,
        key: &RsaKeyPair,
        query: &[QueryElement],
        tags: &[Tag],
    ) -> Result<String, ProofError> {
        let url = format!("{}/v1/proof/aggregate", self.base_url);
        let request = AggregateRequest {
            public_key: key.public_key().to_vec(),
            query,
            tags,
        };
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProofError::Remote(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProofError::Remote(format!("{}: {}", status, text)));
        }

        let body: AggregateResponse = resp
            .json()
            .await
            .map_err(|e| ProofError::Remote(format!("decode: {}", e)))?;
        Ok(body.sigma)
    }
}
