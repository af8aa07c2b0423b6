//! Chain query/submit capability.
//!
//! The node talks to the chain through a JSON gateway. [`ChainClient`] is the
//! seam both control loops depend on; [`HttpChainClient`] is the production
//! implementation with ordered failover across the configured RPC URLs.

use crate::error::{ChainError, SubmitFailure};
use async_trait::async_trait;
use common::{ChallengeWindow, IdleFileMeta};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// An attestation worker registered on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationWorker {
    /// Worker's public key; also the verifier key used when submitting
    /// metadata for files it issued.
    #[serde(with = "common::hex_bytes")]
    pub account: Vec<u8>,
    /// Network identity used to reach the worker.
    pub peer_id: String,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Whether the connected chain node is synced. Loops idle while it is not.
    async fn is_synced(&self) -> bool;

    async fn query_verifier_public_key(&self) -> Result<Vec<u8>, ChainError>;

    async fn query_challenge_window(&self, account: &[u8]) -> Result<ChallengeWindow, ChainError>;

    async fn query_attestation_workers(&self) -> Result<Vec<AttestationWorker>, ChainError>;

    /// Submit filler file metadata. Returns the transaction hash.
    async fn submit_idle_file_metadata(
        &self,
        verifier_key: &[u8],
        files: &[IdleFileMeta],
    ) -> Result<String, SubmitFailure>;

    /// Block height at which `tx_hash` was included.
    async fn query_confirmed_height(&self, tx_hash: &str) -> Result<u32, ChainError>;
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    #[serde(with = "common::hex_bytes")]
    public_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    synced: bool,
}

#[derive(Debug, Deserialize)]
struct HeightResponse {
    height: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    #[serde(with = "common::hex_bytes")]
    verifier_key: Vec<u8>,
    files: &'a [IdleFileMeta],
}

#[derive(Debug, Default, Deserialize)]
struct SubmitResponse {
    tx_hash: Option<String>,
    error: Option<String>,
}

/// Chain client over the JSON gateway.
pub struct HttpChainClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpChainClient {
    pub fn new(endpoints: &[String], insecure_tls: bool) -> anyhow::Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("at least one chain RPC endpoint is required");
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoints: endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    /// GET `path` from the first endpoint that answers.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let mut last_err = ChainError::Transport("no endpoints".to_string());
        for base in &self.endpoints {
            let url = format!("{}{}", base, path);
            let resp = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, error = %e, "Chain endpoint unreachable, trying next");
                    last_err = ChainError::Transport(e.to_string());
                    continue;
                }
            };
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(ChainError::NotFound);
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                last_err = ChainError::Transport(format!("{}: {}", status, text));
                continue;
            }
            return resp
                .json::<T>()
                .await
                .map_err(|e| ChainError::Decode(e.to_string()));
        }
        Err(last_err)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn is_synced(&self) -> bool {
        match self.get_json::<HealthResponse>("/v1/health").await {
            Ok(h) => h.synced,
            Err(e) => {
                debug!(error = %e, "Chain health query failed");
                false
            }
        }
    }

    async fn query_verifier_public_key(&self) -> Result<Vec<u8>, ChainError> {
        let resp: PublicKeyResponse = self.get_json("/v1/verifier/public-key").await?;
        if resp.public_key.is_empty() {
            return Err(ChainError::NotFound);
        }
        Ok(resp.public_key)
    }

    async fn query_challenge_window(&self, account: &[u8]) -> Result<ChallengeWindow, ChainError> {
        self.get_json(&format!("/v1/challenge/{}", hex::encode(account)))
            .await
    }

    async fn query_attestation_workers(&self) -> Result<Vec<AttestationWorker>, ChainError> {
        self.get_json("/v1/attestation-workers").await
    }

    async fn submit_idle_file_metadata(
        &self,
        verifier_key: &[u8],
        files: &[IdleFileMeta],
    ) -> Result<String, SubmitFailure> {
        let request = SubmitRequest {
            verifier_key: verifier_key.to_vec(),
            files,
        };

        let mut reason = "no endpoints".to_string();
        for base in &self.endpoints {
            let url = format!("{}/v1/idle-files", base);
            let resp = match self.client.post(&url).json(&request).send().await {
                Ok(r) => r,
                Err(e) => {
                    // Not sent; another endpoint may take it.
                    warn!(url = %url, error = %e, "Chain endpoint unreachable, trying next");
                    reason = e.to_string();
                    continue;
                }
            };

            let status = resp.status();
            let body: SubmitResponse = resp.json().await.unwrap_or_default();
            return match (status.is_success(), body.tx_hash, body.error) {
                (true, Some(tx), None) => Ok(tx),
                (_, tx_hash, error) => Err(SubmitFailure {
                    tx_hash,
                    reason: error.unwrap_or_else(|| format!("HTTP {}", status)),
                }),
            };
        }

        Err(SubmitFailure {
            tx_hash: None,
            reason,
        })
    }

    async fn query_confirmed_height(&self, tx_hash: &str) -> Result<u32, ChainError> {
        let resp: HeightResponse = self.get_json(&format!("/v1/tx/{}/height", tx_hash)).await?;
        resp.height
            .filter(|h| *h != 0)
            .ok_or_else(|| ChainError::NotYetConfirmed(tx_hash.to_string()))
    }
}
