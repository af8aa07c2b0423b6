//! Staking identity: the signing key that binds this node's network identity
//! to its on-chain staking account.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parity_scale_codec::Encode;
use std::path::Path;
use tracing::info;

/// Domain separator for peer identity signatures (must match attestation workers)
const PEER_IDENTITY_DOMAIN_SEPARATOR: &[u8] = b"BUCKET_PEER_IDENTITY_V1";

/// Canonical bytes signed when asking a worker for a filler file.
///
/// SCALE encode: (domain_sep, peer_id)
pub fn peer_identity_signing_bytes(peer_id: &[u8]) -> Vec<u8> {
    (PEER_IDENTITY_DOMAIN_SEPARATOR, peer_id).encode()
}

/// The node's staking key.
pub struct StakingIdentity {
    signing_key: SigningKey,
}

impl StakingIdentity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Load the key at `path`, generating and persisting a new one if absent.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        let signing_key = load_or_generate_keypair(path)?;
        let identity = Self::from_signing_key(signing_key);
        info!(account = %identity.account_hex(), "Staking identity loaded");
        Ok(identity)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Staking account as hex, the form used in chain metadata and requests.
    pub fn account_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Sign this node's network identity.
    pub fn sign_peer_identity(&self, peer_id: &[u8]) -> Signature {
        self.signing_key.sign(&peer_identity_signing_bytes(peer_id))
    }
}

/// Verify a peer identity signature produced by [`StakingIdentity::sign_peer_identity`].
pub fn verify_peer_identity(public_key: &[u8], peer_id: &[u8], signature: &[u8]) -> bool {
    let Ok(pubkey_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(pubkey) = VerifyingKey::from_bytes(&pubkey_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    pubkey
        .verify(&peer_identity_signing_bytes(peer_id), &signature)
        .is_ok()
}

/// Load or generate a signing keypair.
///
/// On Unix, the keypair file is created with mode 0600 (owner read/write only).
pub fn load_or_generate_keypair(path: &Path) -> anyhow::Result<SigningKey> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid keypair file size: {} bytes", bytes.len()))?;
        return Ok(SigningKey::from_bytes(&key_bytes));
    }

    let mut key_bytes = [0u8; 32];
    getrandom::fill(&mut key_bytes)?;
    let signing_key = SigningKey::from_bytes(&key_bytes);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&signing_key.to_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, signing_key.to_bytes())?;
    }

    info!(path = %path.display(), "Generated new staking keypair");
    Ok(signing_key)
}
