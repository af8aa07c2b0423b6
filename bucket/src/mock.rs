//! In-memory implementations of the chain, transport and proof seams.
//!
//! Used by the unit and integration tests to drive both control loops
//! without a chain gateway, an iroh endpoint or a proof service.

use crate::chain::{AttestationWorker, ChainClient};
use crate::error::{ChainError, ProofError, SubmitFailure, TransportError};
use crate::p2p::{DeliverySenders, PeerAddr, PeerTransport};
use crate::proof::{ProofEngine, RsaKeyPair};
use async_trait::async_trait;
use common::{
    ChallengeWindow, IdleFileMeta, IdleFileRequest, ProofFragment, ProofStatus, QueryElement, Tag,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// ============================================================================
// Chain
// ============================================================================

#[derive(Default)]
struct ChainState {
    verifier_key: Vec<u8>,
    window: Option<ChallengeWindow>,
    workers: Vec<AttestationWorker>,
    submit_result: Option<Result<String, SubmitFailure>>,
    heights: HashMap<String, u32>,
    submissions: Vec<(Vec<u8>, Vec<IdleFileMeta>)>,
    next_tx: u64,
}

/// Scriptable chain.
///
/// Submissions succeed with a fresh `0x<n>` transaction hash unless a result
/// was set with [`MockChainClient::set_submit_result`]. A transaction is
/// unconfirmed until [`MockChainClient::confirm`] gives it a height.
pub struct MockChainClient {
    synced: AtomicBool,
    state: Mutex<ChainState>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            synced: AtomicBool::new(true),
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn set_verifier_key(&self, key: &[u8]) {
        self.state.lock().verifier_key = key.to_vec();
    }

    pub fn set_window(&self, window: ChallengeWindow) {
        self.state.lock().window = Some(window);
    }

    pub fn clear_window(&self) {
        self.state.lock().window = None;
    }

    pub fn add_worker(&self, worker: AttestationWorker) {
        self.state.lock().workers.push(worker);
    }

    /// Fix the outcome of every following submission.
    pub fn set_submit_result(&self, result: Result<String, SubmitFailure>) {
        self.state.lock().submit_result = Some(result);
    }

    pub fn confirm(&self, tx_hash: &str, height: u32) {
        self.state.lock().heights.insert(tx_hash.to_string(), height);
    }

    /// Every submission so far as `(verifier key, files)`.
    pub fn submissions(&self) -> Vec<(Vec<u8>, Vec<IdleFileMeta>)> {
        self.state.lock().submissions.clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn query_verifier_public_key(&self) -> Result<Vec<u8>, ChainError> {
        Ok(self.state.lock().verifier_key.clone())
    }

    async fn query_challenge_window(&self, _account: &[u8]) -> Result<ChallengeWindow, ChainError> {
        self.state.lock().window.clone().ok_or(ChainError::NotFound)
    }

    async fn query_attestation_workers(&self) -> Result<Vec<AttestationWorker>, ChainError> {
        Ok(self.state.lock().workers.clone())
    }

    async fn submit_idle_file_metadata(
        &self,
        verifier_key: &[u8],
        files: &[IdleFileMeta],
    ) -> Result<String, SubmitFailure> {
        let mut state = self.state.lock();
        state
            .submissions
            .push((verifier_key.to_vec(), files.to_vec()));
        match state.submit_result.clone() {
            Some(result) => result,
            None => {
                state.next_tx += 1;
                Ok(format!("0x{:x}", state.next_tx))
            }
        }
    }

    async fn query_confirmed_height(&self, tx_hash: &str) -> Result<u32, ChainError> {
        self.state
            .lock()
            .heights
            .get(tx_hash)
            .copied()
            .ok_or_else(|| ChainError::NotYetConfirmed(tx_hash.to_string()))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Files a mock worker pushes once it accepts a request. `None` simulates a
/// delivery that never arrives.
#[derive(Debug, Clone, Default)]
pub struct MockDelivery {
    pub data: Option<PathBuf>,
    pub tag: Option<PathBuf>,
}

#[derive(Default)]
struct TransportState {
    rejecting: HashSet<String>,
    unreachable: HashSet<String>,
    deliveries: VecDeque<MockDelivery>,
    requests: Vec<(String, IdleFileRequest)>,
    released: Vec<String>,
    connects: usize,
}

/// Transport whose workers answer from a queue of prepared deliveries.
pub struct MockTransport {
    peer_id: String,
    senders: DeliverySenders,
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new(peer_id: impl Into<String>, senders: DeliverySenders) -> Self {
        Self {
            peer_id: peer_id.into(),
            senders,
            state: Mutex::new(TransportState::default()),
        }
    }

    /// The worker acknowledges requests with an error.
    pub fn reject(&self, peer_id: &str) {
        self.state.lock().rejecting.insert(peer_id.to_string());
    }

    /// Connecting to the worker fails.
    pub fn unreachable(&self, peer_id: &str) {
        self.state.lock().unreachable.insert(peer_id.to_string());
    }

    pub fn queue_delivery(&self, delivery: MockDelivery) {
        self.state.lock().deliveries.push_back(delivery);
    }

    /// Accepted and rejected requests as `(worker peer id, request)`.
    pub fn requests(&self) -> Vec<(String, IdleFileRequest)> {
        self.state.lock().requests.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Workers whose requests were released, in order.
    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn find_peer(&self, peer_id: &str) -> Result<PeerAddr, TransportError> {
        Ok(PeerAddr::new(peer_id))
    }

    async fn connect(&self, addr: &PeerAddr) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.unreachable.contains(&addr.peer_id) {
            return Err(TransportError::Connect(format!("{} unreachable", addr.peer_id)));
        }
        Ok(())
    }

    async fn send_fetch_request(
        &self,
        addr: &PeerAddr,
        request: &IdleFileRequest,
    ) -> Result<(), TransportError> {
        let delivery = {
            let mut state = self.state.lock();
            state.requests.push((addr.peer_id.clone(), request.clone()));
            if state.rejecting.contains(&addr.peer_id) {
                return Err(TransportError::Request("ERROR: busy".to_string()));
            }
            state.deliveries.pop_front().unwrap_or_default()
        };

        if let Some(path) = delivery.data {
            let _ = self.senders.data.send(path).await;
        }
        if let Some(path) = delivery.tag {
            let _ = self.senders.tag.send(path).await;
        }
        Ok(())
    }

    fn release_request(&self, peer_id: &str) {
        self.state.lock().released.push(peer_id.to_string());
    }
}

// ============================================================================
// Proof engine
// ============================================================================

/// Deterministic proof engine.
///
/// A proven file yields `mu-<name>`; the aggregate is the SHA-256 of the
/// proven names joined with commas, in the order given.
#[derive(Default)]
pub struct MockProofEngine {
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    fail_aggregate: AtomicBool,
    aggregate_calls: AtomicUsize,
}

impl MockProofEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_file(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    /// Proving this file never completes.
    pub fn hang_file(&self, name: &str) {
        self.hanging.lock().insert(name.to_string());
    }

    /// Make every aggregation fail until switched off again.
    pub fn set_fail_aggregate(&self, fail: bool) {
        self.fail_aggregate.store(fail, Ordering::SeqCst);
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn expected_sigma(names: &[&str]) -> String {
        common::sha256_hex(names.join(",").as_bytes())
    }
}

#[async_trait]
impl ProofEngine for MockProofEngine {
    async fn generate_fragment(
        &self,
        _key: &RsaKeyPair,
        _query: &[QueryElement],
        tag: &Tag,
        blocks: Vec<Vec<u8>>,
    ) -> ProofFragment {
        let hang = self.hanging.lock().contains(&tag.name);
        if hang {
            futures::future::pending::<()>().await;
        }
        let fail = self.failing.lock().contains(&tag.name);
        if fail || blocks.len() != tag.block_count() {
            return ProofFragment::failed(ProofStatus::MathFailure);
        }
        ProofFragment {
            status: ProofStatus::Success,
            mu: format!("mu-{}", tag.name),
        }
    }

    async fn aggregate(
        &self,
        _key: &RsaKeyPair,
        _query: &[QueryElement],
        tags: &[Tag],
    ) -> Result<String, ProofError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_aggregate.load(Ordering::SeqCst) {
            return Err(ProofError::Remote("aggregation unavailable".to_string()));
        }
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        Ok(Self::expected_sigma(&names))
    }
}
