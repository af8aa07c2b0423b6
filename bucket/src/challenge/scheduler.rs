//! Challenge scheduler: waits for the verifier key, then proves every open
//! challenge window for both data categories and records the aggregate
//! signatures.
//!
//! States: `AwaitVerifierKey -> AwaitChallenge -> ProvingIdle ->
//! ProvingService -> RecordResults -> AwaitChallenge`.

use crate::challenge::aggregator::{ProofAggregator, RoundOutcome};
use crate::chain::ChainClient;
use crate::error::{AggregateError, ChainError, ErrorClass, LoopError};
use crate::ledger::{Ledger, SigmaRecord};
use crate::proof::RsaKeyPair;
use crate::supervisor::sleep_or_shutdown;
use common::{ChallengeWindow, ProofCategory};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of both categories for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub idle: RoundOutcome,
    pub service: RoundOutcome,
}

pub struct ChallengeScheduler {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<Ledger>,
    aggregator: ProofAggregator,
    /// Staking account the chain addresses challenges to.
    account: Vec<u8>,
    block_interval: Duration,
    /// Start height of the last window whose results were recorded. Zero
    /// before the first round.
    last_proven: AtomicU32,
}

impl ChallengeScheduler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Arc<Ledger>,
        aggregator: ProofAggregator,
        account: Vec<u8>,
        block_interval: Duration,
    ) -> Self {
        Self {
            chain,
            ledger,
            aggregator,
            account,
            block_interval,
            last_proven: AtomicU32::new(0),
        }
    }

    pub fn last_proven(&self) -> u32 {
        self.last_proven.load(Ordering::SeqCst)
    }

    /// Run until shutdown. Only a ledger failure while recording results ends
    /// the loop early.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), LoopError> {
        if let Some(record) = self.ledger.load_sigma(ProofCategory::Idle)? {
            self.last_proven.store(record.window_start, Ordering::SeqCst);
        }
        info!(
            interval = ?self.block_interval,
            last_proven = self.last_proven(),
            "Challenge scheduler started"
        );

        let Some(mut key) = self.await_verifier_key(&mut shutdown).await else {
            return Ok(());
        };

        loop {
            let Some(window) = self.await_challenge(&mut shutdown).await else {
                return Ok(());
            };
            key = self.refresh_key(key).await;

            match self.prove_window(&key, &window, &shutdown).await {
                Ok(Some(outcome)) => self.record_results(window.start, &outcome)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    match e.class() {
                        ErrorClass::Fatal => {
                            error!(start = window.start, error = %e, "Abandoning challenge window")
                        }
                        ErrorClass::Resource => {
                            info!(start = window.start, reason = %e, "Abandoning challenge window")
                        }
                        _ => warn!(start = window.start, error = %e, "Abandoning challenge window"),
                    }
                    if !sleep_or_shutdown(self.block_interval, &mut shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Poll until the chain publishes a verifier key. `None` on shutdown.
    async fn await_verifier_key(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Arc<RsaKeyPair>> {
        loop {
            match self.chain.query_verifier_public_key().await {
                Ok(bytes) if !bytes.is_empty() => match RsaKeyPair::from_public_key(&bytes) {
                    Ok(key) => {
                        info!(fingerprint = %key.fingerprint(), "Verifier key loaded");
                        return Some(Arc::new(key));
                    }
                    Err(e) => warn!(error = %e, "Verifier key rejected"),
                },
                Ok(_) | Err(ChainError::NotFound) => debug!("Verifier key not published yet"),
                Err(e) => warn!(error = %e, "Failed to query verifier key"),
            }
            if !sleep_or_shutdown(self.block_interval, shutdown).await {
                return None;
            }
        }
    }

    /// Poll until a window opens that has not been proven yet. `None` on
    /// shutdown.
    async fn await_challenge(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ChallengeWindow> {
        loop {
            match self.chain.query_challenge_window(&self.account).await {
                Ok(window) if window.is_open() && window.start != self.last_proven() => {
                    info!(start = window.start, "Challenge window open");
                    return Some(window);
                }
                Ok(window) if window.is_open() => {
                    debug!(start = window.start, "Window already proven");
                }
                Ok(_) => debug!("No open challenge window"),
                Err(ChainError::NotFound) => debug!("No challenge for this account"),
                Err(e) => warn!(error = %e, "Failed to query challenge window"),
            }
            if !sleep_or_shutdown(self.block_interval, shutdown).await {
                return None;
            }
        }
    }

    /// Swap in the chain's current verifier key if it changed.
    async fn refresh_key(&self, current: Arc<RsaKeyPair>) -> Arc<RsaKeyPair> {
        match self.chain.query_verifier_public_key().await {
            Ok(bytes) if !bytes.is_empty() && bytes != current.public_key() => {
                match RsaKeyPair::from_public_key(&bytes) {
                    Ok(key) => {
                        info!(fingerprint = %key.fingerprint(), "Verifier key rotated");
                        Arc::new(key)
                    }
                    Err(e) => {
                        warn!(error = %e, "New verifier key rejected, keeping current");
                        current
                    }
                }
            }
            Ok(_) => current,
            Err(e) => {
                debug!(error = %e, "Verifier key refresh failed, keeping current");
                current
            }
        }
    }

    /// Prove the idle category, then the service category, against the same
    /// window. `Ok(None)` if shutdown was requested in between.
    pub async fn prove_window(
        &self,
        key: &Arc<RsaKeyPair>,
        window: &ChallengeWindow,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<WindowOutcome>, AggregateError> {
        let idle = self.prove_category(key, window, ProofCategory::Idle).await?;
        if *shutdown.borrow() {
            return Ok(None);
        }
        let service = self
            .prove_category(key, window, ProofCategory::Service)
            .await?;
        Ok(Some(WindowOutcome { idle, service }))
    }

    async fn prove_category(
        &self,
        key: &Arc<RsaKeyPair>,
        window: &ChallengeWindow,
        category: ProofCategory,
    ) -> Result<RoundOutcome, AggregateError> {
        match self
            .aggregator
            .prove(key, window, category)
            .await
        {
            Err(AggregateError::NoEligibleFiles(start)) => {
                info!(category = %category, start, "Nothing to prove");
                Ok(RoundOutcome {
                    sigma: String::new(),
                    bundle_hash: String::new(),
                    proven: 0,
                    skipped: 0,
                })
            }
            other => other,
        }
    }

    /// Persist both signatures, then mark the window as proven.
    pub fn record_results(&self, start: u32, outcome: &WindowOutcome) -> Result<(), LoopError> {
        let now = common::now_secs();
        for (category, round) in [
            (ProofCategory::Idle, &outcome.idle),
            (ProofCategory::Service, &outcome.service),
        ] {
            let record = SigmaRecord {
                window_start: start,
                sigma: round.sigma.clone(),
                bundle_hash: round.bundle_hash.clone(),
                proven: round.proven as u32,
                recorded_at: now,
            };
            if let Err(e) = self.ledger.store_sigma(category, &record) {
                error!(category = %category, start, error = %e, "Failed to record aggregate signature");
                return Err(e.into());
            }
        }
        self.last_proven.store(start, Ordering::SeqCst);
        info!(
            start,
            idle_proven = outcome.idle.proven,
            service_proven = outcome.service.proven,
            "Challenge results recorded"
        );
        Ok(())
    }
}
