//! Idle acquisition loop: fills committed capacity with filler files issued
//! by attestation workers.
//!
//! One cycle walks `CheckCapacity -> SelectPeer -> AwaitFetch -> Verify ->
//! Commit -> SubmitMetadata -> ConfirmHeight -> RecordLedger`. Any failing
//! step ends the cycle, and leaves every received file either deleted or
//! backed by a ledger entry (confirmed or pending).

use crate::chain::{AttestationWorker, ChainClient};
use crate::config::BucketConfig;
use crate::error::{CycleError, ErrorClass, LedgerError, LoopError, VerifyError};
use crate::identity::StakingIdentity;
use crate::ledger::Ledger;
use crate::p2p::{IdleDeliveries, PeerCache, PeerTransport};
use crate::space::verifier::verify_tag_file;
use crate::supervisor::sleep_or_shutdown;
use crate::workspace::{Workspace, remove_quietly};
use common::{IdleFileMeta, IdleFileRequest};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Knobs of the acquisition loop, taken from [`BucketConfig`].
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub block_interval: Duration,
    pub fetch_timeout: Duration,
    pub quota_bytes: u64,
    pub fragment_size: u64,
    pub block_count: u32,
    pub reconcile_pending: bool,
}

impl AcquisitionSettings {
    pub fn from_config(config: &BucketConfig) -> Self {
        Self {
            block_interval: config.block_interval(),
            fetch_timeout: config.fetch_timeout(),
            quota_bytes: config.storage.quota_bytes(),
            fragment_size: config.proof.fragment_size,
            block_count: config.proof.block_count,
            reconcile_pending: config.tuning.reconcile_pending,
        }
    }
}

/// A filler file that completed a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredFile {
    pub hash: String,
    pub height: u32,
}

/// Data and tag paths of one received filler file.
#[derive(Debug, Clone)]
struct FilePair {
    data: PathBuf,
    tag: PathBuf,
}

impl FilePair {
    async fn discard(&self) {
        remove_quietly(&self.data).await;
        remove_quietly(&self.tag).await;
    }
}

pub struct IdleAcquisition {
    chain: Arc<dyn ChainClient>,
    transport: Arc<dyn PeerTransport>,
    ledger: Arc<Ledger>,
    workspace: Workspace,
    identity: Arc<StakingIdentity>,
    deliveries: Mutex<IdleDeliveries>,
    peers: PeerCache,
    settings: AcquisitionSettings,
}

impl IdleAcquisition {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        transport: Arc<dyn PeerTransport>,
        ledger: Arc<Ledger>,
        workspace: Workspace,
        identity: Arc<StakingIdentity>,
        deliveries: IdleDeliveries,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            chain,
            transport,
            ledger,
            workspace,
            identity,
            deliveries: Mutex::new(deliveries),
            peers: PeerCache::new(),
            settings,
        }
    }

    /// Run cycles until shutdown. Returns early only on a fatal error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), LoopError> {
        info!(
            interval = ?self.settings.block_interval,
            quota_bytes = self.settings.quota_bytes,
            "Idle acquisition started"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if !self.chain.is_synced().await {
                debug!("Chain not synced, waiting");
            } else {
                if self.settings.reconcile_pending {
                    self.reconcile_pending().await?;
                }

                match self.run_cycle(&mut shutdown).await {
                    Ok(file) => {
                        info!(hash = %file.hash, height = file.height, "Idle file acquired")
                    }
                    Err(e) => match e.class() {
                        ErrorClass::Resource => info!(reason = %e, "Skipping acquisition cycle"),
                        ErrorClass::Transient => warn!(error = %e, "Acquisition cycle failed"),
                        ErrorClass::Validation => warn!(error = %e, "Discarded invalid idle file"),
                        ErrorClass::Partial => warn!(error = %e, "Idle file pending reconciliation"),
                        ErrorClass::Fatal => {
                            error!(error = %e, "Idle acquisition stopped");
                            return Err(e.into());
                        }
                    },
                }
            }

            if !sleep_or_shutdown(self.settings.block_interval, &mut shutdown).await {
                return Ok(());
            }
        }
    }

    /// One full acquisition cycle.
    pub async fn run_cycle(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<AcquiredFile, CycleError> {
        self.check_capacity().await?;

        // Held for the whole cycle so only this cycle consumes deliveries.
        let mut deliveries = self.deliveries.lock().await;
        for path in deliveries.drain_stale() {
            debug!(path = %path.display(), "Removing stale delivery");
            remove_quietly(&path).await;
        }

        let worker = self.select_peer().await?;
        let received = self.await_fetch(&mut deliveries, shutdown).await;
        self.transport.release_request(&worker.peer_id);
        drop(deliveries);
        let received = received?;

        let hash = self.admit(&received).await?;
        let files = self.place(&received, &hash).await?;
        self.commit(&worker, &hash, &files).await
    }

    async fn check_capacity(&self) -> Result<(), CycleError> {
        let workspace = self.workspace.clone();
        let quota = self.settings.quota_bytes;
        tokio::task::spawn_blocking(move || workspace.check_capacity(quota))
            .await
            .map_err(|e| CycleError::Io(std::io::Error::other(e)))?
    }

    /// Ask shuffled workers for a filler file until one accepts.
    async fn select_peer(&self) -> Result<AttestationWorker, CycleError> {
        let mut workers = self.chain.query_attestation_workers().await?;
        if workers.is_empty() {
            return Err(CycleError::NoWorker);
        }
        workers.shuffle(&mut rand::rng());

        let peer_id = self.transport.local_peer_id();
        let signature = self.identity.sign_peer_identity(peer_id.as_bytes());
        let request = IdleFileRequest {
            fragment_size: self.settings.fragment_size,
            block_count: self.settings.block_count,
            staking_account: self.identity.account_hex(),
            peer_id,
            signature: hex::encode(signature.to_bytes()),
        };

        for worker in workers {
            let addr = match self.peers.get(&worker.peer_id) {
                Some(addr) => addr,
                None => match self.transport.find_peer(&worker.peer_id).await {
                    Ok(addr) => {
                        self.peers.insert(addr.clone());
                        addr
                    }
                    Err(e) => {
                        debug!(peer = %worker.peer_id, error = %e, "Worker lookup failed");
                        continue;
                    }
                },
            };

            if let Err(e) = self.transport.connect(&addr).await {
                debug!(peer = %worker.peer_id, error = %e, "Worker unreachable");
                self.peers.remove(&worker.peer_id);
                continue;
            }

            match self.transport.send_fetch_request(&addr, &request).await {
                Ok(()) => {
                    info!(peer = %worker.peer_id, "Worker accepted idle file request");
                    return Ok(worker);
                }
                Err(e) => debug!(peer = %worker.peer_id, error = %e, "Worker declined request"),
            }
        }

        Err(CycleError::NoWorker)
    }

    /// Wait until both the data file and its tag have arrived, or the fetch
    /// budget runs out. Whatever did arrive is deleted on failure.
    async fn await_fetch(
        &self,
        deliveries: &mut IdleDeliveries,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<FilePair, CycleError> {
        let timeout = self.settings.fetch_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut data: Option<PathBuf> = None;
        let mut tag: Option<PathBuf> = None;
        let mut interrupted = false;

        while data.is_none() || tag.is_none() {
            tokio::select! {
                path = deliveries.data.recv(), if data.is_none() => match path {
                    Some(p) if !p.as_os_str().is_empty() => data = Some(p),
                    Some(_) => debug!("Ignoring empty data path"),
                    None => break,
                },
                path = deliveries.tag.recv(), if tag.is_none() => match path {
                    Some(p) if !p.as_os_str().is_empty() => tag = Some(p),
                    Some(_) => debug!("Ignoring empty tag path"),
                    None => break,
                },
                _ = &mut deadline => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        match (data, tag) {
            (Some(data), Some(tag)) => Ok(FilePair { data, tag }),
            (data, tag) => {
                let (got_data, got_tag) = (data.is_some(), tag.is_some());
                for path in data.iter().chain(tag.iter()) {
                    remove_quietly(path).await;
                }
                if interrupted {
                    Err(CycleError::Shutdown)
                } else {
                    Err(CycleError::FetchTimeout(timeout, got_data, got_tag))
                }
            }
        }
    }

    /// Verify the tag against the data file and check the content address.
    /// Returns the file hash. Both files are deleted on failure.
    async fn admit(&self, files: &FilePair) -> Result<String, CycleError> {
        let pair = files.clone();
        let result = tokio::task::spawn_blocking(move || check_pair(&pair.data, &pair.tag))
            .await
            .map_err(|e| CycleError::Io(std::io::Error::other(e)))
            .and_then(|r| r);

        if result.is_err() {
            files.discard().await;
        }
        result
    }

    /// Move an admitted pair from `tmp` to its canonical workspace paths.
    ///
    /// A hash that is already stored or registered keeps its existing files;
    /// only the received copies are removed.
    async fn place(&self, files: &FilePair, hash: &str) -> Result<FilePair, CycleError> {
        let placed = FilePair {
            data: self.workspace.idle_data_path(hash),
            tag: self.workspace.idle_tag_path(hash),
        };

        let known = match self.ledger.knows_idle_file(hash) {
            Ok(known) => known,
            Err(e) => {
                files.discard().await;
                return Err(e.into());
            }
        };
        if known || placed.data.exists() || placed.tag.exists() {
            files.discard().await;
            return Err(CycleError::Duplicate(hash.to_string()));
        }

        for (from, to) in [(&files.data, &placed.data), (&files.tag, &placed.tag)] {
            if let Err(e) = tokio::fs::rename(from, to).await {
                files.discard().await;
                placed.discard().await;
                return Err(e.into());
            }
        }
        Ok(placed)
    }

    /// Submit metadata, confirm the transaction and record the file.
    async fn commit(
        &self,
        worker: &AttestationWorker,
        hash: &str,
        files: &FilePair,
    ) -> Result<AcquiredFile, CycleError> {
        let meta = IdleFileMeta {
            block_num: self.settings.block_count,
            hash: hash.to_string(),
            miner_acc: self.identity.account_hex(),
        };

        let tx_hash = match self
            .chain
            .submit_idle_file_metadata(&worker.account, std::slice::from_ref(&meta))
            .await
        {
            Ok(tx) => tx,
            Err(failure) => {
                match &failure.tx_hash {
                    Some(tx) => self.park_pending(hash, tx, files).await?,
                    None => files.discard().await,
                }
                return Err(CycleError::Submit {
                    hash: hash.to_string(),
                    source: failure,
                });
            }
        };
        debug!(hash = %hash, tx_hash = %tx_hash, "Idle file metadata submitted");

        let height = match self.chain.query_confirmed_height(&tx_hash).await {
            Ok(height) => height,
            Err(e) => {
                self.park_pending(hash, &tx_hash, files).await?;
                return Err(CycleError::Confirm {
                    hash: hash.to_string(),
                    tx_hash,
                    source: e,
                });
            }
        };

        if let Err(e) = self.ledger.record_idle_file(height, hash) {
            error!(hash = %hash, height, error = %e, "Failed to record confirmed idle file");
            self.park_pending(hash, &tx_hash, files).await?;
            return Err(e.into());
        }

        Ok(AcquiredFile {
            hash: hash.to_string(),
            height,
        })
    }

    /// Record a submission that has a transaction hash but no recorded
    /// height. If even that fails the files are deleted.
    async fn park_pending(&self, hash: &str, tx_hash: &str, files: &FilePair) -> Result<(), CycleError> {
        match self.ledger.record_pending(hash, tx_hash) {
            Ok(()) => {
                warn!(hash = %hash, tx_hash = %tx_hash, "Recorded pending idle file submission");
                Ok(())
            }
            Err(e) => {
                error!(hash = %hash, error = %e, "Failed to record pending submission, discarding files");
                files.discard().await;
                Err(e.into())
            }
        }
    }

    /// Move confirmed pending submissions into the height index. Entries whose
    /// data file is gone are dropped; unconfirmed ones are kept.
    pub async fn reconcile_pending(&self) -> Result<usize, LedgerError> {
        let pending = self.ledger.pending_entries()?;
        let mut reconciled = 0;

        for (hash, tx_hash) in pending {
            if !self.workspace.idle_data_path(&hash).exists() {
                warn!(hash = %hash, tx_hash = %tx_hash, "Dropping pending entry without data file");
                remove_quietly(&self.workspace.idle_tag_path(&hash)).await;
                self.ledger.clear_pending(&hash)?;
                continue;
            }

            match self.chain.query_confirmed_height(&tx_hash).await {
                Ok(height) => {
                    self.ledger.record_idle_file(height, &hash)?;
                    self.ledger.clear_pending(&hash)?;
                    info!(hash = %hash, height, "Reconciled pending idle file");
                    reconciled += 1;
                }
                Err(e) => debug!(hash = %hash, tx_hash = %tx_hash, error = %e, "Still pending"),
            }
        }
        Ok(reconciled)
    }
}

/// Tag check plus content address check, on blocking I/O.
fn check_pair(data: &Path, tag: &Path) -> Result<String, CycleError> {
    verify_tag_file(tag, data)?;
    let expected = common::file_basename(data)
        .ok_or_else(|| VerifyError::Malformed(format!("bad data path {}", data.display())))?
        .to_string();
    let actual = common::calc_path_sha256(data).map_err(VerifyError::Io)?;
    if actual != expected {
        return Err(CycleError::HashMismatch { expected, actual });
    }
    Ok(actual)
}
