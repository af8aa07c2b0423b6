//! One proving round for one data category.
//!
//! The round is best effort: every candidate file is proven independently
//! under its own time budget, and a file that cannot be read, split or proven
//! is logged and left out. Only proven files reach the bundle and the
//! aggregate signature, in ledger order.

use crate::error::{AggregateError, ProofError};
use crate::ledger::{Ledger, LedgerKey, LedgerPrefix};
use crate::proof::{ProofEngine, RsaKeyPair, split_into_blocks};
use crate::workspace::{Workspace, remove_quietly};
use common::{ChallengeWindow, ProofBundle, ProofCategory, ProofMuBundle, ProofStatus, QueryElement, TAG_EXTENSION, Tag};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Files proven concurrently within one round. Output order is unaffected.
const PROOF_CONCURRENCY: usize = 4;

/// Result of a completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Aggregate signature over every proven file. Empty when nothing was proven.
    pub sigma: String,
    /// SHA-256 of the written bundle file.
    pub bundle_hash: String,
    pub proven: usize,
    pub skipped: usize,
}

/// A file to prove.
#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    data_path: PathBuf,
    tag_path: PathBuf,
}

/// A successfully proven file.
#[derive(Debug)]
struct Proven {
    tag: Tag,
    mu: String,
}

#[derive(Debug, thiserror::Error)]
enum SkipReason {
    #[error("tag unreadable: {0}")]
    Tag(String),
    #[error("split failed: {0}")]
    Split(#[from] ProofError),
    #[error("fragment status {0:?}")]
    Fragment(ProofStatus),
}

pub struct ProofAggregator {
    ledger: Arc<Ledger>,
    workspace: Workspace,
    engine: Arc<dyn ProofEngine>,
    fragment_timeout: Duration,
}

impl ProofAggregator {
    pub fn new(
        ledger: Arc<Ledger>,
        workspace: Workspace,
        engine: Arc<dyn ProofEngine>,
        fragment_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            workspace,
            engine,
            fragment_timeout,
        }
    }

    /// Prove every file of `category` registered at or above `start`.
    pub async fn prove(
        &self,
        key: &Arc<RsaKeyPair>,
        window: &ChallengeWindow,
        category: ProofCategory,
    ) -> Result<RoundOutcome, AggregateError> {
        let start = window.start;
        let keys = self
            .ledger
            .query_prefix_above(LedgerPrefix::for_category(category), start)?;
        if keys.is_empty() {
            return Err(AggregateError::NoEligibleFiles(start));
        }

        let candidates = match category {
            ProofCategory::Idle => self.idle_candidates(&keys),
            ProofCategory::Service => self.service_candidates(&keys).await,
        };
        if candidates.is_empty() {
            return Err(AggregateError::NoEligibleFiles(start));
        }

        info!(
            category = %category,
            start,
            candidates = candidates.len(),
            "Starting proving round"
        );

        let query = Arc::new(window.query());

        let (proven, skipped) = futures::stream::iter(candidates)
            .map(|c| {
                let key = key.clone();
                let query = query.clone();
                async move {
                    let name = c.name.clone();
                    (name, self.prove_file(key, query, c).await)
                }
            })
            .buffered(PROOF_CONCURRENCY)
            .fold(
                (Vec::new(), 0usize),
                |(mut proven, mut skipped), (name, result)| async move {
                    match result {
                        Ok(p) => proven.push(p),
                        Err(reason) => {
                            warn!(category = %category, file = %name, reason = %reason, "Skipping file");
                            skipped += 1;
                        }
                    }
                    (proven, skipped)
                },
            )
            .await;

        let bundle = ProofBundle {
            names: proven.iter().map(|p| p.tag.name.clone()).collect(),
            u: proven.iter().map(|p| p.tag.u.clone()).collect(),
        };
        let mu_bundle = ProofMuBundle {
            mu: proven.iter().map(|p| p.mu.clone()).collect(),
        };

        let (bundle_path, mu_path) = self.workspace.bundle_paths(category);
        write_bundle_atomic(&bundle_path, &serde_json::to_vec(&bundle)?).await?;
        write_bundle_atomic(&mu_path, &serde_json::to_vec(&mu_bundle)?).await?;

        let hash_path = bundle_path.clone();
        let bundle_hash = tokio::task::spawn_blocking(move || common::calc_path_sha256(&hash_path))
            .await
            .map_err(std::io::Error::other)??;

        let sigma = if proven.is_empty() {
            String::new()
        } else {
            let tags: Vec<Tag> = proven.into_iter().map(|p| p.tag).collect();
            self.engine.aggregate(key, &query, &tags).await?
        };

        info!(
            category = %category,
            start,
            proven = bundle.names.len(),
            skipped,
            bundle_hash = %bundle_hash,
            "Proving round complete"
        );

        Ok(RoundOutcome {
            sigma,
            bundle_hash,
            proven: bundle.names.len(),
            skipped,
        })
    }

    fn idle_candidates(&self, keys: &[LedgerKey]) -> Vec<Candidate> {
        keys.iter()
            .map(|k| Candidate {
                name: k.name.clone(),
                data_path: self.workspace.idle_data_path(&k.name),
                tag_path: self.workspace.idle_tag_path(&k.name),
            })
            .collect()
    }

    /// Every shard under each service root, sorted by name within a root.
    async fn service_candidates(&self, keys: &[LedgerKey]) -> Vec<Candidate> {
        let mut out = Vec::new();
        for k in keys {
            let dir = self.workspace.service_root_dir(&k.name);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(root = %k.name, error = %e, "Cannot list service root");
                    continue;
                }
            };
            let mut shards = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let is_tag = path.extension().is_some_and(|e| e == TAG_EXTENSION);
                        if !is_tag
                            && path.is_file()
                            && let Some(name) = common::file_basename(&path)
                        {
                            shards.push(name.to_string());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(root = %k.name, error = %e, "Error listing service root");
                        break;
                    }
                }
            }
            shards.sort();
            out.extend(shards.into_iter().map(|name| Candidate {
                data_path: dir.join(&name),
                tag_path: dir.join(format!("{name}.{TAG_EXTENSION}")),
                name,
            }));
        }
        out
    }

    async fn prove_file(
        &self,
        key: Arc<RsaKeyPair>,
        query: Arc<Vec<QueryElement>>,
        candidate: Candidate,
    ) -> Result<Proven, SkipReason> {
        let bytes = tokio::fs::read(&candidate.tag_path)
            .await
            .map_err(|e| SkipReason::Tag(e.to_string()))?;
        let tag = Tag::from_json(&bytes).map_err(|e| SkipReason::Tag(e.to_string()))?;
        let blocks = split_into_blocks(&candidate.data_path, tag.block_count()).await?;

        // Spawned so that a fragment running past its budget is abandoned
        // rather than holding up the round.
        let engine = self.engine.clone();
        let task_tag = tag.clone();
        let handle = tokio::spawn(async move {
            engine
                .generate_fragment(&key, &query, &task_tag, blocks)
                .await
        });

        let fragment = match tokio::time::timeout(self.fragment_timeout, handle).await {
            Ok(Ok(fragment)) => fragment,
            Ok(Err(e)) => {
                warn!(file = %candidate.name, error = %e, "Proof task failed");
                return Err(SkipReason::Fragment(ProofStatus::MathFailure));
            }
            Err(_) => return Err(SkipReason::Fragment(ProofStatus::Timeout)),
        };

        if !fragment.is_success() {
            return Err(SkipReason::Fragment(fragment.status));
        }
        debug!(file = %candidate.name, "File proven");
        Ok(Proven {
            tag,
            mu: fragment.mu,
        })
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a mix.
pub async fn write_bundle_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = tmp_sibling(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;

        #[cfg(unix)]
        {
            if let Some(parent) = path.parent()
                && let Ok(dir) = tokio::fs::File::open(parent).await
                && let Err(e) = dir.sync_all().await
            {
                warn!(path = %parent.display(), error = %e, "Failed to sync bundle directory");
            }
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        remove_quietly(&tmp).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProofEngine;
    use tempfile::tempdir;

    fn write_idle_file(ws: &Workspace, name: &str, blocks: usize) {
        std::fs::write(ws.idle_data_path(name), vec![1u8; 64]).unwrap();
        let tag = Tag {
            name: name.to_string(),
            u: format!("u-{name}"),
            phi: vec!["phi".into(); blocks],
            phi_hash: String::new(),
            attest: String::new(),
        };
        std::fs::write(ws.idle_tag_path(name), serde_json::to_vec(&tag).unwrap()).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ws: Workspace,
        ledger: Arc<Ledger>,
        engine: Arc<MockProofEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let ws = Workspace::create(dir.path().join("ws")).unwrap();
        let ledger = Arc::new(Ledger::open(&ws.ledger_dir()).unwrap());
        Fixture {
            _dir: dir,
            ws,
            ledger,
            engine: Arc::new(MockProofEngine::new()),
        }
    }

    fn aggregator(f: &Fixture, timeout: Duration) -> ProofAggregator {
        ProofAggregator::new(f.ledger.clone(), f.ws.clone(), f.engine.clone(), timeout)
    }

    fn key() -> Arc<RsaKeyPair> {
        Arc::new(RsaKeyPair::from_public_key(b"verifier").unwrap())
    }

    fn window(start: u32) -> ChallengeWindow {
        ChallengeWindow {
            start,
            random: b"R".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_no_eligible_files() {
        let f = fixture();
        f.ledger.record_idle_file(50, "old").unwrap();
        let agg = aggregator(&f, Duration::from_secs(5));

        let err = agg
            .prove(&key(), &window(100), ProofCategory::Idle)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::NoEligibleFiles(100)));
    }

    #[tokio::test]
    async fn test_skips_failed_and_missing_files() {
        let f = fixture();
        for name in ["a", "b", "c"] {
            write_idle_file(&f.ws, name, 4);
            f.ledger.record_idle_file(100, name).unwrap();
        }
        // Registered but never stored on disk
        f.ledger.record_idle_file(101, "missing").unwrap();
        f.engine.fail_file("b");

        let agg = aggregator(&f, Duration::from_secs(5));
        let outcome = agg
            .prove(&key(), &window(100), ProofCategory::Idle)
            .await
            .unwrap();

        assert_eq!(outcome.proven, 2);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.sigma, MockProofEngine::expected_sigma(&["a", "c"]));

        let (bundle_path, mu_path) = f.ws.bundle_paths(ProofCategory::Idle);
        let bundle: ProofBundle =
            serde_json::from_slice(&std::fs::read(&bundle_path).unwrap()).unwrap();
        assert_eq!(bundle.names, vec!["a", "c"]);
        assert_eq!(bundle.u, vec!["u-a", "u-c"]);
        let mu: ProofMuBundle = serde_json::from_slice(&std::fs::read(&mu_path).unwrap()).unwrap();
        assert_eq!(mu.mu.len(), 2);
        assert_eq!(
            outcome.bundle_hash,
            common::calc_path_sha256(&bundle_path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fragment_timeout_is_skipped() {
        let f = fixture();
        for name in ["fast", "slow"] {
            write_idle_file(&f.ws, name, 2);
            f.ledger.record_idle_file(10, name).unwrap();
        }
        f.engine.hang_file("slow");

        let agg = aggregator(&f, Duration::from_millis(200));
        let outcome = agg
            .prove(&key(), &window(10), ProofCategory::Idle)
            .await
            .unwrap();
        assert_eq!(outcome.proven, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.sigma, MockProofEngine::expected_sigma(&["fast"]));
    }

    #[tokio::test]
    async fn test_nothing_proven_writes_empty_bundle() {
        let f = fixture();
        write_idle_file(&f.ws, "a", 2);
        f.ledger.record_idle_file(10, "a").unwrap();
        f.engine.fail_file("a");

        let agg = aggregator(&f, Duration::from_secs(5));
        let outcome = agg
            .prove(&key(), &window(10), ProofCategory::Idle)
            .await
            .unwrap();
        assert_eq!(outcome.proven, 0);
        assert!(outcome.sigma.is_empty());
        assert_eq!(f.engine.aggregate_calls(), 0);
    }

    #[tokio::test]
    async fn test_service_root_fans_out_to_shards() {
        let f = fixture();
        let root_dir = f.ws.service_root_dir("root1");
        std::fs::create_dir_all(&root_dir).unwrap();
        for shard in ["s2", "s1"] {
            std::fs::write(root_dir.join(shard), vec![3u8; 32]).unwrap();
            let tag = Tag {
                name: shard.to_string(),
                u: format!("u-{shard}"),
                phi: vec!["p".into(); 2],
                phi_hash: String::new(),
                attest: String::new(),
            };
            std::fs::write(
                root_dir.join(format!("{shard}.tag")),
                serde_json::to_vec(&tag).unwrap(),
            )
            .unwrap();
        }
        f.ledger.record_service_root(100, "root1").unwrap();

        let agg = aggregator(&f, Duration::from_secs(5));
        let outcome = agg
            .prove(&key(), &window(100), ProofCategory::Service)
            .await
            .unwrap();
        assert_eq!(outcome.proven, 2);

        let (bundle_path, _) = f.ws.bundle_paths(ProofCategory::Service);
        let bundle: ProofBundle =
            serde_json::from_slice(&std::fs::read(bundle_path).unwrap()).unwrap();
        assert_eq!(bundle.names, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_atomic_write_keeps_previous_bundle_on_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idle.proof");
        write_bundle_atomic(&path, b"first").await.unwrap();

        // A directory squatting on the temp path makes the write fail midway.
        std::fs::create_dir(tmp_sibling(&path)).unwrap();
        assert!(write_bundle_atomic(&path, b"second").await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_stale_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idle.proof");
        write_bundle_atomic(&path, b"first").await.unwrap();

        // Leftover from a crash between write and rename.
        std::fs::write(tmp_sibling(&path), b"half-writ").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        write_bundle_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!tmp_sibling(&path).exists());
    }
}
