//! End-to-end idle acquisition against the in-memory chain and transport.

use bucket::chain::AttestationWorker;
use bucket::error::{CycleError, ErrorClass};
use bucket::identity::StakingIdentity;
use bucket::ledger::{Ledger, LedgerPrefix, encode_key};
use bucket::mock::{MockChainClient, MockDelivery, MockTransport};
use bucket::p2p::delivery_channels;
use bucket::space::{AcquisitionSettings, IdleAcquisition};
use bucket::workspace::Workspace;
use common::Tag;
use ed25519_dalek::SigningKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Filler content used by every fixture. Its SHA-256 is the file name.
const FILLER: &[u8] = b"bucket idle filler fixture\n";

struct Node {
    _dir: tempfile::TempDir,
    ws: Workspace,
    ledger: Arc<Ledger>,
    chain: Arc<MockChainClient>,
    transport: Arc<MockTransport>,
    acquisition: Arc<IdleAcquisition>,
}

fn node(fetch_timeout: Duration) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::create(dir.path().join("bucket")).unwrap();
    let ledger = Arc::new(Ledger::open(&ws.ledger_dir()).unwrap());
    let chain = Arc::new(MockChainClient::new());
    chain.add_worker(AttestationWorker {
        account: vec![0xaa; 32],
        peer_id: "worker-1".to_string(),
    });

    let (senders, deliveries) = delivery_channels(8);
    let transport = Arc::new(MockTransport::new("bucket-peer", senders));
    let identity = Arc::new(StakingIdentity::from_signing_key(SigningKey::from_bytes(
        &[1u8; 32],
    )));

    let acquisition = Arc::new(IdleAcquisition::new(
        chain.clone(),
        transport.clone(),
        ledger.clone(),
        ws.clone(),
        identity,
        deliveries,
        AcquisitionSettings {
            block_interval: Duration::from_millis(20),
            fetch_timeout,
            quota_bytes: u64::MAX,
            fragment_size: FILLER.len() as u64,
            block_count: 4,
            reconcile_pending: false,
        },
    ));

    Node {
        _dir: dir,
        ws,
        ledger,
        chain,
        transport,
        acquisition,
    }
}

/// Write the filler data and a tag naming `tag_name` under `<root>/tmp`, the
/// way the delivery handler lands them. Returns `(hash, data, tag)`.
fn delivered_pair(ws: &Workspace, tag_name: Option<&str>) -> (String, PathBuf, PathBuf) {
    let hash = common::sha256_hex(FILLER);
    let data = ws.tmp_dir().join(&hash);
    let tag_path = ws.tmp_dir().join(format!("{hash}.tag"));
    std::fs::write(&data, FILLER).unwrap();

    let tag = Tag {
        name: tag_name.unwrap_or(&hash).to_string(),
        u: "u-filler".to_string(),
        phi: vec!["phi".to_string(); 4],
        phi_hash: String::new(),
        attest: String::new(),
    };
    std::fs::write(&tag_path, serde_json::to_vec(&tag).unwrap()).unwrap();
    (hash, data, tag_path)
}

#[tokio::test]
async fn test_valid_delivery_is_registered_at_confirmed_height() {
    let n = node(Duration::from_secs(5));
    let (hash, data, tag) = delivered_pair(&n.ws, None);
    n.transport.queue_delivery(MockDelivery {
        data: Some(data),
        tag: Some(tag),
    });
    n.chain.confirm("0x1", 1234);

    let (_tx, mut rx) = watch::channel(false);
    let file = n.acquisition.run_cycle(&mut rx).await.unwrap();
    assert_eq!(file.hash, hash);
    assert_eq!(file.height, 1234);

    // ("idle:", H) -> confirmed height
    let value = n
        .ledger
        .get(&encode_key(LedgerPrefix::IdleFile, 1234, &hash))
        .unwrap();
    assert_eq!(value, b"1234");

    // Moved into the idle area under its content address.
    assert_eq!(std::fs::read(n.ws.idle_data_path(&hash)).unwrap(), FILLER);
    assert!(n.ws.idle_tag_path(&hash).exists());

    let submissions = n.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, vec![0xaa; 32]);
    assert_eq!(submissions[0].1[0].hash, hash);
}

#[tokio::test]
async fn test_only_data_arrives_times_out_without_ledger_entry() {
    let n = node(Duration::from_millis(200));
    let (_, data, tag) = delivered_pair(&n.ws, None);
    std::fs::remove_file(&tag).unwrap();
    n.transport.queue_delivery(MockDelivery {
        data: Some(data.clone()),
        tag: None,
    });

    let (_tx, mut rx) = watch::channel(false);
    let err = n.acquisition.run_cycle(&mut rx).await.unwrap_err();
    assert!(matches!(err, CycleError::FetchTimeout(_, true, false)));
    assert_eq!(err.class(), ErrorClass::Transient);

    assert!(!data.exists());
    assert!(
        n.ledger
            .query_prefix_above(LedgerPrefix::IdleFile, 0)
            .unwrap()
            .is_empty()
    );
    assert!(n.chain.submissions().is_empty());
}

#[tokio::test]
async fn test_tag_for_other_file_is_discarded() {
    let n = node(Duration::from_secs(5));
    let other = "f".repeat(64);
    let (_, data, tag) = delivered_pair(&n.ws, Some(&other));
    n.transport.queue_delivery(MockDelivery {
        data: Some(data.clone()),
        tag: Some(tag.clone()),
    });

    let (_tx, mut rx) = watch::channel(false);
    let err = n.acquisition.run_cycle(&mut rx).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(!data.exists());
    assert!(!tag.exists());
    assert!(n.chain.submissions().is_empty());
}

#[tokio::test]
async fn test_content_not_matching_name_is_discarded() {
    let n = node(Duration::from_secs(5));
    let (hash, data, tag) = delivered_pair(&n.ws, None);
    std::fs::write(&data, b"tampered").unwrap();
    n.transport.queue_delivery(MockDelivery {
        data: Some(data.clone()),
        tag: Some(tag.clone()),
    });

    let (_tx, mut rx) = watch::channel(false);
    let err = n.acquisition.run_cycle(&mut rx).await.unwrap_err();
    match err {
        CycleError::HashMismatch { expected, .. } => assert_eq!(expected, hash),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!data.exists());
    assert!(!tag.exists());
}

#[tokio::test]
async fn test_failed_submission_with_tx_hash_is_pending() {
    let n = node(Duration::from_secs(5));
    let (hash, data, tag) = delivered_pair(&n.ws, None);
    n.transport.queue_delivery(MockDelivery {
        data: Some(data),
        tag: Some(tag),
    });
    n.chain
        .set_submit_result(Err(bucket::error::SubmitFailure {
            tx_hash: Some("0xfeed".to_string()),
            reason: "in-block error".to_string(),
        }));

    let (_tx, mut rx) = watch::channel(false);
    let err = n.acquisition.run_cycle(&mut rx).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Partial);

    assert_eq!(
        n.ledger.pending_entries().unwrap(),
        vec![(hash.clone(), "0xfeed".to_string())]
    );
    assert!(n.ws.idle_data_path(&hash).exists());
    assert!(
        n.ledger
            .query_prefix_above(LedgerPrefix::IdleFile, 0)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_loop_acquires_then_stops_on_shutdown() {
    let n = node(Duration::from_secs(5));
    let (hash, data, tag) = delivered_pair(&n.ws, None);
    n.transport.queue_delivery(MockDelivery {
        data: Some(data),
        tag: Some(tag),
    });
    n.chain.confirm("0x1", 9);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(n.acquisition.clone().run(rx));

    let key = encode_key(LedgerPrefix::IdleFile, 9, &hash);
    for _ in 0..100 {
        if n.ledger.get(&key).is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(n.ledger.get(&key).unwrap(), b"9");

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unsynced_chain_sends_no_requests() {
    let n = node(Duration::from_secs(5));
    n.chain.set_synced(false);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(n.acquisition.clone().run(rx));
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert!(n.transport.requests().is_empty());
}

#[tokio::test]
async fn test_reissued_hash_keeps_committed_files() {
    let n = node(Duration::from_secs(5));
    let (hash, data, tag) = delivered_pair(&n.ws, None);
    n.transport.queue_delivery(MockDelivery {
        data: Some(data),
        tag: Some(tag),
    });
    n.chain.confirm("0x1", 10);

    let (_tx, mut rx) = watch::channel(false);
    n.acquisition.run_cycle(&mut rx).await.unwrap();

    // Same hash delivered again; the chain would refuse it without a tx hash.
    let (_, data, tag) = delivered_pair(&n.ws, None);
    n.transport.queue_delivery(MockDelivery {
        data: Some(data.clone()),
        tag: Some(tag.clone()),
    });
    n.chain
        .set_submit_result(Err(bucket::error::SubmitFailure {
            tx_hash: None,
            reason: "already registered".to_string(),
        }));

    let err = n.acquisition.run_cycle(&mut rx).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    assert_eq!(std::fs::read(n.ws.idle_data_path(&hash)).unwrap(), FILLER);
    assert!(n.ws.idle_tag_path(&hash).exists());
    assert!(!data.exists());
    assert!(!tag.exists());
    assert_eq!(
        n.ledger
            .get(&encode_key(LedgerPrefix::IdleFile, 10, &hash))
            .unwrap(),
        b"10"
    );
    assert_eq!(n.chain.submissions().len(), 1);
}
