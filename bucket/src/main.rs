use anyhow::{Context, Result};
use bucket::chain::{ChainClient, HttpChainClient};
use bucket::challenge::{ChallengeScheduler, ProofAggregator};
use bucket::config::BucketConfig;
use bucket::identity::StakingIdentity;
use bucket::ledger::Ledger;
use bucket::p2p::{DELIVERY_CHANNEL_CAPACITY, IrohTransport, PeerTransport, delivery_channels};
use bucket::proof::{ProofEngine, RemoteProofEngine};
use bucket::space::{AcquisitionSettings, IdleAcquisition};
use bucket::supervisor::supervise;
use bucket::workspace::Workspace;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file (default: bucket.toml)
    #[arg(long, env = "BUCKET_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BucketConfig::load(cli.config.as_deref())?;
    info!(
        workspace = %config.storage.workspace.display(),
        rpc_urls = ?config.chain.rpc_urls,
        p2p_port = config.network.p2p_port,
        "Starting bucket node"
    );

    // 1. Workspace, ledger and staking key
    let workspace = Workspace::create(&config.storage.workspace)
        .with_context(|| format!("Failed to create workspace {}", config.storage.workspace.display()))?;
    let ledger = Arc::new(
        Ledger::open(&workspace.ledger_dir()).context("Failed to open ledger")?,
    );
    let identity = Arc::new(
        StakingIdentity::load_or_generate(&config.storage.keypair_path())
            .context("Failed to load staking key")?,
    );

    // 2. Peer transport
    let (senders, deliveries) = delivery_channels(DELIVERY_CHANNEL_CAPACITY);
    let iroh = Arc::new(
        IrohTransport::bind(
            config.network.p2p_port,
            config.network.relay_url.as_deref(),
            workspace.clone(),
            senders,
            config.proof.fragment_size,
        )
        .await?,
    );
    let transport: Arc<dyn PeerTransport> = iroh.clone();
    info!(peer_id = %transport.local_peer_id(), "Peer transport ready");

    // 3. Chain and proof service clients
    let chain: Arc<dyn ChainClient> = Arc::new(
        HttpChainClient::new(&config.chain.rpc_urls, config.chain.insecure_tls)
            .context("Failed to build chain client")?,
    );
    let engine: Arc<dyn ProofEngine> = Arc::new(
        RemoteProofEngine::new(&config.proof.service_url, config.fragment_timeout())
            .context("Failed to build proof service client")?,
    );

    // 4. Control loops
    let scheduler = Arc::new(ChallengeScheduler::new(
        chain.clone(),
        ledger.clone(),
        ProofAggregator::new(
            ledger.clone(),
            workspace.clone(),
            engine,
            config.fragment_timeout(),
        ),
        identity.public_key().to_vec(),
        config.block_interval(),
    ));
    let acquisition = Arc::new(IdleAcquisition::new(
        chain,
        transport,
        ledger.clone(),
        workspace,
        identity,
        deliveries,
        AcquisitionSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let restart_delay = config.restart_delay();

    let scheduler_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(supervise("challenge", restart_delay, shutdown_rx.clone(), move || {
            scheduler.clone().run(rx.clone())
        }))
    };
    let acquisition_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(supervise("idle", restart_delay, shutdown_rx, move || {
            acquisition.clone().run(rx.clone())
        }))
    };
    info!("Challenge scheduler and idle acquisition running");

    // 5. Wait for shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("challenge", scheduler_task), ("idle", acquisition_task)] {
        match task.await {
            Ok(restarts) => info!(loop_name = name, restarts, "Loop supervisor finished"),
            Err(e) => warn!(loop_name = name, error = %e, "Loop supervisor failed"),
        }
    }

    iroh.shutdown().await;
    ledger.flush().context("Failed to flush ledger")?;
    info!("Bucket node stopped");
    Ok(())
}
