//! Cohort node daemon.
//!
//! Runs one replica of the collaboration cluster: the Raft core, the
//! deterministic state machine, the local SSE hub and the HTTP surface.
//! Configuration comes from `P2P_*` environment variables; every flag below
//! mirrors one of them.
//!
//! Usage:
//!   cohort-node --bootstrap                     # first node of a cluster
//!   cohort-node --join-endpoint http://n1:18080 # join an existing cluster
//!   cohort-node keygen                          # print a fresh keypair

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cohort_config::{parse_duration, NodeConfig};
use cohort_consensus::ConsensusNode;
use cohort_crypto::{SignatureVerifier, TxSigner, TxVerifier};
use cohort_events::{EventHub, DEFAULT_CLIENT_QUEUE};
use cohort_rpc_server::ApiContext;
use cohort_state::CollabState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cohort-node", about = "Cohort collaboration node daemon", version)]
struct Cli {
    /// Stable node identity.
    #[arg(long, env = "P2P_NODE_ID", value_name = "ID")]
    node_id: Option<String>,

    /// Raft transport bind (reserved; raft RPCs ride the HTTP surface).
    #[arg(long, env = "P2P_RAFT_ADDR", value_name = "HOST:PORT")]
    raft_addr: Option<String>,

    /// HTTP surface bind.
    #[arg(long, env = "P2P_HTTP_ADDR", value_name = "HOST:PORT")]
    http_addr: Option<String>,

    /// Address peers use to reach this node.
    #[arg(long, env = "P2P_ADVERTISE_ADDR", value_name = "HOST:PORT")]
    advertise_addr: Option<String>,

    /// Persistent store directory.
    #[arg(long, env = "P2P_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Bootstrap a single-node cluster when the stores are pristine.
    #[arg(long, env = "P2P_BOOTSTRAP")]
    bootstrap: bool,

    /// Raft apply timeout, e.g. 5s or 1500ms.
    #[arg(long, env = "P2P_APPLY_TIMEOUT", value_name = "DURATION")]
    apply_timeout: Option<String>,

    /// Existing cluster to join at startup.
    #[arg(long, env = "P2P_JOIN_ENDPOINT", value_name = "URL")]
    join_endpoint: Option<String>,

    #[arg(long, env = "P2P_JOIN_RETRIES", value_name = "N")]
    join_retries: Option<u32>,

    #[arg(long, env = "P2P_JOIN_RETRY_DELAY", value_name = "DURATION")]
    join_retry_delay: Option<String>,

    /// How long startup waits for a leader to be observable.
    #[arg(long, env = "P2P_STARTUP_WAIT_LEADER", value_name = "DURATION")]
    startup_wait_leader: Option<String>,

    /// Raft snapshot files kept on disk.
    #[arg(long, env = "P2P_SNAPSHOT_RETAIN", value_name = "N")]
    snapshot_retain: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generates an Ed25519 keypair for signing transactions.
    Keygen,
}

impl Cli {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = NodeConfig::default();
        if let Some(node_id) = self.node_id {
            config.data_dir = PathBuf::from(format!("tmp/p2pnode/{node_id}"));
            config.node_id = node_id;
        }
        if let Some(addr) = self.raft_addr {
            config.raft_addr = addr;
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(addr) = self.advertise_addr {
            config.advertise_addr = addr;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        config.bootstrap = self.bootstrap;
        if let Some(raw) = self.apply_timeout {
            config.apply_timeout = parse_duration("P2P_APPLY_TIMEOUT", &raw)?;
        }
        config.join_endpoint = self.join_endpoint;
        if let Some(n) = self.join_retries {
            config.join_retries = n;
        }
        if let Some(raw) = self.join_retry_delay {
            config.join_retry_delay = parse_duration("P2P_JOIN_RETRY_DELAY", &raw)?;
        }
        if let Some(raw) = self.startup_wait_leader {
            config.startup_wait_leader = parse_duration("P2P_STARTUP_WAIT_LEADER", &raw)?;
        }
        if let Some(n) = self.snapshot_retain {
            config.snapshot_retain = n;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(Command::Keygen) = &cli.command {
        let signer = TxSigner::generate();
        println!("privateKey: {}", signer.private_key_b64());
        println!("publicKey:  {}", signer.public_key_b64());
        return Ok(());
    }

    let config = cli.into_config()?;
    info!(
        node_id = %config.node_id,
        http = %config.http_addr,
        data_dir = %config.data_dir.display(),
        bootstrap = config.bootstrap,
        "starting cohort node"
    );

    let state = cohort_state::shared(CollabState::new());
    let hub = EventHub::new(DEFAULT_CLIENT_QUEUE);
    let verifier: Arc<dyn TxVerifier> = Arc::new(SignatureVerifier);
    let node = ConsensusNode::new(&config, state.clone(), verifier.clone(), hub.clone())
        .context("consensus startup")?;

    let ctx = Arc::new(ApiContext {
        node_id: config.node_id.clone(),
        state,
        node: node.clone(),
        hub,
        verifier,
    });
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let http_addr = config
        .http_addr
        .parse()
        .context("P2P_HTTP_ADDR must be host:port")?;
    let (bound, server) =
        cohort_rpc_server::serve(ctx, http_addr, shutdown_rx).context("http startup")?;
    info!(%bound, "http surface up");

    let bootstrapped = node.bootstrap_if_needed(config.bootstrap).await?;
    if !bootstrapped {
        if let Some(endpoint) = &config.join_endpoint {
            let joined = node
                .join_cluster(endpoint, config.join_retries, config.join_retry_delay)
                .await;
            if let Err(err) = joined {
                let pristine = node.store().is_pristine().unwrap_or(false);
                if !config.bootstrap && pristine {
                    // Nothing local to fall back on: this node cannot become
                    // part of any cluster.
                    bail!("cluster join failed with no pre-existing state: {err}");
                }
                warn!(error = %err, "join failed, continuing on local state");
            }
        }
    }

    match node.wait_for_leader(config.startup_wait_leader).await {
        Some(leader) => info!(leader, "leader observed"),
        None => warn!(
            "no leader within {:?}; continuing, writes will be refused until one emerges",
            config.startup_wait_leader
        ),
    }

    signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    node.shutdown().await;
    let _ = server.await;
    info!("bye");
    Ok(())
}
