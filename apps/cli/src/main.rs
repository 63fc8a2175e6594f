//! InferMesh CLI
//!
//! Command-line interface for providers (`serve`) and requesters
//! (`discover`, `run`) on the InferMesh network.

mod echo;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use infermesh_client::{
    FindOptions, MeshClient, NegotiateOptions, OfferTemplate, PeerFilter, RequestOptions,
    SettlementOutcome,
};
use infermesh_core::{NegotiationMode, ProviderSettings, StreamStatus};
use infermesh_keystore::{expand_path, load_or_generate_libp2p_keypair};
use infermesh_network::{
    CapabilityRecord, Multiaddr, NetworkConfig, OfferEvaluator, PeerNetwork, PeerId,
    TransportNode,
};
use infermesh_settings::{default_settings_path, Settings};
use infermesh_settlement::{ledger_from_settings, ReconciliationBridge};

use crate::echo::EchoSource;

/// InferMesh - peer-to-peer inference coordination
#[derive(Parser)]
#[command(name = "infermesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Listen address (overrides settings)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap peer (format: <peer_id>@<multiaddr>), repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Path to keypair file (overrides settings)
    #[arg(long)]
    keyfile: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve jobs as a provider
    Serve {
        #[command(flatten)]
        node: NodeArgs,

        /// Workload to serve (overrides settings), repeatable
        #[arg(short, long)]
        workload: Vec<String>,

        /// Price per resource unit (overrides settings)
        #[arg(long)]
        price: Option<u64>,
    },

    /// List providers for a workload
    Discover {
        workload: String,

        #[command(flatten)]
        node: NodeArgs,

        /// Drop providers slower than this
        #[arg(long)]
        max_latency: Option<u32>,

        /// Drop providers charging more per unit
        #[arg(long)]
        max_price: Option<u64>,
    },

    /// Negotiate a job and stream its output to stdout
    Run {
        workload: String,

        /// Job prompt
        #[arg(short, long)]
        prompt: String,

        #[command(flatten)]
        node: NodeArgs,

        /// Resource units (tokens) the job may use
        #[arg(long, default_value = "256")]
        limit: u64,

        /// Total price offered
        #[arg(long, default_value = "1000")]
        price: u64,

        /// Offer all candidates at once instead of one by one
        #[arg(long)]
        parallel: bool,

        /// Settle the job on the configured ledger
        #[arg(long)]
        settle: bool,

        /// Stream resumptions after a dropped connection
        #[arg(long, default_value = "2")]
        resumes: u32,
    },

    /// Show node identity
    Info {
        /// Path to keypair file (overrides settings)
        #[arg(long)]
        keyfile: Option<PathBuf>,
    },

    /// Write the current settings (defaults if none) to the settings file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else {
        infermesh_logging::DEFAULT_FILTER
    };
    infermesh_logging::init_logging(filter);

    let settings_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(default_settings_path);
    let settings = Settings::load_from(&settings_path)
        .with_context(|| format!("Failed to load settings from {:?}", settings_path))?;

    match cli.command {
        Commands::Serve {
            node,
            workload,
            price,
        } => serve(settings, node, workload, price).await,
        Commands::Discover {
            workload,
            node,
            max_latency,
            max_price,
        } => {
            let filter = PeerFilter {
                max_latency_ms: max_latency,
                max_price,
                ..Default::default()
            };
            discover(settings, node, &workload, filter).await
        }
        Commands::Run {
            workload,
            prompt,
            node,
            limit,
            price,
            parallel,
            settle,
            resumes,
        } => {
            let template = OfferTemplate::new(workload, prompt)
                .resource_limit(limit)
                .offered_price(price);
            let options = NegotiateOptions {
                mode: parallel.then_some(NegotiationMode::Parallel),
                settle,
                ..Default::default()
            };
            run(settings, node, template, options, resumes).await
        }
        Commands::Info { keyfile } => show_node_info(&settings, keyfile),
        Commands::InitConfig => {
            settings.save()?;
            println!("Settings written to {:?}", settings_path);
            Ok(())
        }
    }
}

/// Apply command-line overrides to the loaded settings
fn apply_node_args(settings: &mut Settings, args: &NodeArgs) {
    if let Some(listen) = &args.listen {
        settings.mesh.network.listen_addr = listen.clone();
    }
    settings
        .mesh
        .network
        .bootstrap_peers
        .extend(args.bootstrap.iter().cloned());
    if let Some(keyfile) = &args.keyfile {
        settings.mesh.network.keyfile = Some(keyfile.to_string_lossy().into_owned());
    }
}

async fn start_node(
    settings: &Settings,
    provider: ProviderSettings,
    serve_streams: bool,
) -> Result<(Arc<TransportNode>, Arc<OfferEvaluator>)> {
    let keypair = load_or_generate_libp2p_keypair(&settings.keyfile())
        .map_err(|e| anyhow::anyhow!("Failed to load keypair: {}", e))?;
    let peer_id = PeerId::from(keypair.public());
    info!("Node Peer ID: {}", peer_id);

    let config = NetworkConfig::from_settings(
        &settings.mesh.network,
        settings.mesh.negotiation.request_timeout(),
    )
    .context("Invalid network settings")?;

    let evaluator = Arc::new(OfferEvaluator::new(&peer_id.to_string(), provider));
    let token_source = serve_streams.then(|| {
        Arc::new(EchoSource::new(evaluator.clone())) as Arc<dyn infermesh_network::TokenSource>
    });
    let node = TransportNode::start(keypair, config, evaluator.clone(), token_source)
        .await
        .context("Failed to start transport node")?;
    Ok((Arc::new(node), evaluator))
}

/// Wait until the listener is up
async fn wait_for_listen_addrs(node: &TransportNode) -> Result<Vec<Multiaddr>> {
    for _ in 0..50 {
        let addrs = node.listen_addrs().await?;
        if !addrs.is_empty() {
            return Ok(addrs);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("node never started listening")
}

/// Give bootstrap dials a chance before the first lookup
async fn wait_for_peers(node: &TransportNode, expect_peers: bool) -> Result<()> {
    if !expect_peers {
        return Ok(());
    }
    for _ in 0..50 {
        if !node.connected_peers().await?.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!("No bootstrap peer connected yet; discovery may come back empty");
    Ok(())
}

async fn serve(
    mut settings: Settings,
    args: NodeArgs,
    workloads: Vec<String>,
    price: Option<u64>,
) -> Result<()> {
    apply_node_args(&mut settings, &args);
    let mut provider = settings.mesh.provider.clone();
    if !workloads.is_empty() {
        provider.workloads = workloads;
    }
    if let Some(price) = price {
        provider.price_per_unit = price;
    }
    if provider.workloads.is_empty() {
        anyhow::bail!("No workloads to serve: pass --workload or set provider.workloads");
    }

    let (node, evaluator) = start_node(&settings, provider.clone(), true).await?;
    let addrs = wait_for_listen_addrs(&node).await?;
    wait_for_peers(&node, !settings.mesh.network.bootstrap_peers.is_empty()).await?;

    let peer_id = node.local_peer_id();
    let record = CapabilityRecord::new(
        &peer_id,
        addrs.iter().map(|a| a.to_string()).collect(),
        provider.capabilities(),
    );
    node.announce(record).await.context("Failed to announce capabilities")?;

    for addr in &addrs {
        info!("Listening on {}/p2p/{}", addr, peer_id);
    }
    info!(
        "Serving {} at {} per unit. Press Ctrl+C to stop.",
        provider.workloads.join(", "),
        provider.price_per_unit
    );

    tokio::signal::ctrl_c().await?;
    info!("Active jobs at shutdown: {}", evaluator.active_jobs());
    node.disconnect().await?;
    Ok(())
}

/// Start a requester node (rejects all inbound offers) and a client over it
async fn start_client(
    settings: &Settings,
    bridge: Option<Arc<ReconciliationBridge>>,
) -> Result<MeshClient> {
    let requester = ProviderSettings {
        workloads: Vec::new(),
        ..settings.mesh.provider.clone()
    };
    let (node, _) = start_node(settings, requester, false).await?;
    wait_for_peers(&node, !settings.mesh.network.bootstrap_peers.is_empty()).await?;

    let client = MeshClient::new(node, &settings.mesh, bridge, None)?;
    Ok(client)
}

async fn discover(
    mut settings: Settings,
    args: NodeArgs,
    workload: &str,
    filter: PeerFilter,
) -> Result<()> {
    apply_node_args(&mut settings, &args);
    let client = start_client(&settings, None).await?;

    let peers = client
        .find_peers(workload, &filter, &FindOptions::default())
        .await;
    client.disconnect().await?;
    let peers = peers?;

    if peers.is_empty() {
        println!("No providers for {}", workload);
        return Ok(());
    }
    println!("Providers for {}", workload);
    println!("{}", "=".repeat(14 + workload.len()));
    for peer in peers {
        println!(
            "{}  price {}  max units {}  {:?}  reputation {}",
            peer.peer_id,
            peer.price(),
            peer.capabilities.max_units,
            peer.capabilities.compute_class,
            peer.reputation
        );
    }
    Ok(())
}

async fn run(
    mut settings: Settings,
    args: NodeArgs,
    template: OfferTemplate,
    options: NegotiateOptions,
    resumes: u32,
) -> Result<()> {
    apply_node_args(&mut settings, &args);

    let ledger_cancel = CancellationToken::new();
    let bridge = if options.settle {
        let ledger = ledger_from_settings(&settings.mesh.settlement, &ledger_cancel)
            .context("Failed to set up ledger")?;
        Some(Arc::new(ReconciliationBridge::new(
            ledger,
            settings.mesh.settlement.clone(),
        )))
    } else {
        None
    };
    let client = start_client(&settings, bridge).await?;

    let result = run_job(&client, &template, options, resumes).await;
    client.disconnect().await?;
    ledger_cancel.cancel();
    result
}

async fn run_job(
    client: &MeshClient,
    template: &OfferTemplate,
    options: NegotiateOptions,
    resumes: u32,
) -> Result<()> {
    let request = RequestOptions {
        find: FindOptions::default(),
        negotiate: options,
    };
    let outcome = client
        .request_job(template, &PeerFilter::default(), &request)
        .await?;

    info!(
        "Job {} accepted by {} at {} after {} attempt(s)",
        outcome.job_id(),
        outcome.selected_peer.peer_id,
        outcome.confirmed_price(),
        outcome.attempts
    );
    match &outcome.settlement {
        Some(SettlementOutcome::Settled(mapping)) => {
            info!("Settled as ledger job {}", mapping.ledger_job_id)
        }
        Some(SettlementOutcome::PeerOnly { reason }) => {
            warn!("Continuing peer-only: {}", reason)
        }
        None => {}
    }

    let mut session = client.open_stream(&outcome).await?;
    let mut resumes_left = resumes;
    let mut stdout = std::io::stdout();
    loop {
        while let Some(frame) = session.next_token().await {
            write!(stdout, "{}", frame.content)?;
            stdout.flush()?;
        }
        match session.wait_for_end().await {
            StreamStatus::Error if resumes_left > 0 => {
                resumes_left -= 1;
                warn!(
                    "Stream failed ({}), resuming from {}",
                    session.error().unwrap_or_default(),
                    session.next_index()
                );
                session = client.resume_stream(&session).await?;
            }
            StreamStatus::Error => {
                anyhow::bail!(
                    "Stream failed: {}",
                    session.error().unwrap_or_default()
                );
            }
            _ => break,
        }
    }
    writeln!(stdout)?;

    let metrics = session.metrics();
    info!(
        "{} token(s) in {} ms ({:.1} tokens/s)",
        metrics.tokens_received, metrics.elapsed_ms, metrics.tokens_per_second
    );
    Ok(())
}

fn show_node_info(settings: &Settings, keyfile: Option<PathBuf>) -> Result<()> {
    let keyfile = keyfile
        .map(|k| expand_path(&k))
        .unwrap_or_else(|| settings.keyfile());
    let keypair = load_or_generate_libp2p_keypair(&keyfile)
        .map_err(|e| anyhow::anyhow!("Failed to load keypair: {}", e))?;
    let peer_id = PeerId::from(keypair.public());

    println!("InferMesh Node Information");
    println!("==========================");
    println!("Peer ID: {}", peer_id);
    println!("Keyfile: {:?}", keyfile);
    if let Some(path) = settings.config_path() {
        println!("Settings: {:?}", path);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&settings.mesh.provider.capabilities())?
    );

    Ok(())
}
