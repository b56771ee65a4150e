//! `nodeforge`: loads contracts, wires handlers, and runs the host loop
//! (§4.6), or exercises the dispatch path offline for local development.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nodeforge::broker::memory::MemoryBroker;
use nodeforge::broker::{BrokerConsumer, BrokerProducer};
use nodeforge::config::RuntimeConfig;
use nodeforge::contract::{Contract, ProtocolKind};
use nodeforge::envelope::{Envelope, EnvelopeSource};
use nodeforge::executor::EffectInput;
use nodeforge::handler::memory::MockProtocolHandler;
use nodeforge::handler::{HandlerOutcome, HandlerResponse, ProtocolHandler};
use nodeforge::health::HealthMonitor;
use nodeforge::publisher::ResultPublisher;
use nodeforge::registry::{NodeRegistry, RuntimeProfile};
use nodeforge::router::Router;
use nodeforge_broker_kafka::{BrokerProduceHandler, KafkaConsumer, KafkaProducer};
use nodeforge_graph::GraphHandler;
use nodeforge_rest::RestHandler;
use nodeforge_sql::SqlHandler;

#[derive(Parser, Debug)]
#[command(name = "nodeforge")]
#[command(about = "Event-driven node runtime host")]
#[command(version)]
pub struct Cli {
    /// Path to an optional TOML config file layered over compile-time defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load contracts, bind handlers, and run the host loop until shutdown.
    Run {
        /// Directory of `*.yaml` contract files.
        #[arg(long)]
        contracts_dir: Option<PathBuf>,
        /// Which population of nodes to host: `main`, `effects`, `all`, or `local-dev`.
        #[arg(long)]
        profile: Option<String>,
        /// Load contracts, validate handler bindings and the dependency
        /// graph, and exit without connecting to the broker or any
        /// external system (§6 CLI surface).
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and validate contract files without running anything.
    ValidateContracts {
        /// Directory of `*.yaml` contract files.
        contracts_dir: PathBuf,
    },
    /// Exercise the dispatch path against mock handlers by replaying a
    /// recorded envelope sequence from stdin (or `--input`), one JSON
    /// envelope per line, printing step-by-step outputs.
    SimulateWorkflow {
        /// Directory of `*.yaml` contract files.
        contracts_dir: PathBuf,
        /// File of newline-delimited JSON envelopes; reads stdin if omitted.
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(code) => code,
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), i32> {
    match cli.command {
        Commands::ValidateContracts { contracts_dir } => validate_contracts(&contracts_dir),
        Commands::SimulateWorkflow { contracts_dir, input } => simulate_workflow(&contracts_dir, input.as_deref()).await,
        Commands::Run { contracts_dir, profile, dry_run: true } => dry_run(cli.config.as_deref(), contracts_dir, profile),
        Commands::Run { contracts_dir, profile, dry_run: false } => {
            run_host(cli.config.as_deref(), contracts_dir, profile).await
        }
    }
}

fn load_contracts(dir: &Path) -> Result<Vec<Contract>, i32> {
    let mut contracts = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| {
        tracing::error!(dir = %dir.display(), error = %e, "failed to read contracts directory");
        2
    })?;
    for entry in entries {
        let entry = entry.map_err(|_| 2)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let source = fs::read_to_string(&path).map_err(|_| 2)?;
        match Contract::load(&source) {
            Ok(contract) => contracts.push(contract),
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "contract failed validation");
                return Err(1);
            }
        }
    }
    Ok(contracts)
}

fn validate_contracts(contracts_dir: &Path) -> Result<(), i32> {
    let contracts = load_contracts(contracts_dir)?;
    for contract in &contracts {
        tracing::info!(node_id = %contract.node_id, fingerprint = %contract.fingerprint, "contract valid");
    }
    println!("{} contract(s) valid", contracts.len());
    Ok(())
}

/// Builds one live handler per distinct `protocol_kind` present in the
/// loaded contracts, initialized from the connection config of that
/// kind's first contract (contracts sharing a protocol kind share a
/// handler pool, §4.6).
async fn build_live_handlers(contracts: &[Contract]) -> Result<HashMap<ProtocolKind, Arc<dyn ProtocolHandler>>, i32> {
    let mut handlers: HashMap<ProtocolKind, Arc<dyn ProtocolHandler>> = HashMap::new();
    for contract in contracts {
        if handlers.contains_key(&contract.protocol_kind) {
            continue;
        }
        let handler: Arc<dyn ProtocolHandler> = match contract.protocol_kind {
            ProtocolKind::Rest => Arc::new(RestHandler::new()),
            ProtocolKind::GraphCypher => Arc::new(GraphHandler::new()),
            ProtocolKind::Sql => Arc::new(SqlHandler::new()),
            ProtocolKind::BrokerProduce => Arc::new(BrokerProduceHandler::new()),
        };
        handler.init(&contract.connection).await.map_err(|e| {
            tracing::error!(protocol = %contract.protocol_kind, error = %e, "handler init failed");
            1
        })?;
        handlers.insert(contract.protocol_kind, handler);
    }
    Ok(handlers)
}

fn build_mock_handlers(contracts: &[Contract]) -> HashMap<ProtocolKind, Arc<dyn ProtocolHandler>> {
    let mut mocks: HashMap<ProtocolKind, Arc<MockProtocolHandler>> = HashMap::new();
    for contract in contracts {
        let mock = mocks.entry(contract.protocol_kind).or_insert_with(|| Arc::new(MockProtocolHandler::new(contract.protocol_kind)));
        for operation in contract.operations.values() {
            mock.script(operation.name.clone(), vec![HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({}), 0.0))]);
        }
    }
    mocks.into_iter().map(|(kind, mock)| (kind, mock as Arc<dyn ProtocolHandler>)).collect()
}

/// `--dry-run`: load contracts, bind mock handlers, build the registry
/// (validating the dependency graph and handler bindings), and exit
/// without ever constructing a live handler or broker client (§6).
fn dry_run(config_path: Option<&Path>, contracts_dir_override: Option<PathBuf>, profile_override: Option<String>) -> Result<(), i32> {
    let mut config = RuntimeConfig::load(config_path).map_err(|e| {
        tracing::error!(error = %e, "invalid runtime configuration");
        1
    })?;
    apply_overrides(&mut config, contracts_dir_override, profile_override)?;

    let contracts = load_contracts(&config.contracts_dir)?;
    let handlers = build_mock_handlers(&contracts);
    let registry = NodeRegistry::build(contracts, &handlers, config.profile, HashMap::new()).map_err(|e| {
        tracing::error!(error = %e, "dry run: registry would fail to build");
        1
    })?;
    println!(
        "dry run ok: {} node(s) would be hosted under profile '{}'",
        registry.len(),
        config.profile
    );
    Ok(())
}

fn apply_overrides(config: &mut RuntimeConfig, contracts_dir_override: Option<PathBuf>, profile_override: Option<String>) -> Result<(), i32> {
    if let Some(dir) = contracts_dir_override {
        config.contracts_dir = dir;
    }
    if let Some(profile) = profile_override {
        config.profile = RuntimeProfile::parse(&profile).ok_or_else(|| {
            tracing::error!(profile = %profile, "unknown runtime profile");
            1
        })?;
    }
    Ok(())
}

async fn run_host(config_path: Option<&Path>, contracts_dir_override: Option<PathBuf>, profile_override: Option<String>) -> Result<(), i32> {
    let mut config = RuntimeConfig::load(config_path).map_err(|e| {
        tracing::error!(error = %e, "invalid runtime configuration");
        1
    })?;
    apply_overrides(&mut config, contracts_dir_override, profile_override)?;

    let contracts = load_contracts(&config.contracts_dir)?;
    let env: HashMap<String, String> = std::env::vars().collect();

    let handlers = if config.profile.uses_mock_handlers() {
        build_mock_handlers(&contracts)
    } else {
        build_live_handlers(&contracts).await?
    };

    let registry = Arc::new(NodeRegistry::build(contracts, &handlers, config.profile, env).map_err(|e| {
        tracing::error!(error = %e, "failed to build node registry");
        1
    })?);

    if config.broker.bootstrap_servers.is_empty() {
        tracing::warn!("no broker.bootstrap_servers configured, falling back to the in-memory broker");
        let broker = MemoryBroker::new();
        run_with_broker(broker.clone(), broker, registry, &config).await
    } else {
        let bootstrap = config.broker.bootstrap_servers.join(",");
        let group = config.consumer_group_for("nodeforge");
        let consumer = Arc::new(KafkaConsumer::new(&bootstrap, &group).map_err(|e| {
            tracing::error!(error = %e, "failed to construct kafka consumer");
            1
        })?);
        let producer = Arc::new(KafkaProducer::new(&bootstrap).map_err(|e| {
            tracing::error!(error = %e, "failed to construct kafka producer");
            1
        })?);
        run_with_broker(consumer, producer, registry, &config).await
    }
}

async fn run_with_broker(
    consumer: Arc<dyn BrokerConsumer>,
    producer: Arc<dyn BrokerProducer>,
    registry: Arc<NodeRegistry>,
    config: &RuntimeConfig,
) -> Result<(), i32> {
    let source = EnvelopeSource { service: "nodeforge".to_string(), instance_id: instance_id(), hostname: hostname() };
    let publisher = Arc::new(ResultPublisher::new(producer, source, "onex.router.error.v1"));
    let router = Arc::new(Router::new(consumer, registry.clone(), publisher, config.max_in_flight));
    router.subscribe().await.map_err(|e| {
        tracing::error!(error = %e, "failed to subscribe to node topics");
        1
    })?;

    let health = Arc::new(HealthMonitor::new(&registry).with_probe_interval(config.health_check_interval));
    health.mark_all_ready();

    let probe_registry = registry.clone();
    let probe_health = health.clone();
    let probe_interval = config.health_check_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(probe_interval).await;
            probe_health.probe_once(&probe_registry).await;
        }
    });

    let shutdown_router = router.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_router.request_shutdown();
    });

    router.run().await;

    let drained = health.shutdown(config.shutdown_grace_period, || router.in_flight()).await;
    if !drained {
        tracing::error!("shutdown grace period elapsed with in-flight work remaining");
        return Err(1);
    }
    Ok(())
}

/// Replays a recorded envelope sequence directly through the registry
/// (bypassing the broker entirely, per §6's "replay it through the
/// registry with mock handlers") and prints one line per step.
async fn simulate_workflow(contracts_dir: &Path, input_path: Option<&Path>) -> Result<(), i32> {
    let contracts = load_contracts(contracts_dir)?;
    let handlers = build_mock_handlers(&contracts);
    let registry = NodeRegistry::build(contracts, &handlers, RuntimeProfile::All, HashMap::new()).map_err(|e| {
        tracing::error!(error = %e, "failed to build node registry");
        1
    })?;

    let raw: Box<dyn Read> = match input_path {
        Some(path) => Box::new(fs::File::open(path).map_err(|e| {
            tracing::error!(file = %path.display(), error = %e, "failed to open envelope sequence");
            2
        })?),
        None => Box::new(std::io::stdin()),
    };

    for (step, line) in BufReader::new(raw).lines().enumerate() {
        let line = line.map_err(|_| 2)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(err) => {
                println!("step {}: unparseable envelope: {err}", step + 1);
                continue;
            }
        };
        let Some(executor) = registry.get(&envelope.node_id) else {
            println!("step {}: no node bound for node_id '{}'", step + 1, envelope.node_id);
            continue;
        };

        let input = EffectInput {
            operation: envelope.operation.clone(),
            params: envelope.payload.clone(),
            correlation_id: envelope.correlation_id.as_str().to_string(),
            context: serde_json::Value::Object(
                envelope.metadata.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect(),
            ),
        };
        let output = executor.execute(input).await;
        println!(
            "step {}: node={} operation={} success={} correlation_id={} data={}",
            step + 1,
            envelope.node_id,
            output.operation,
            output.success,
            output.correlation_id,
            output.data.unwrap_or(serde_json::Value::Null),
        );
        if let Some(error) = output.error {
            println!("  error: {} ({})", error.message, error.code);
        }
    }
    Ok(())
}

fn instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "nodeforge".to_string())
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok()
}
