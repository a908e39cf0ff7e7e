use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use modkit_grpc_discovery::{
    ConfigOrError, DiscoveryConfig, DiscoveryResolverFactory, InMemoryRegistry, NameResolver,
    ResolutionResult, ResolvedTarget, ResolverArgs, ResolverListener, ResolverRegistry, ServiceInstance,
    StaticResolverProvider, SynchronizationContext,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing_subscriber::EnvFilter;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Discovery probe - resolve a gRPC target the way a client channel would
#[derive(Parser, Debug)]
#[command(name = "discovery-probe")]
#[command(about = "Resolve a gRPC target through registry-backed name resolution")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target to resolve, e.g. `discovery:///orders` or `static:///10.0.0.1:9090,10.0.0.2`
    target: String,

    /// Keep printing updates until interrupted
    #[arg(short, long)]
    watch: bool,

    /// Seconds between registry heartbeats while watching
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Static registry contents, keyed by service id.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProbeConfig {
    services: BTreeMap<String, Vec<ServiceInstance>>,
}

impl ProbeConfig {
    const SECTION: &'static str = "probe";

    fn from_figment(figment: &Figment) -> Result<Self> {
        if !figment.contains(Self::SECTION) {
            return Ok(Self::default());
        }
        figment
            .extract_inner(Self::SECTION)
            .context("invalid 'probe' config")
    }

    fn into_registry(self) -> InMemoryRegistry {
        let registry = InMemoryRegistry::new();
        for (service, instances) in self.services {
            registry.replace(&service, instances);
        }
        registry
    }
}

#[derive(Debug)]
enum Update {
    Targets(ResolutionResult),
    Failed(Status),
}

struct ForwardingListener(mpsc::UnboundedSender<Update>);

impl ResolverListener for ForwardingListener {
    fn on_result(&self, result: ResolutionResult) {
        if self.0.send(Update::Targets(result)).is_err() {
            tracing::debug!("Probe output closed, dropping result");
        }
    }

    fn on_error(&self, status: Status) {
        if self.0.send(Update::Failed(status)).is_err() {
            tracing::debug!("Probe output closed, dropping error");
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn render(update: &Update) -> String {
    match update {
        Update::Targets(result) => {
            let mut lines: Vec<String> =
                result.addresses.iter().map(ResolvedTarget::authority).collect();
            match &result.service_config {
                Some(ConfigOrError::Config(config)) => {
                    let policy = config.load_balancing_policy.as_deref().unwrap_or("default");
                    lines.push(format!("service config: load balancing {policy}"));
                }
                Some(ConfigOrError::Error(status)) => {
                    lines.push(format!("service config error: {}", status.message()));
                }
                None => {}
            }
            lines.iter().map(|line| format!("{line}\n")).collect()
        }
        Update::Failed(status) => format!("resolution failed ({:?}): {}\n", status.code(), status.message()),
    }
}

async fn print_updates(
    updates: &mut mpsc::UnboundedReceiver<Update>,
    registry: &InMemoryRegistry,
    watch: bool,
    heartbeat: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    return Ok(());
                };
                print!("{}", render(&update));
                if !watch {
                    return match update {
                        Update::Targets(_) => Ok(()),
                        Update::Failed(status) => anyhow::bail!("{}", status.message()),
                    };
                }
            }
            _ = ticker.tick(), if watch => registry.heartbeat(),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Interrupted, stopping probe");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // defaults -> YAML (if provided) -> env (APP__*)
    let figment = DiscoveryConfig::figment(cli.config.as_deref())?;
    let config = DiscoveryConfig::from_figment(&figment)?;
    let registry = Arc::new(ProbeConfig::from_figment(&figment)?.into_registry());

    let factory = Arc::new(DiscoveryResolverFactory::new(registry.clone(), config));
    let providers = ResolverRegistry::new();
    providers.register(factory.clone());
    providers.register(Arc::new(StaticResolverProvider));

    let args = ResolverArgs::new(Arc::new(SynchronizationContext::new()));
    let resolver = providers
        .new_name_resolver(&cli.target, &args)
        .with_context(|| format!("cannot resolve '{}'", cli.target))?;
    tracing::info!(uri = %cli.target, authority = resolver.service_authority(), "Resolving");

    let cancel = CancellationToken::new();
    let watcher = factory.watch_heartbeats(registry.subscribe(), cancel.clone());

    let (tx, mut updates) = mpsc::unbounded_channel();
    resolver.start(Arc::new(ForwardingListener(tx)))?;

    let outcome = print_updates(
        &mut updates,
        &registry,
        cli.watch,
        Duration::from_secs(cli.heartbeat_secs.max(1)),
    )
    .await;

    resolver.shutdown();
    cancel.cancel();
    watcher.await?;
    outcome
}
