//! `bucky`: tooling for sharded Graphite clusters.
//!
//! # Usage
//!
//! ```text
//! bucky servers                                  # show the ring and its health
//! bucky locate servers.web01.cpu.user            # which daemon owns a metric
//! bucky locate -s servers.web01.cpu.user         # same, trusting the seed's ring
//! bucky inconsistent                             # metrics off their owner
//! bucky rebalance --delete -w 10                 # move them home
//! bucky rebalance graphite009:4242 --delete      # also drain a retired daemon
//! bucky backfill renames.json --delete           # copy metrics to new names
//! bucky copy --src graphite001:4242 --dst graphite101:4242
//! ```
//!
//! The cluster is found through `--host` (or `BUCKYHOST`). Sending SIGUSR1
//! to a running sync aborts it immediately with exit status 1. Syncs can be
//! paced by go-carbon cache health (`--go-carbon-health-check`) and report
//! their counters to Graphite (`--graphite-endpoint`).

mod config;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bucky_cluster::{ClusterConfig, ClusterDirectory, resolve, resolve_single};
use bucky_hashring::HashRing;
use bucky_net::{CarbonAdminClient, HttpTransport, MetricTransport};
use bucky_sync::{
    GraphiteConfig, PacingConfig, SyncConfig, SyncEngine, SyncError, SyncReport, workflow,
};
use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// Arguments
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "bucky",
    version,
    about = "Manage metric placement in sharded Graphite clusters"
)]
struct Cli {
    /// bucky.toml to read instead of the one in the user's config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Any daemon of the cluster, as `host[:port]`.
    #[arg(short = 'H', long, global = true, env = "BUCKYHOST")]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command that moves metrics.
#[derive(Args, Debug, Clone)]
struct SyncArgs {
    /// Workers per destination daemon.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Delete each source metric once it was copied.
    #[arg(long)]
    delete: bool,

    /// Have destination daemons fetch metrics from sources directly.
    #[arg(long)]
    offload: bool,

    /// Do not fail over source metrics that do not exist.
    #[arg(long = "ignore404")]
    ignore_not_found: bool,

    /// Print the planned moves and do nothing.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Log every metric as it is moved.
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    pacing: PacingArgs,

    #[command(flatten)]
    graphite: GraphiteArgs,
}

/// Pacing of syncs by the health of each node's go-carbon cache.
#[derive(Args, Debug, Clone)]
struct PacingArgs {
    /// Slow syncing down on nodes whose go-carbon cache nears its limit.
    #[arg(long)]
    go_carbon_health_check: bool,

    /// Seconds between go-carbon cache reads.
    #[arg(long, default_value_t = 10)]
    go_carbon_health_check_interval: u64,

    /// Scheme of go-carbon's admin API.
    #[arg(long, default_value = "http")]
    go_carbon_protocol: String,

    /// Port of go-carbon's admin API.
    #[arg(long, default_value_t = 8080)]
    go_carbon_port: u16,

    /// Share of the cache limit at which a node counts as overloaded.
    #[arg(long, default_value_t = 0.75)]
    go_carbon_cache_threshold: f64,

    /// Starting metrics per second on each node.
    #[arg(long, default_value_t = 1)]
    metrics_per_second: u64,

    /// Seconds between rate increases on healthy nodes; 0 disables them.
    #[arg(long, default_value_t = 600)]
    sync_speed_up_interval: u64,

    /// Never randomly slow down fast nodes.
    #[arg(long)]
    no_random_easing: bool,
}

impl PacingArgs {
    fn config(&self) -> Option<PacingConfig> {
        if !self.go_carbon_health_check {
            return None;
        }
        Some(PacingConfig {
            metrics_per_second: self.metrics_per_second.max(1),
            speed_up_interval: (self.sync_speed_up_interval > 0)
                .then(|| Duration::from_secs(self.sync_speed_up_interval)),
            check_interval: Duration::from_secs(self.go_carbon_health_check_interval.max(1)),
            cache_threshold: self.go_carbon_cache_threshold,
            random_easing: !self.no_random_easing,
        })
    }
}

/// Graphite reporting of sync counters.
#[derive(Args, Debug, Clone)]
struct GraphiteArgs {
    /// Carbon plaintext `host:port` to send sync counters to.
    #[arg(long)]
    graphite_endpoint: Option<String>,

    /// Prefix of the reported metrics.
    #[arg(long)]
    graphite_metrics_prefix: Option<String>,

    /// Seconds between reports.
    #[arg(long)]
    graphite_stat_interval: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cluster's ring and whether its members agree on it.
    Servers,

    /// Show which daemon owns each metric.
    Locate {
        /// Metric names. A JSON list is read from stdin when none are given.
        metrics: Vec<String>,

        /// Print a JSON object instead of one line per metric.
        #[arg(long)]
        json: bool,

        /// Use the seed's ring without checking the rest of the cluster.
        #[arg(short, long)]
        single: bool,
    },

    /// List metrics stored on a daemon that does not own them.
    Inconsistent {
        /// Additional `host:port` daemons to inspect (e.g. retired ones).
        servers: Vec<String>,

        /// Print a JSON object instead of one line per metric.
        #[arg(long)]
        json: bool,
    },

    /// Move every inconsistent metric to the daemon that owns it.
    Rebalance {
        /// Additional `host:port` daemons to drain.
        servers: Vec<String>,

        /// Only move metrics to these daemons (comma separated `host:port`).
        #[arg(long, value_delimiter = ',')]
        allowed_dsts: Vec<String>,

        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Copy metrics to new names from a JSON object of old to new names.
    Backfill {
        /// JSON file mapping old metric names to new ones.
        map: PathBuf,

        /// Seed of a different destination cluster.
        #[arg(long)]
        dst_seed: Option<String>,

        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Copy every metric of one daemon to another.
    Copy {
        /// Source daemon, `host:port`.
        #[arg(long)]
        src: String,

        /// Destination daemon, `host:port`.
        #[arg(long)]
        dst: String,

        #[command(flatten)]
        sync: SyncArgs,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    let transport = Arc::new(
        HttpTransport::new(config.daemon_port(), config.timeout())
            .context("failed to build HTTP client")?,
    );
    let seed = config.seed(cli.host.as_deref());

    match cli.command {
        Commands::Servers => cmd_servers(&seed, transport.as_ref()).await,
        Commands::Locate {
            metrics,
            json,
            single,
        } => cmd_locate(&seed, transport.as_ref(), metrics, json, single).await,
        Commands::Inconsistent { servers, json } => {
            cmd_inconsistent(&seed, transport, &servers, json).await
        }
        Commands::Rebalance {
            servers,
            allowed_dsts,
            sync,
        } => {
            let servers: Vec<String> = servers.iter().map(|s| transport.host_port(s)).collect();
            let cluster = resolve_cluster(&seed, transport.as_ref()).await?;
            let engine = build_engine(&config, &sync, transport)?;
            finish(workflow::rebalance(&engine, &cluster, &servers, &allowed_dsts).await)
        }
        Commands::Backfill {
            map,
            dst_seed,
            sync,
        } => {
            let map = read_rename_map(&map)?;
            let src_cluster = resolve_cluster(&seed, transport.as_ref()).await?;
            let dst_cluster = match dst_seed {
                Some(dst_seed) => resolve_cluster(&dst_seed, transport.as_ref()).await?,
                None => src_cluster.clone(),
            };
            let engine = build_engine(&config, &sync, transport)?;
            finish(workflow::backfill(&engine, &src_cluster, &dst_cluster, &map).await)
        }
        Commands::Copy { src, dst, sync } => {
            let src = transport.host_port(&src);
            let dst = transport.host_port(&dst);
            let engine = build_engine(&config, &sync, transport)?;
            finish(workflow::copy(&engine, &src, &dst).await)
        }
    }
}

/// Log to stderr at `[log] level`, unless `RUST_LOG` says otherwise.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn resolve_cluster(seed: &str, directory: &dyn ClusterDirectory) -> Result<ClusterConfig> {
    resolve(seed, directory)
        .await
        .with_context(|| format!("failed to resolve cluster from {seed}"))
}

/// Sync settings from the config file with command line flags on top.
fn sync_config(config: &CliConfig, args: &SyncArgs) -> SyncConfig {
    SyncConfig {
        workers: args.workers.unwrap_or_else(|| config.workers()),
        delete: args.delete || config.sync.delete,
        offload: args.offload || config.sync.offload,
        ignore_not_found: args.ignore_not_found || config.sync.ignore_not_found,
        dry_run: args.dry_run,
        verbose: args.verbose,
        progress_interval: config.progress_interval(),
        pacing: args.pacing.config(),
        graphite: graphite_config(config, &args.graphite),
    }
}

/// Graphite reporting from flags over the `[graphite]` section, if an
/// endpoint is given by either.
fn graphite_config(config: &CliConfig, args: &GraphiteArgs) -> Option<GraphiteConfig> {
    let endpoint = args
        .graphite_endpoint
        .clone()
        .or_else(|| config.graphite.endpoint.clone())?;
    let mut graphite = GraphiteConfig::new(endpoint);
    if let Some(prefix) = args
        .graphite_metrics_prefix
        .clone()
        .or_else(|| config.graphite.prefix.clone())
    {
        graphite.prefix = prefix;
    }
    if let Some(secs) = args.graphite_stat_interval.or(config.graphite.interval_secs) {
        graphite.interval = Duration::from_secs(secs.max(1));
    }
    Some(graphite)
}

fn build_engine(
    config: &CliConfig,
    args: &SyncArgs,
    transport: Arc<HttpTransport>,
) -> Result<SyncEngine> {
    let sync = sync_config(config, args);
    if sync.workers == 0 {
        bail!("--workers must be at least 1");
    }
    let pacing = args.pacing.go_carbon_health_check;
    let transport: Arc<dyn MetricTransport> = transport;
    let mut engine = SyncEngine::new(sync, transport);
    if pacing {
        let carbon = CarbonAdminClient::new(
            args.pacing.go_carbon_protocol.clone(),
            args.pacing.go_carbon_port,
            config.timeout(),
        )
        .context("failed to build go-carbon client")?;
        engine = engine.with_cache_source(Arc::new(carbon));
    }
    install_force_quit(engine.force_quit_handle())?;
    Ok(engine)
}

/// Abort the running sync on SIGUSR1.
#[cfg(unix)]
fn install_force_quit(handle: Arc<Notify>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    tokio::spawn(async move {
        if usr1.recv().await.is_some() {
            warn!("SIGUSR1 received, forcing exit");
            handle.notify_one();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_force_quit(_handle: Arc<Notify>) -> Result<()> {
    Ok(())
}

/// Turn a sync outcome into the process exit status.
fn finish(result: Result<SyncReport, SyncError>) -> Result<ExitCode> {
    match result {
        Ok(report) if report.success => {
            if report.dry_run {
                info!("dry run complete");
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(_) => Ok(ExitCode::FAILURE),
        Err(SyncError::ForceQuit) => {
            error!("sync aborted");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn read_rename_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON object of old to new names", path.display()))
}

// -----------------------------------------------------------------------
// bucky servers
// -----------------------------------------------------------------------

async fn cmd_servers(seed: &str, directory: &dyn ClusterDirectory) -> Result<ExitCode> {
    let cluster = resolve_cluster(seed, directory).await?;
    let ring = cluster.ring();

    println!("Hash ring: {ring}");
    println!("Algorithm: {}", ring.algorithm());
    println!("Replicas:  {}", ring.replicas());
    println!("Servers ({}):", cluster.servers().len());
    for server in cluster.host_ports() {
        println!("  {server}");
    }
    println!("Healthy:   {}", cluster.is_healthy());

    Ok(if cluster.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// -----------------------------------------------------------------------
// bucky locate
// -----------------------------------------------------------------------

async fn cmd_locate(
    seed: &str,
    directory: &dyn ClusterDirectory,
    mut metrics: Vec<String>,
    json: bool,
    single: bool,
) -> Result<ExitCode> {
    if metrics.is_empty() {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("failed to read metrics from stdin")?;
        metrics = serde_json::from_str(&input).context("stdin is not a JSON list of metrics")?;
    }

    let cluster = locate_cluster(seed, directory, single).await?;
    let located = cluster.locate(metrics.iter().map(String::as_str));
    if json {
        println!("{}", serde_json::to_string_pretty(&located)?);
    } else {
        for (metric, server) in &located {
            println!("{metric}: {server}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// The ring `locate` answers from: the seed's alone with `single`,
/// otherwise the whole cluster's, which must be healthy.
async fn locate_cluster(
    seed: &str,
    directory: &dyn ClusterDirectory,
    single: bool,
) -> Result<ClusterConfig> {
    if single {
        return resolve_single(seed, directory)
            .await
            .with_context(|| format!("failed to read the ring of {seed}"));
    }
    let cluster = resolve_cluster(seed, directory).await?;
    cluster
        .require_healthy()
        .context("cluster is inconsistent; investigate with `bucky servers` or pass --single")?;
    Ok(cluster)
}

// -----------------------------------------------------------------------
// bucky inconsistent
// -----------------------------------------------------------------------

async fn cmd_inconsistent(
    seed: &str,
    transport: Arc<HttpTransport>,
    extra: &[String],
    json: bool,
) -> Result<ExitCode> {
    let cluster = resolve_cluster(seed, transport.as_ref()).await?;
    let extra: Vec<String> = extra.iter().map(|s| transport.host_port(s)).collect();
    let found = workflow::inconsistent(transport, &cluster, &extra).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        for (server, metrics) in &found {
            for metric in metrics {
                println!("{server}: {metric}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
