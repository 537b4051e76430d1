//! The relocation engine.
//!
//! Jobs arrive grouped by destination and source. Each destination gets a
//! bounded queue drained by `workers` workers, and each source a
//! [`SourceThrottle`] token pool shared by every destination reading from
//! it. A job copies the metric (offloaded to the destination daemon or
//! fetched and posted by us) and, only after the copy succeeded, deletes
//! the source copy when asked to.
//!
//! Optionally every node is paced by its go-carbon cache health (see
//! [`Pacer`]) and run counters are pushed to Graphite.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bucky_net::{CacheSource, DeleteStatus, MetricTransport, NetError};
use bucky_types::{HealStats, SyncJob};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::graphite::{GraphiteConfig, GraphiteReporter};
use crate::pacer::{Pacer, PacingConfig};
use crate::progress::{ProgressReporter, ReporterExit};
use crate::stats::{Stage, StatsSnapshot, SyncStats};
use crate::throttle::SourceThrottle;

/// Jobs grouped as destination -> source -> jobs.
pub type JobSet = BTreeMap<String, BTreeMap<String, Vec<SyncJob>>>;

/// Number of jobs in `jobs`.
pub fn count_jobs(jobs: &JobSet) -> usize {
    jobs.values().flat_map(BTreeMap::values).map(Vec::len).sum()
}

/// Tunables of a sync run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Workers per destination.
    pub workers: usize,
    /// Delete each source copy after a successful copy.
    pub delete: bool,
    /// Ask destinations to pull from sources themselves.
    pub offload: bool,
    /// Do not fail the run over source metrics that do not exist.
    pub ignore_not_found: bool,
    /// Log the planned jobs and touch nothing.
    pub dry_run: bool,
    /// Log every job as it starts.
    pub verbose: bool,
    /// Time between progress lines.
    pub progress_interval: Duration,
    /// Pace jobs per node by go-carbon cache health.
    pub pacing: Option<PacingConfig>,
    /// Push run counters to Graphite.
    pub graphite: Option<GraphiteConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            delete: false,
            offload: false,
            ignore_not_found: false,
            dry_run: false,
            verbose: false,
            progress_interval: Duration::from_secs(10),
            pacing: None,
            graphite: None,
        }
    }
}

/// Outcome of a sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// No error that is not ignored was recorded.
    pub success: bool,
    /// Nothing was executed.
    pub dry_run: bool,
    /// Counters at the end of the run.
    pub stats: StatsSnapshot,
}

/// Executes [`JobSet`]s against a [`MetricTransport`].
pub struct SyncEngine {
    config: SyncConfig,
    transport: Arc<dyn MetricTransport>,
    cache_source: Option<Arc<dyn CacheSource>>,
    force_quit: Arc<Notify>,
}

impl SyncEngine {
    /// Create an engine.
    pub fn new(config: SyncConfig, transport: Arc<dyn MetricTransport>) -> Self {
        Self {
            config,
            transport,
            cache_source: None,
            force_quit: Arc::new(Notify::new()),
        }
    }

    /// Read go-carbon cache health through `source` when pacing.
    pub fn with_cache_source(mut self, source: Arc<dyn CacheSource>) -> Self {
        self.cache_source = Some(source);
        self
    }

    /// The engine's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport jobs run against.
    pub fn transport(&self) -> Arc<dyn MetricTransport> {
        self.transport.clone()
    }

    /// Handle that aborts a running [`SyncEngine::run`] when notified.
    ///
    /// The run returns [`SyncError::ForceQuit`] at once; its tasks are
    /// aborted and jobs in flight are not rolled back.
    pub fn force_quit_handle(&self) -> Arc<Notify> {
        self.force_quit.clone()
    }

    /// Run every job in `jobs` to completion.
    pub async fn run(&self, jobs: JobSet) -> Result<SyncReport, SyncError> {
        let total = count_jobs(&jobs);
        info!(
            total,
            offload = self.config.offload,
            delete = self.config.delete,
            "syncing metrics"
        );

        if self.config.dry_run {
            for (dst, by_src) in &jobs {
                for (src, list) in by_src {
                    for job in list {
                        info!("[{src}] {} => [{dst}] {}", job.old_name, job.new_name);
                    }
                }
            }
            info!("dry run, no metrics were touched");
            return Ok(SyncReport {
                success: true,
                dry_run: true,
                stats: SyncStats::new(total as u64, Vec::new()).snapshot(),
            });
        }

        let workers = self.config.workers.max(1);
        let mut nodes = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for (dst, by_src) in &jobs {
            nodes.insert(dst.clone());
            for src in by_src.keys() {
                nodes.insert(src.clone());
                sources.insert(src.clone());
            }
        }

        let pacer = self
            .config
            .pacing
            .clone()
            .map(|pacing| Pacer::new(pacing, nodes.iter().cloned()));
        let stats = Arc::new(SyncStats::new(total as u64, nodes));
        let throttle = SourceThrottle::new(SourceThrottle::capacity_for(workers), sources);
        let ctx = Arc::new(JobContext {
            transport: self.transport.clone(),
            stats: stats.clone(),
            throttle,
            pacer: pacer.clone(),
            delete: self.config.delete,
            offload: self.config.offload,
            verbose: self.config.verbose,
        });

        // Background tasks that never finish on their own.
        let background: Vec<JoinHandle<()>> = match &pacer {
            Some(pacer) => pacer.start(self.cache_source.clone()),
            None => Vec::new(),
        };

        let mut producers: Vec<JoinHandle<()>> = Vec::new();
        let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();
        for (dst, by_src) in jobs {
            let (tx, rx) = mpsc::channel::<SyncJob>(workers);
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..workers {
                worker_handles.push(tokio::spawn(worker(ctx.clone(), rx.clone())));
            }
            for (src, jobs) in by_src {
                let tx = tx.clone();
                let dst = dst.clone();
                producers.push(tokio::spawn(async move {
                    for mut job in jobs {
                        job.src = src.clone();
                        job.dst = dst.clone();
                        if tx.send(job).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            // Each queue closes once its last producer is done.
        }
        info!(total_workers = worker_handles.len(), "workers started");
        let mut aborts: Vec<AbortHandle> = producers
            .iter()
            .chain(worker_handles.iter())
            .map(JoinHandle::abort_handle)
            .collect();

        let (done_tx, done_rx) = watch::channel(false);
        let graphite = self.config.graphite.clone().map(|config| {
            let reporter = GraphiteReporter::new(config, stats.clone(), pacer.clone());
            tokio::spawn(reporter.run(done_rx.clone()))
        });
        aborts.extend(graphite.iter().map(JoinHandle::abort_handle));
        aborts.extend(background.iter().map(JoinHandle::abort_handle));
        let reporter = ProgressReporter::new(
            stats.clone(),
            self.config.progress_interval,
            self.config.delete,
        );
        let mut reporter = tokio::spawn(reporter.run(done_rx, self.force_quit.clone()));

        let work = async move {
            for handle in producers {
                handle.await?;
            }
            for handle in worker_handles {
                handle.await?;
            }
            Ok::<(), SyncError>(())
        };
        tokio::pin!(work);

        let abort_all = || {
            for task in &aborts {
                task.abort();
            }
        };

        let early_exit = tokio::select! {
            result = &mut work => match result {
                Ok(()) => None,
                Err(e) => {
                    abort_all();
                    return Err(e);
                }
            },
            exit = &mut reporter => Some(exit),
        };
        let forced = match early_exit {
            Some(Ok(ReporterExit::ForceQuit)) => true,
            Some(exit) => {
                warn!(?exit, "progress reporter stopped early");
                if let Err(e) = work.await {
                    abort_all();
                    return Err(e);
                }
                let _ = done_tx.send(true);
                false
            }
            None => {
                let _ = done_tx.send(true);
                matches!(reporter.await, Ok(ReporterExit::ForceQuit))
            }
        };
        if forced {
            abort_all();
            return Err(SyncError::ForceQuit);
        }

        if let Some(graphite) = graphite {
            if let Err(e) = graphite.await {
                warn!(error = %e, "graphite reporter failed");
            }
        }
        for task in &background {
            task.abort();
        }

        let snapshot = stats.snapshot();
        snapshot.log_summary();
        let success = snapshot.is_success(self.config.ignore_not_found);
        if !success {
            error!("errors are present in sync");
        }
        Ok(SyncReport {
            success,
            dry_run: false,
            stats: snapshot,
        })
    }
}

/// State shared by every worker of one run.
struct JobContext {
    transport: Arc<dyn MetricTransport>,
    stats: Arc<SyncStats>,
    throttle: SourceThrottle,
    pacer: Option<Arc<Pacer>>,
    delete: bool,
    offload: bool,
    verbose: bool,
}

async fn worker(ctx: Arc<JobContext>, queue: Arc<Mutex<mpsc::Receiver<SyncJob>>>) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        ctx.sync_one(&job).await;
    }
}

impl JobContext {
    #[tracing::instrument(skip(self, job), fields(src = %job.src, dst = %job.dst, metric = %job.old_name))]
    async fn sync_one(&self, job: &SyncJob) {
        let _permit = match self.throttle.acquire(&job.src).await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "cannot schedule job");
                self.stats.record_copy_error();
                self.stats.record_job(&job.src, &job.dst, Duration::ZERO);
                return;
            }
        };

        if let Some(pacer) = &self.pacer {
            pacer.acquire(&job.dst).await;
            pacer.acquire(&job.src).await;
        }

        let started = Instant::now();
        if self.verbose {
            info!("Relocating {job}  delete={}", self.delete);
        }

        match self.copy(job).await {
            Ok(heal) => {
                self.stats.record_heal(&heal);
                if self.delete {
                    self.delete_source(job).await;
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "metric not found");
                self.stats.record_not_found();
            }
            Err(e) => {
                error!(error = %e, "copy failed");
                self.stats.record_copy_error();
            }
        }

        self.stats.record_job(&job.src, &job.dst, started.elapsed());
    }

    async fn copy(&self, job: &SyncJob) -> Result<HealStats, NetError> {
        if self.offload {
            return self
                .transport
                .copy_metric(&job.src, &job.dst, &job.old_name, &job.new_name)
                .await;
        }
        let metric = self.transport.get_metric(&job.src, &job.old_name).await?;
        let metric = metric.renamed(job.new_name.clone());
        self.transport.post_metric(&job.dst, &metric).await
    }

    async fn delete_source(&self, job: &SyncJob) {
        let started = Instant::now();
        match self.transport.delete_metric(&job.src, &job.old_name).await {
            Ok(DeleteStatus::Deleted) => debug!("source deleted"),
            Ok(DeleteStatus::NotFound) => warn!("source already gone"),
            Err(e) => {
                error!(error = %e, "delete failed");
                self.stats.record_delete_error();
            }
        }
        self.stats.record_stage(Stage::Delete, started.elapsed());
    }
}
