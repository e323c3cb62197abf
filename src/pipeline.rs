//! The engine: owns the scan results, the site directory and the
//! single-flight slot, and turns observer commands into pipeline runs.
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bench::{self, BenchmarkPlan};
use crate::error::PipelineError;
use crate::events::EventSink;
use crate::probe::{self, ProbeConfig};
use crate::scanner;
use crate::sources::{CachedSource, SiteDirectory};
use crate::speed;
use crate::subnets::{self, IpFamily};
use crate::types::{BenchmarkRecord, Command, ScanRecord, SiteSummary};

pub const DEFAULT_SPEED_URL: &str = "speed.cloudflare.com/__down?bytes=100000000";

/// Settings shared by every run of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the subnet lists and the locations cache.
    pub data_dir: PathBuf,
    /// Speed test URL used when a throughput command carries none.
    pub speed_url: String,
    pub probe: ProbeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            speed_url: DEFAULT_SPEED_URL.to_string(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Proof of owning the engine's single pipeline slot. The slot is released
/// when the token is dropped.
#[derive(Debug)]
pub struct RunToken {
    flag: Arc<AtomicBool>,
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    sites: Option<Arc<SiteDirectory>>,
    records: Arc<Mutex<Vec<ScanRecord>>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// `sites` is the directory loaded at startup, or `None` if it could not
    /// be obtained (scans then fail with an acquisition error).
    pub fn new(config: EngineConfig, sites: Option<SiteDirectory>) -> Self {
        Self {
            config: Arc::new(config),
            sites: sites.map(Arc::new),
            records: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn known_sites(&self) -> usize {
        self.sites.as_ref().map_or(0, |s| s.len())
    }

    /// Snapshot of the latest scan's records, fastest first.
    pub async fn scan_records(&self) -> Vec<ScanRecord> {
        self.records.lock().await.clone()
    }

    /// Claim the pipeline slot, or fail with [`PipelineError::Busy`].
    pub fn try_begin(&self) -> Result<RunToken, PipelineError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PipelineError::Busy)?;
        Ok(RunToken {
            flag: self.running.clone(),
        })
    }

    /// Claim the slot synchronously and run `job` in the background. The
    /// slot stays taken until the job has finished.
    pub fn spawn_pipeline<F, Fut>(&self, job: F) -> Result<JoinHandle<()>, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.try_begin()?;
        let fut = job();
        Ok(tokio::spawn(async move {
            fut.await;
            drop(token);
        }))
    }

    /// Route one observer command. A busy engine answers with an error event.
    pub fn dispatch(&self, cmd: Command, sink: EventSink) -> Option<JoinHandle<()>> {
        let res = match cmd {
            Command::StartScan {
                ip_family,
                concurrency,
            } => self.start_scan(ip_family, concurrency, sink.clone()),
            Command::StartBenchmark {
                site,
                port,
                timeout_ms,
                max_addresses,
            } => self.start_benchmark(
                BenchmarkPlan {
                    site,
                    port,
                    timeout: Duration::from_millis(timeout_ms),
                    max_addresses,
                },
                sink.clone(),
            ),
            Command::StartThroughput {
                address,
                port,
                url,
                min_speed,
            } => self.start_throughput(address, port, url, min_speed, sink.clone()),
        };
        match res {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("command rejected: {e}");
                sink.error(e.to_string());
                None
            }
        }
    }

    pub fn start_scan(
        &self,
        family: IpFamily,
        concurrency: usize,
        sink: EventSink,
    ) -> Result<JoinHandle<()>, PipelineError> {
        let engine = self.clone();
        self.spawn_pipeline(move || async move {
            if let Err(e) = engine.scan_stage(family, concurrency, &sink).await {
                sink.error(e.to_string());
            }
        })
    }

    pub fn start_benchmark(
        &self,
        plan: BenchmarkPlan,
        sink: EventSink,
    ) -> Result<JoinHandle<()>, PipelineError> {
        let engine = self.clone();
        self.spawn_pipeline(move || async move {
            if let Err(e) = engine.benchmark_stage(&plan, &sink).await {
                sink.error(e.to_string());
            }
        })
    }

    pub fn start_throughput(
        &self,
        address: String,
        port: u16,
        url: Option<String>,
        min_speed: Option<f64>,
        sink: EventSink,
    ) -> Result<JoinHandle<()>, PipelineError> {
        let url = url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.config.speed_url.clone());
        self.spawn_pipeline(move || async move {
            speed::run_throughput(&address, port, &url, min_speed, &sink).await;
        })
    }

    /// Load candidates, probe them and publish the ranked site summaries.
    /// The caller must hold the engine's run token.
    pub async fn run_scan(
        &self,
        _token: &RunToken,
        family: IpFamily,
        concurrency: usize,
        sink: &EventSink,
    ) -> Result<Vec<SiteSummary>, PipelineError> {
        self.scan_stage(family, concurrency, sink).await
    }

    /// Benchmark the stored scan records selected by `plan`.
    /// The caller must hold the engine's run token.
    pub async fn run_benchmark(
        &self,
        _token: &RunToken,
        plan: &BenchmarkPlan,
        sink: &EventSink,
    ) -> Result<Vec<BenchmarkRecord>, PipelineError> {
        self.benchmark_stage(plan, sink).await
    }

    async fn scan_stage(
        &self,
        family: IpFamily,
        concurrency: usize,
        sink: &EventSink,
    ) -> Result<Vec<SiteSummary>, PipelineError> {
        sink.log(format!("starting {family} scan"));

        let sites = self.sites.clone().ok_or_else(|| PipelineError::Acquisition {
            what: "site directory".into(),
            reason: "locations were not loaded at startup".into(),
        })?;

        let source = CachedSource::new(
            &self.config.data_dir,
            family.cache_name(),
            family.source_url(),
        );
        let (content, _) = source
            .load()
            .await
            .map_err(|e| PipelineError::acquisition(format!("{family} subnet list"), &e))?;

        let subnet_list = subnets::parse_subnet_list(&content);
        let candidates = subnets::expand_subnets(&subnet_list, family, &mut rand::thread_rng());

        self.records.lock().await.clear();
        info!(candidates = candidates.len(), concurrency, "scanning");
        sink.log(format!("scanning {} addresses", candidates.len()));

        let cfg = self.config.probe;
        let mut records = scanner::scan_candidates(candidates, concurrency, sink, move |ip| {
            let sites = sites.clone();
            async move { probe::probe_address(&ip, &cfg, &sites).await }
        })
        .await;

        let summaries = scanner::finish_scan(&mut records, sink)?;
        *self.records.lock().await = records;
        Ok(summaries)
    }

    async fn benchmark_stage(
        &self,
        plan: &BenchmarkPlan,
        sink: &EventSink,
    ) -> Result<Vec<BenchmarkRecord>, PipelineError> {
        let targets = {
            let records = self.records.lock().await;
            bench::select_targets(&records, plan)
        };
        if targets.is_empty() {
            return Err(PipelineError::Empty(bench::EMPTY_BENCH_MESSAGE.to_string()));
        }

        let label = plan.site.as_deref().filter(|s| !s.is_empty()).unwrap_or("all sites");
        sink.log(format!(
            "benchmarking {} addresses of {label}",
            targets.len()
        ));

        let (port, timeout) = (plan.port, plan.timeout);
        bench::benchmark_targets(targets, bench::BENCH_CONCURRENCY, sink, move |ip| {
            bench::measure_address(ip, port, timeout)
        })
        .await
    }
}
