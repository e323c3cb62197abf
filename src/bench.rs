use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::events::EventSink;
use crate::ranking;
use crate::types::{BenchmarkRecord, Event, Progress, ScanRecord};

/// Connect trials per address.
pub const TRIALS: u32 = 10;
/// Addresses benchmarked at the same time.
pub const BENCH_CONCURRENCY: usize = 50;
/// A progress event is sent after every this many finished addresses.
pub const PROGRESS_EVERY: usize = 5;

pub const EMPTY_BENCH_MESSAGE: &str = "no address available for testing, run a scan first";

/// Parameters of one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkPlan {
    /// Only addresses of this site; `None` or empty selects all sites.
    pub site: Option<String>,
    pub port: u16,
    pub timeout: Duration,
    /// 0 means no limit.
    pub max_addresses: usize,
}

/// Addresses of `records` matching the plan's site, in stored order,
/// truncated to the plan's limit.
pub fn select_targets(records: &[ScanRecord], plan: &BenchmarkPlan) -> Vec<String> {
    let site = plan.site.as_deref().filter(|s| !s.is_empty());
    let mut out: Vec<String> = records
        .iter()
        .filter(|r| site.map_or(true, |s| r.site == s))
        .map(|r| r.address.clone())
        .collect();
    if plan.max_addresses > 0 {
        out.truncate(plan.max_addresses);
    }
    out
}

/// Run the connect trials against one address sequentially. `None` marks a
/// failed trial.
pub async fn run_trials(addr: SocketAddr, timeout: Duration) -> Vec<Option<Duration>> {
    let mut out = Vec::with_capacity(TRIALS as usize);
    for _ in 0..TRIALS {
        let start = Instant::now();
        let res = time::timeout(timeout, TcpStream::connect(addr)).await;
        out.push(match res {
            Ok(Ok(_stream)) => Some(start.elapsed()),
            _ => None,
        });
    }
    out
}

/// Aggregate trial outcomes into a record.
///
/// Trials slower than `threshold` count as lost even though they connected.
/// Returns `None` when no trial succeeded.
pub fn summarize_trials(
    address: &str,
    trials: &[Option<Duration>],
    threshold: Duration,
) -> Option<BenchmarkRecord> {
    let ok: Vec<Duration> = trials
        .iter()
        .flatten()
        .copied()
        .filter(|d| *d <= threshold)
        .collect();
    if ok.is_empty() {
        return None;
    }

    let successes = ok.len() as u32;
    let sum: Duration = ok.iter().sum();
    let min = ok.iter().min().copied().unwrap_or_default();
    let max = ok.iter().max().copied().unwrap_or_default();
    let lost = TRIALS.saturating_sub(successes);

    Some(BenchmarkRecord {
        address: address.to_string(),
        min_latency: min,
        max_latency: max,
        avg_latency: sum / successes,
        loss_rate: f64::from(lost) / f64::from(TRIALS),
    })
}

/// Benchmark one address over TCP.
pub async fn measure_address(address: String, port: u16, timeout: Duration) -> Option<BenchmarkRecord> {
    let ip: IpAddr = address.parse().ok()?;
    let trials = run_trials(SocketAddr::new(ip, port), timeout).await;
    summarize_trials(&address, &trials, timeout)
}

/// Measure every target with at most `concurrency` addresses in flight,
/// stream each record as it is produced, then emit the ranked list once.
pub async fn benchmark_targets<F, Fut>(
    targets: Vec<String>,
    concurrency: usize,
    sink: &EventSink,
    measure: F,
) -> Result<Vec<BenchmarkRecord>, PipelineError>
where
    F: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Option<BenchmarkRecord>> + Send + 'static,
{
    if targets.is_empty() {
        return Err(PipelineError::Empty(EMPTY_BENCH_MESSAGE.to_string()));
    }

    let total = targets.len();
    let results: Arc<Mutex<Vec<BenchmarkRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(0usize));
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();

    for address in targets {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let results = results.clone();
        let completed = completed.clone();
        let sink = sink.clone();
        let measure = measure.clone();

        set.spawn(async move {
            let _permit = permit;

            if let Some(rec) = measure(address).await {
                sink.emit(Event::BenchmarkResult {
                    record: rec.clone(),
                });
                results.lock().await.push(rec);
            }

            let done = {
                let mut c = completed.lock().await;
                *c += 1;
                *c
            };
            if done % PROGRESS_EVERY == 0 || done == total {
                sink.emit(Event::BenchmarkProgress(Progress {
                    completed: done,
                    total,
                }));
            }
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!("benchmark worker failed: {e}");
        }
    }

    let mut records = std::mem::take(&mut *results.lock().await);
    ranking::rank_benchmarks(&mut records);
    info!(tested = total, usable = records.len(), "benchmark complete");
    sink.emit(Event::BenchmarkComplete {
        records: records.clone(),
    });
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn all_trials_over_threshold_drop_the_address() {
        let trials = vec![Some(ms(350)); TRIALS as usize];
        assert!(summarize_trials("192.0.2.1", &trials, ms(300)).is_none());
    }

    #[test]
    fn all_trials_failed_drop_the_address() {
        let trials = vec![None; TRIALS as usize];
        assert!(summarize_trials("192.0.2.1", &trials, ms(300)).is_none());
    }

    #[test]
    fn late_trials_count_as_lost() {
        let mut trials = vec![None; 4];
        trials.extend([Some(ms(400)), Some(ms(500))]);
        trials.extend([Some(ms(10)), Some(ms(20)), Some(ms(30)), Some(ms(40))]);
        let rec = summarize_trials("192.0.2.1", &trials, ms(300)).unwrap();
        assert_eq!(rec.min_latency, ms(10));
        assert_eq!(rec.max_latency, ms(40));
        assert_eq!(rec.avg_latency, ms(25));
        assert!((rec.loss_rate - 0.6).abs() < 1e-9);
    }

    #[test]
    fn trial_at_threshold_counts() {
        let mut trials = vec![Some(ms(300))];
        trials.extend(vec![None; 9]);
        let rec = summarize_trials("192.0.2.1", &trials, ms(300)).unwrap();
        assert!((rec.loss_rate - 0.9).abs() < 1e-9);
    }

    #[test]
    fn selection_filters_and_truncates() {
        let r = |a: &str, s: &str| ScanRecord {
            address: a.into(),
            site: s.into(),
            region: String::new(),
            city: String::new(),
            tcp_duration: ms(1),
            timestamp: String::new(),
        };
        let records = vec![r("a", "HKG"), r("b", "LAX"), r("c", "HKG"), r("d", "HKG")];
        let mut plan = BenchmarkPlan {
            site: Some("HKG".into()),
            port: 443,
            timeout: ms(300),
            max_addresses: 2,
        };
        assert_eq!(select_targets(&records, &plan), vec!["a", "c"]);

        plan.max_addresses = 0;
        assert_eq!(select_targets(&records, &plan), vec!["a", "c", "d"]);

        plan.site = Some(String::new());
        assert_eq!(select_targets(&records, &plan).len(), 4);

        plan.site = Some("SIN".into());
        assert!(select_targets(&records, &plan).is_empty());
    }
}
