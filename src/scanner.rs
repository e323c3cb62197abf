use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::events::EventSink;
use crate::ranking;
use crate::types::{Event, Progress, ScanRecord, SiteSummary};

/// Upper bound on simultaneously running probes, whatever the caller asks for.
pub const MAX_CONCURRENCY: usize = 5_000;
/// A progress event is sent after every this many completed probes.
pub const PROGRESS_EVERY: usize = 10;
/// Running minimum of a site before its first reading.
const NO_READING: u64 = u64::MAX;

pub const EMPTY_SCAN_MESSAGE: &str = "scan finished but no usable address was found; \
check the network, switch the IP family or raise the latency threshold";

#[derive(Default)]
struct ScanState {
    records: Vec<ScanRecord>,
    completed: usize,
}

/// Probe every candidate with at most `concurrency` probes in flight.
///
/// - A semaphore permit is taken before each worker is spawned and released
///   when the worker finishes, however it finishes.
/// - Found records are streamed to `sink` as they arrive.
/// - Records and the completion counter share one mutex, never held across
///   the probe itself.
///
/// Returns the records in arrival order.
pub async fn scan_candidates<F, Fut>(
    candidates: Vec<String>,
    concurrency: usize,
    sink: &EventSink,
    probe: F,
) -> Vec<ScanRecord>
where
    F: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Option<ScanRecord>> + Send + 'static,
{
    let total = candidates.len();
    let state = Arc::new(Mutex::new(ScanState::default()));
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, MAX_CONCURRENCY)));
    let mut set = JoinSet::new();

    for address in candidates {
        let Ok(permit) = sem.clone().acquire_owned().await else {
            break;
        };
        let state = state.clone();
        let sink = sink.clone();
        let probe = probe.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            let found = probe(address).await;
            if let Some(rec) = &found {
                sink.emit(Event::ScanResult {
                    record: rec.clone(),
                });
            }

            let completed = {
                let mut s = state.lock().await;
                if let Some(rec) = found {
                    s.records.push(rec);
                }
                s.completed += 1;
                s.completed
            };
            if completed % PROGRESS_EVERY == 0 || completed == total {
                sink.emit(Event::ScanProgress(Progress { completed, total }));
            }
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!("scan worker failed: {e}");
        }
    }

    let records = std::mem::take(&mut state.lock().await.records);
    records
}

/// Fold records into one summary per site. `records` is sorted by connect
/// time as a side effect.
pub fn summarize_sites(records: &mut [ScanRecord]) -> Vec<SiteSummary> {
    ranking::rank_scan_records(records);

    let mut by_site: HashMap<&str, SiteSummary> = HashMap::new();
    for rec in records.iter() {
        let entry = by_site
            .entry(rec.site.as_str())
            .or_insert_with(|| SiteSummary {
                site: rec.site.clone(),
                region: rec.region.clone(),
                city: rec.city.clone(),
                address_count: 0,
                min_latency_ms: NO_READING,
            });
        entry.address_count += 1;
        let ms = u64::try_from(rec.tcp_duration.as_millis()).unwrap_or(u64::MAX);
        entry.min_latency_ms = entry.min_latency_ms.min(ms);
    }

    let mut sites: Vec<SiteSummary> = by_site.into_values().collect();
    ranking::rank_sites(&mut sites);
    sites
}

/// Rank a finished scan and announce it.
///
/// An empty scan is reported as [`PipelineError::Empty`] and no
/// `scan_complete` event is sent.
pub fn finish_scan(
    records: &mut [ScanRecord],
    sink: &EventSink,
) -> Result<Vec<SiteSummary>, PipelineError> {
    if records.is_empty() {
        return Err(PipelineError::Empty(EMPTY_SCAN_MESSAGE.to_string()));
    }
    let sites = summarize_sites(records);
    info!(
        records = records.len(),
        sites = sites.len(),
        "scan complete"
    );
    sink.log("scan complete, pick a site for the latency benchmark");
    sink.emit(Event::ScanComplete {
        sites: sites.clone(),
    });
    Ok(sites)
}
