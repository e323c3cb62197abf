use std::cmp::Ordering;

use crate::types::{BenchmarkRecord, ScanRecord, SiteSummary};

/// Scan records: fastest TCP connect first.
pub fn compare_scan_records(a: &ScanRecord, b: &ScanRecord) -> Ordering {
    a.tcp_duration
        .cmp(&b.tcp_duration)
        .then_with(|| a.address.cmp(&b.address))
}

/// Site summaries: lowest minimum latency first.
pub fn compare_sites(a: &SiteSummary, b: &SiteSummary) -> Ordering {
    a.min_latency_ms
        .cmp(&b.min_latency_ms)
        .then_with(|| a.site.cmp(&b.site))
}

/// Benchmark records, in order of precedence:
/// loss rate, minimum latency in whole milliseconds, maximum latency,
/// average latency. Sub-millisecond differences in the minimum are ignored.
pub fn compare_benchmarks(a: &BenchmarkRecord, b: &BenchmarkRecord) -> Ordering {
    a.loss_rate
        .total_cmp(&b.loss_rate)
        .then_with(|| a.min_latency.as_millis().cmp(&b.min_latency.as_millis()))
        .then_with(|| a.max_latency.cmp(&b.max_latency))
        .then_with(|| a.avg_latency.cmp(&b.avg_latency))
        .then_with(|| a.address.cmp(&b.address))
}

pub fn rank_scan_records(records: &mut [ScanRecord]) {
    records.sort_by(compare_scan_records);
}

pub fn rank_sites(sites: &mut [SiteSummary]) {
    sites.sort_by(compare_sites);
}

pub fn rank_benchmarks(records: &mut [BenchmarkRecord]) {
    records.sort_by(compare_benchmarks);
}
