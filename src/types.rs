use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::subnets::IpFamily;

/// One address that answered the trace probe, tagged with its edge site.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub address: String,
    pub site: String,
    pub region: String,
    pub city: String,
    #[serde(rename = "tcp_ms", with = "duration_ms")]
    pub tcp_duration: Duration,
    pub timestamp: String,
}

/// Per-site aggregate of a scan run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SiteSummary {
    pub site: String,
    pub region: String,
    pub city: String,
    pub address_count: usize,
    pub min_latency_ms: u64,
}

/// Latency statistics of one address over the benchmark trials.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BenchmarkRecord {
    pub address: String,
    #[serde(rename = "min_ms", with = "duration_ms")]
    pub min_latency: Duration,
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max_latency: Duration,
    #[serde(rename = "avg_ms", with = "duration_ms")]
    pub avg_latency: Duration,
    pub loss_rate: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThroughputReading {
    pub address: String,
    pub speed: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Commands accepted from an observer.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    StartScan {
        #[serde(default)]
        ip_family: IpFamily,
        concurrency: usize,
    },
    StartBenchmark {
        #[serde(default)]
        site: Option<String>,
        port: u16,
        timeout_ms: u64,
        #[serde(default)]
        max_addresses: usize,
    },
    StartThroughput {
        address: String,
        port: u16,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        min_speed: Option<f64>,
    },
}

/// Events pushed to an observer while pipelines run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Log { text: String },
    Error { text: String },
    ScanProgress(Progress),
    ScanResult { record: ScanRecord },
    ScanComplete { sites: Vec<SiteSummary> },
    BenchmarkProgress(Progress),
    BenchmarkResult { record: BenchmarkRecord },
    BenchmarkComplete { records: Vec<BenchmarkRecord> },
    ThroughputResult(ThroughputReading),
}

/// (De)serialize a `Duration` as fractional milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid duration: {ms} ms")));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}
