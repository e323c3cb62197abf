use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::trace::PROBE_USER_AGENT;
use crate::types::{Event, ThroughputReading};

/// Ports served over TLS by the edge network.
pub const TLS_PORTS: [u16; 6] = [443, 2053, 2083, 2087, 2096, 8443];

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
pub const MEASURE_WINDOW: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThroughputError {
    #[error("invalid speed test URL: {0}")]
    InvalidUrl(String),
    #[error("download failed: {0}")]
    Connect(String),
}

impl ThroughputError {
    /// Value shown in place of a speed.
    pub fn placeholder(&self) -> &'static str {
        match self {
            ThroughputError::InvalidUrl(_) => "URL parse error",
            ThroughputError::Connect(_) => "connection error",
        }
    }
}

pub fn scheme_for_port(port: u16) -> &'static str {
    if TLS_PORTS.contains(&port) {
        "https"
    } else {
        "http"
    }
}

/// Build the request URL: the port decides the scheme, the configured URL
/// contributes host, path and query. A URL without scheme is accepted.
pub fn build_target_url(raw: &str, port: u16) -> Result<Url, ThroughputError> {
    let scheme = scheme_for_port(port);
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("{scheme}://{raw}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| ThroughputError::InvalidUrl(e.to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ThroughputError::InvalidUrl(format!("{raw}: missing host")));
    }
    url.set_scheme(scheme)
        .map_err(|_| ThroughputError::InvalidUrl(format!("{raw}: cannot use {scheme}")))?;
    url.set_port(None)
        .map_err(|_| ThroughputError::InvalidUrl(format!("{raw}: cannot clear port")))?;
    url.set_fragment(None);
    Ok(url)
}

/// Final speed from the peak and mean samples.
///
/// `0.6 * max + 0.4 * mean`, unless that falls below half the peak, in which
/// case the peak itself.
pub fn blend_speed(max: f64, mean: f64) -> f64 {
    let blended = max * 0.6 + mean * 0.4;
    if blended < max * 0.5 {
        max
    } else {
        blended
    }
}

pub fn format_speed(mb_per_s: f64) -> String {
    format!("{mb_per_s:.2} MB/s")
}

/// Turns a growing byte counter into periodic MB/s samples.
#[derive(Debug, Clone)]
pub struct RateSampler {
    samples: Vec<f64>,
    max: f64,
    last_bytes: u64,
    last_at: Instant,
}

impl RateSampler {
    pub fn new(start: Instant) -> Self {
        Self {
            samples: Vec::new(),
            max: 0.0,
            last_bytes: 0,
            last_at: start,
        }
    }

    /// Record the rate since the previous sample. `total_bytes` is the running
    /// byte count of the whole transfer.
    pub fn sample(&mut self, total_bytes: u64, now: Instant) {
        let secs = now.saturating_duration_since(self.last_at).as_secs_f64();
        if secs > 0.0 {
            let diff = total_bytes.saturating_sub(self.last_bytes) as f64;
            let rate = diff / secs / BYTES_PER_MB;
            self.samples.push(rate);
            if rate > self.max {
                self.max = rate;
            }
        }
        self.last_bytes = total_bytes;
        self.last_at = now;
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn speed(&self) -> f64 {
        blend_speed(self.max, self.mean())
    }
}

/// Download from `url` through `ip:port` for the measurement window and
/// return the blended speed in MB/s.
///
/// The URL's host only names the site (Host header, TLS SNI); the connection
/// always goes to `ip:port`.
pub async fn measure_throughput(ip: IpAddr, port: u16, url: &Url) -> Result<f64, ThroughputError> {
    let host = url
        .host_str()
        .ok_or_else(|| ThroughputError::InvalidUrl(format!("{url}: missing host")))?;
    let client = reqwest::Client::builder()
        .resolve(host, SocketAddr::new(ip, port))
        .no_proxy()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(PROBE_USER_AGENT)
        .build()
        .map_err(|e| ThroughputError::Connect(e.to_string()))?;

    let start = Instant::now();
    let mut resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ThroughputError::Connect(e.to_string()))?;
    debug!(status = %resp.status(), "speed test response");

    let mut sampler = RateSampler::new(start);
    let mut total: u64 = 0;
    let deadline = time::sleep(MEASURE_WINDOW);
    tokio::pin!(deadline);
    let mut ticker = time::interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            now = ticker.tick() => sampler.sample(total, now),
            chunk = resp.chunk() => match chunk {
                Ok(Some(bytes)) => total += bytes.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    debug!("speed test stream ended: {e}");
                    break;
                }
            },
        }
    }

    debug!(
        bytes = total,
        samples = sampler.samples().len(),
        max = sampler.max(),
        mean = sampler.mean(),
        "speed test finished"
    );
    Ok(sampler.speed())
}

/// Measure one address and report the reading to `sink`. Failures are
/// reported as a placeholder speed, never as a missing result.
pub async fn run_throughput(
    address: &str,
    port: u16,
    url: &str,
    min_speed: Option<f64>,
    sink: &EventSink,
) -> ThroughputReading {
    sink.log(format!("speed test started for {address} port {port}"));

    let outcome = match address.parse::<IpAddr>() {
        Ok(ip) => match build_target_url(url, port) {
            Ok(target) => measure_throughput(ip, port, &target).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(ThroughputError::Connect(format!("{address}: {e}"))),
    };

    let speed = match outcome {
        Ok(mbps) => {
            let speed = format_speed(mbps);
            match min_speed.filter(|m| *m > 0.0) {
                Some(min) if mbps < min => {
                    warn!(%address, %speed, min, "speed below minimum");
                    sink.log(format!(
                        "{address} speed test done: {speed} (below the minimum of {min:.2} MB/s)"
                    ));
                }
                _ => {
                    info!(%address, %speed, "speed test done");
                    sink.log(format!("{address} speed test done: {speed}"));
                }
            }
            speed
        }
        Err(e) => {
            warn!(%address, "{e}");
            if matches!(e, ThroughputError::Connect(_)) {
                sink.log(format!("speed test failed: {e}"));
            }
            e.placeholder().to_string()
        }
    };

    let reading = ThroughputReading {
        address: address.to_string(),
        speed,
    };
    sink.emit(Event::ThroughputResult(reading.clone()));
    reading
}
