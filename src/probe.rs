use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{anyhow, Result};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::{header, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::sources::SiteDirectory;
use crate::trace::{TraceReport, PROBE_USER_AGENT};
use crate::types::ScanRecord;

pub const TRACE_PATH: &str = "/cdn-cgi/trace";
/// Upper bound on the bytes read from a trace response.
const MAX_TRACE_BYTES: usize = 16 * 1024;

/// Port and timeouts of the connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 80,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Connect to `address`, request the trace document over the same
/// connection and identify the edge site that answered.
///
/// Unreachable addresses, timeouts and foreign responses all yield `None`.
pub async fn probe_address(
    address: &str,
    cfg: &ProbeConfig,
    sites: &SiteDirectory,
) -> Option<ScanRecord> {
    let ip: IpAddr = address.parse().ok()?;
    let addr = SocketAddr::new(ip, cfg.port);

    let start = Instant::now();
    let stream = match time::timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        _ => return None,
    };
    let tcp_duration = start.elapsed();

    let body = match time::timeout(cfg.request_timeout, fetch_trace(stream, addr)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(%addr, "trace request failed: {e}");
            return None;
        }
        Err(_) => {
            debug!(%addr, "trace request timed out");
            return None;
        }
    };

    let report = match TraceReport::parse(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(%addr, "{e}");
            return None;
        }
    };

    let (region, city) = sites.labels(&report.site);
    Some(ScanRecord {
        address: address.to_string(),
        site: report.site,
        region,
        city,
        tcp_duration,
        timestamp: now_iso_like(),
    })
}

/// One HTTP/1.1 exchange over an established connection. The body ends where
/// its framing says, so a peer keeping the socket open is fine. The connection
/// is torn down when this returns or is dropped.
async fn fetch_trace(stream: TcpStream, addr: SocketAddr) -> Result<String> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let mut driver = JoinSet::new();
    driver.spawn(async move {
        if let Err(e) = conn.await {
            debug!(%addr, "trace connection: {e}");
        }
    });

    let req = Request::get(TRACE_PATH)
        .header(header::HOST, addr.to_string())
        .header(header::USER_AGENT, PROBE_USER_AGENT)
        .header(header::ACCEPT, "*/*")
        .header(header::CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;
    let resp = sender.send_request(req).await?;
    debug!(%addr, status = %resp.status(), "trace response");

    let body = Limited::new(resp.into_body(), MAX_TRACE_BYTES)
        .collect()
        .await
        .map_err(|e| anyhow!("reading trace body: {e}"))?
        .to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
