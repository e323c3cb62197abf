use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use edge_scan_rs::bench::BenchmarkPlan;
use edge_scan_rs::events::EventSink;
use edge_scan_rs::pipeline::{Engine, EngineConfig, DEFAULT_SPEED_URL};
use edge_scan_rs::probe::ProbeConfig;
use edge_scan_rs::subnets::IpFamily;
use edge_scan_rs::types::{BenchmarkRecord, Event, SiteSummary, ThroughputReading};
use edge_scan_rs::{server, sources, speed};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// edge-scan-rs — find reachable CDN edge addresses, rank them by latency and measure throughput.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "Find reachable CDN edge addresses, rank them by latency and measure throughput.",
    long_about = None
)]
struct Cli {
    /// Address the web UI and WebSocket server listen on.
    #[arg(long, default_value = "0.0.0.0:13335")]
    listen: String,

    /// Speed test URL (scheme optional; the target port decides http/https).
    #[arg(long = "speed-url", default_value = DEFAULT_SPEED_URL)]
    speed_url: String,

    /// Directory for cached subnet lists and locations.json.
    #[arg(long = "data-dir", default_value = ".")]
    data_dir: PathBuf,

    /// Directory with the static UI.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Port the scan probe connects to.
    #[arg(long = "scan-port", default_value_t = 80)]
    scan_port: u16,

    /// Run once in the terminal for IP family 4 or 6 instead of serving the UI.
    #[arg(long, value_parser = ["4", "6"])]
    headless: Option<String>,

    /// Max concurrent probes during the scan.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Port used for the latency benchmark and the speed test.
    #[arg(long, default_value_t = 443)]
    port: u16,

    /// Per-trial latency threshold in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 300)]
    timeout_ms: u64,

    /// Max addresses benchmarked (0 = all).
    #[arg(long = "max-addresses", default_value_t = 10)]
    max_addresses: usize,

    /// Site to benchmark. Defaults to the fastest site of the scan.
    #[arg(long)]
    site: Option<String>,

    /// Run a speed test against the best benchmarked address.
    #[arg(long, default_value_t = false)]
    speed: bool,

    /// Advisory minimum speed in MB/s.
    #[arg(long = "min-speed")]
    min_speed: Option<f64>,

    /// Write headless results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct HeadlessReport {
    sites: Vec<SiteSummary>,
    benchmark: Vec<BenchmarkRecord>,
    throughput: Option<ThroughputReading>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    info!(
        listen = %cli.listen,
        data_dir = %cli.data_dir.display(),
        speed_url = %cli.speed_url,
        scan_port = cli.scan_port,
        "edge-scan-rs starting"
    );

    let sites = match sources::load_site_directory(&cli.data_dir).await {
        Ok(dir) => Some(dir),
        Err(e) => {
            warn!("site directory unavailable, scans will fail: {e:#}");
            None
        }
    };

    let config = EngineConfig {
        data_dir: cli.data_dir.clone(),
        speed_url: cli.speed_url.clone(),
        probe: ProbeConfig {
            port: cli.scan_port,
            ..ProbeConfig::default()
        },
    };
    let engine = Engine::new(config, sites);

    if let Some(family) = cli.headless.as_deref() {
        let family = IpFamily::from_selector(family.parse().unwrap_or(4));
        return run_headless(&cli, &engine, family).await;
    }

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        on_ctrl_c.cancel();
    });

    println!("UI server starting at http://{} (Ctrl+C to stop)", cli.listen);
    server::spawn_server(&cli.listen, engine, cli.ui_dir.clone(), shutdown).await
}

async fn run_headless(cli: &Cli, engine: &Engine, family: IpFamily) -> Result<()> {
    let (sink, mut events) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Log { text } => info!("{text}"),
                Event::Error { text } => error!("{text}"),
                Event::ScanProgress(p) | Event::BenchmarkProgress(p) => {
                    info!("progress {}/{}", p.completed, p.total)
                }
                _ => {}
            }
        }
    });

    let token = engine.try_begin()?;
    let sites = engine
        .run_scan(&token, family, cli.concurrency, &sink)
        .await?;
    print_sites_table(&sites);

    let site = cli
        .site
        .clone()
        .or_else(|| sites.first().map(|s| s.site.clone()));
    let plan = BenchmarkPlan {
        site,
        port: cli.port,
        timeout: Duration::from_millis(cli.timeout_ms),
        max_addresses: cli.max_addresses,
    };
    let benchmark = engine.run_benchmark(&token, &plan, &sink).await?;
    print_benchmark_table(&benchmark);

    let throughput = match benchmark.first() {
        Some(best) if cli.speed => {
            let reading =
                speed::run_throughput(&best.address, cli.port, &cli.speed_url, cli.min_speed, &sink)
                    .await;
            println!("\nSpeed of {}: {}", reading.address, reading.speed);
            Some(reading)
        }
        _ => None,
    };
    drop(token);
    drop(sink);
    let _ = printer.await;

    if let Some(path) = cli.output.as_deref() {
        let report = HeadlessReport {
            sites,
            benchmark,
            throughput,
        };
        write_report_json(path, &report)?;
        println!("Wrote JSON results to {}", path.display());
    }
    Ok(())
}

fn print_sites_table(sites: &[SiteSummary]) {
    let site_w = sites.iter().map(|s| s.site.len()).max().unwrap_or(0).max("site".len());
    let region_w = sites.iter().map(|s| s.region.len()).max().unwrap_or(0).max("region".len());
    let city_w = sites.iter().map(|s| s.city.len()).max().unwrap_or(0).max("city".len());
    let count_w = "addresses".len();
    let lat_w = "min_ms".len().max(6);

    println!("\nSites found: {}", sites.len());
    println!(
        "{:<site_w$}  {:<region_w$}  {:<city_w$}  {:>count_w$}  {:>lat_w$}",
        "site", "region", "city", "addresses", "min_ms",
    );
    println!(
        "{:-<site_w$}  {:-<region_w$}  {:-<city_w$}  {:-<count_w$}  {:-<lat_w$}",
        "", "", "", "", "",
    );
    for s in sites {
        println!(
            "{:<site_w$}  {:<region_w$}  {:<city_w$}  {:>count_w$}  {:>lat_w$}",
            s.site, s.region, s.city, s.address_count, s.min_latency_ms,
        );
    }
}

fn print_benchmark_table(records: &[BenchmarkRecord]) {
    let ip_w = records.iter().map(|r| r.address.len()).max().unwrap_or(0).max("ip".len());
    let col_w = 8usize;
    let ms = |d: Duration| format!("{:.1}", d.as_secs_f64() * 1000.0);

    println!("\nBenchmarked addresses: {}", records.len());
    println!(
        "{:<ip_w$}  {:>col_w$}  {:>col_w$}  {:>col_w$}  {:>col_w$}",
        "ip", "loss", "min_ms", "max_ms", "avg_ms",
    );
    println!(
        "{:-<ip_w$}  {:-<col_w$}  {:-<col_w$}  {:-<col_w$}  {:-<col_w$}",
        "", "", "", "", "",
    );
    for r in records {
        println!(
            "{:<ip_w$}  {:>col_w$}  {:>col_w$}  {:>col_w$}  {:>col_w$}",
            r.address,
            format!("{:.0}%", r.loss_rate * 100.0),
            ms(r.min_latency),
            ms(r.max_latency),
            ms(r.avg_latency),
        );
    }
}

fn write_report_json(path: &Path, report: &HeadlessReport) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
