use std::time::Duration;

use edge_scan_rs::bench::BenchmarkPlan;
use edge_scan_rs::error::PipelineError;
use edge_scan_rs::events::EventSink;
use edge_scan_rs::pipeline::{Engine, EngineConfig};
use edge_scan_rs::probe::ProbeConfig;
use edge_scan_rs::scanner;
use edge_scan_rs::sources::{SiteDirectory, SiteIdentity};
use edge_scan_rs::subnets::IpFamily;
use edge_scan_rs::types::{Command, Event, ScanRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

const TRACE_BODY: &str = "fl=7f\nh=edge\nip=127.0.0.1\nuag=Mozilla/5.0\ncolo=NRT\nloc=JP\n";

/// Minimal trace server reachable on every 127.0.0.0/8 address.
async fn spawn_trace_server() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut req = [0u8; 1024];
                match sock.read(&mut req).await {
                    Ok(n) if n > 0 => {}
                    _ => return,
                }
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    TRACE_BODY.len(),
                    TRACE_BODY
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            });
        }
    });
    port
}

fn tokyo() -> SiteDirectory {
    SiteDirectory::from_sites([SiteIdentity {
        iata: "NRT".into(),
        cca2: "JP".into(),
        region: "Asia Pacific".into(),
        city: "Tokyo".into(),
        ..Default::default()
    }])
}

async fn drain(mut rx: UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(ev) = rx.recv().await {
        out.push(ev);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_then_benchmark_against_local_edge() {
    let port = spawn_trace_server().await;
    let data = tempfile::tempdir().unwrap();
    tokio::fs::write(
        data.path().join(IpFamily::V4.cache_name()),
        "127.0.0.0/24\n127.0.1.0/24\n\nnot-a-subnet\n127.0.2.0/24\n",
    )
    .await
    .unwrap();

    let engine = Engine::new(
        EngineConfig {
            data_dir: data.path().to_path_buf(),
            probe: ProbeConfig {
                port,
                ..ProbeConfig::default()
            },
            ..EngineConfig::default()
        },
        Some(tokyo()),
    );

    let (sink, rx) = EventSink::channel();
    engine
        .start_scan(IpFamily::V4, 2, sink)
        .unwrap()
        .await
        .unwrap();
    let events = drain(rx).await;

    let sites = events
        .iter()
        .find_map(|e| match e {
            Event::ScanComplete { sites } => Some(sites.clone()),
            _ => None,
        })
        .expect("scan_complete emitted");
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].site, "NRT");
    assert_eq!(sites[0].city, "Tokyo");
    assert_eq!(sites[0].address_count, 3);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ScanProgress(p) if p.completed == 3 && p.total == 3
    )));

    let records = engine.scan_records().await;
    assert_eq!(records.len(), 3);
    assert!(records
        .windows(2)
        .all(|w| w[0].tcp_duration <= w[1].tcp_duration));
    assert!(!engine.is_running());

    let (sink, rx) = EventSink::channel();
    engine
        .start_benchmark(
            BenchmarkPlan {
                site: Some("NRT".into()),
                port,
                timeout: Duration::from_millis(1000),
                max_addresses: 2,
            },
            sink,
        )
        .unwrap()
        .await
        .unwrap();
    let events = drain(rx).await;

    let streamed = events
        .iter()
        .filter(|e| matches!(e, Event::BenchmarkResult { .. }))
        .count();
    let ranked = events
        .iter()
        .find_map(|e| match e {
            Event::BenchmarkComplete { records } => Some(records.clone()),
            _ => None,
        })
        .expect("benchmark_complete emitted");
    assert_eq!(streamed, 2);
    assert_eq!(ranked.len(), 2);
    for r in &ranked {
        assert_eq!(r.loss_rate, 0.0);
        assert!(r.min_latency <= r.avg_latency && r.avg_latency <= r.max_latency);
    }
}

#[tokio::test]
async fn empty_subnet_list_reports_empty_result() {
    let data = tempfile::tempdir().unwrap();
    tokio::fs::write(data.path().join(IpFamily::V4.cache_name()), "\n\n")
        .await
        .unwrap();
    let engine = Engine::new(
        EngineConfig {
            data_dir: data.path().to_path_buf(),
            ..EngineConfig::default()
        },
        Some(tokyo()),
    );
    let (sink, rx) = EventSink::channel();
    engine
        .start_scan(IpFamily::V4, 10, sink)
        .unwrap()
        .await
        .unwrap();
    let events = drain(rx).await;
    assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ScanComplete { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_start_while_running_is_rejected() {
    let engine = Engine::new(EngineConfig::default(), Some(tokyo()));
    let (sink, rx) = EventSink::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let job_sink = sink.clone();
    let handle = engine
        .spawn_pipeline(move || async move {
            let _ = release_rx.await;
            let candidates: Vec<String> = (1..=4).map(|i| format!("192.0.2.{i}")).collect();
            let mut records = scanner::scan_candidates(candidates, 2, &job_sink, |ip: String| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Some(ScanRecord {
                    address: ip,
                    site: "NRT".into(),
                    region: String::new(),
                    city: String::new(),
                    tcp_duration: Duration::from_millis(20),
                    timestamp: String::new(),
                })
            })
            .await;
            let _ = scanner::finish_scan(&mut records, &job_sink);
        })
        .unwrap();

    assert!(engine.is_running());
    assert_eq!(
        engine.start_scan(IpFamily::V4, 10, sink.clone()).unwrap_err(),
        PipelineError::Busy
    );
    assert!(engine
        .dispatch(
            Command::StartThroughput {
                address: "192.0.2.1".into(),
                port: 80,
                url: None,
                min_speed: None,
            },
            sink.clone(),
        )
        .is_none());

    release_tx.send(()).unwrap();
    handle.await.unwrap();
    drop(sink);
    assert!(!engine.is_running());

    let events = drain(rx).await;
    let busy = events
        .iter()
        .filter(|e| matches!(e, Event::Error { text } if text.contains("already running")))
        .count();
    assert_eq!(busy, 1);
    let sites = events
        .iter()
        .find_map(|e| match e {
            Event::ScanComplete { sites } => Some(sites.clone()),
            _ => None,
        })
        .expect("running pipeline completed");
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].address_count, 4);
    assert_eq!(sites[0].min_latency_ms, 20);

    assert!(engine.try_begin().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_scan_discards_previous_records() {
    let port = spawn_trace_server().await;
    let data = tempfile::tempdir().unwrap();
    let list = data.path().join(IpFamily::V4.cache_name());
    tokio::fs::write(&list, "127.0.3.0/24\n127.0.4.0/24\n")
        .await
        .unwrap();
    let engine = Engine::new(
        EngineConfig {
            data_dir: data.path().to_path_buf(),
            probe: ProbeConfig {
                port,
                ..ProbeConfig::default()
            },
            ..EngineConfig::default()
        },
        Some(tokyo()),
    );

    let (sink, rx) = EventSink::channel();
    engine.start_scan(IpFamily::V4, 4, sink).unwrap().await.unwrap();
    drain(rx).await;
    assert_eq!(engine.scan_records().await.len(), 2);

    tokio::fs::write(&list, "\n").await.unwrap();
    let (sink, rx) = EventSink::channel();
    engine.start_scan(IpFamily::V4, 4, sink).unwrap().await.unwrap();
    let events = drain(rx).await;
    assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
    assert!(engine.scan_records().await.is_empty());
}
