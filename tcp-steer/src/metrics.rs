//! HTTP metrics and health endpoints.
//!
//! Serves `/healthz` for liveness probes and `/metrics` in Prometheus text
//! format, reporting the five defined stat counters for whichever data path
//! is running (XDP per-CPU sums, userspace shard sums).

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::MetricsConfig;
use crate::engine::SteerStats;
use crate::stats::StatsSnapshot;
use crate::xdp_manager::XdpManager;

/// Shared handles the metrics server reads from.
#[derive(Clone)]
pub struct MetricsState {
    /// Present in XDP mode; stats come from the per-CPU map.
    pub xdp_manager: Arc<Mutex<Option<XdpManager>>>,
    /// Present in userspace mode; stats come from the worker shards.
    pub userspace_stats: Arc<Vec<Arc<SteerStats>>>,
}

impl MetricsState {
    /// Snapshot every running data path as (path-label, counters).
    pub async fn collect(&self) -> Vec<(&'static str, StatsSnapshot)> {
        let mut snapshots = Vec::new();

        if let Some(mgr) = self.xdp_manager.lock().await.as_ref() {
            match mgr.read_stats() {
                Ok(snap) => snapshots.push(("xdp", snap)),
                Err(e) => warn!(error = %e, "reading XDP stats failed"),
            }
        }

        if !self.userspace_stats.is_empty() {
            snapshots.push(("userspace", StatsSnapshot::from_shards(&self.userspace_stats)));
        }

        snapshots
    }
}

/// Render counters in Prometheus text exposition format.
fn render_metrics(snapshots: &[(&str, StatsSnapshot)]) -> String {
    let mut out = String::new();
    out.push_str("# HELP tcp_steer_packets_total Packets seen by the steering core.\n");
    out.push_str("# TYPE tcp_steer_packets_total counter\n");

    for (path, snap) in snapshots {
        let counters = [
            ("processed", snap.processed),
            ("redirected", snap.redirected),
            ("dropped", snap.dropped),
            ("passed", snap.passed),
            ("aborted", snap.aborted),
        ];
        for (outcome, value) in counters {
            out.push_str(&format!(
                "tcp_steer_packets_total{{path=\"{}\",outcome=\"{}\"}} {}\n",
                path, outcome, value
            ));
        }
    }

    out
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: MetricsState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .unwrap(),
        "/metrics" => {
            let snapshots = state.collect().await;
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(render_metrics(&snapshots))))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Serve metrics until the task is aborted.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(bind = %config.bind, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::atomic::Ordering;

    fn test_state(shards: Vec<Arc<SteerStats>>) -> MetricsState {
        MetricsState {
            xdp_manager: Arc::new(Mutex::new(None)),
            userspace_stats: Arc::new(shards),
        }
    }

    #[test]
    fn render_includes_every_defined_counter() {
        let snap = StatsSnapshot {
            processed: 10,
            redirected: 4,
            dropped: 0,
            passed: 5,
            aborted: 1,
        };
        let text = render_metrics(&[("xdp", snap)]);

        assert!(text.contains("outcome=\"processed\"} 10"));
        assert!(text.contains("outcome=\"redirected\"} 4"));
        assert!(text.contains("outcome=\"dropped\"} 0"));
        assert!(text.contains("outcome=\"passed\"} 5"));
        assert!(text.contains("outcome=\"aborted\"} 1"));
        assert!(text.starts_with("# HELP"));
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_shard_sums() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let shard = Arc::new(SteerStats::default());
        shard.processed.store(3, Ordering::Relaxed);
        shard.redirected.store(2, Ordering::Relaxed);
        shard.passed.store(1, Ordering::Relaxed);
        let state = test_state(vec![shard]);

        let config = MetricsConfig {
            enabled: true,
            bind: addr,
        };
        let handle = tokio::spawn(async move {
            let _ = serve_metrics(&config, state).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, body) = http_get(&format!("{}", addr), "/metrics").await;
        assert_eq!(status, 200);
        assert!(body.contains("path=\"userspace\",outcome=\"processed\"} 3"));
        assert!(body.contains("path=\"userspace\",outcome=\"redirected\"} 2"));

        handle.abort();
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = test_state(Vec::new());
        let config = MetricsConfig {
            enabled: true,
            bind: addr,
        };
        let handle = tokio::spawn(async move {
            let _ = serve_metrics(&config, state).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, body) = http_get(&format!("{}", addr), "/healthz").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");

        handle.abort();
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let state = test_state(Vec::new());
        let config = MetricsConfig {
            enabled: true,
            bind: addr,
        };
        let handle = tokio::spawn(async move {
            let _ = serve_metrics(&config, state).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, _) = http_get(&format!("{}", addr), "/nope").await;
        assert_eq!(status, 404);

        handle.abort();
    }

    /// Minimal HTTP GET over a raw TCP stream.
    async fn http_get(addr: &str, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status_line = response.lines().next().unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("").to_string();

        (status, body)
    }
}
