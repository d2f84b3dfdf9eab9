//! Prometheus metrics for the directory server (RED: Rate, Errors, Duration).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::ldap_protocol::{OperationType, ResultCode};

/// Upper bucket bounds in seconds; +Inf is the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

const OPERATION_COUNT: usize = OperationType::ALL.len();

/// Non-cumulative buckets plus count and sum (microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

fn operation_index(op: OperationType) -> usize {
    OperationType::ALL
        .iter()
        .position(|candidate| *candidate == op)
        .unwrap_or(0)
}

/// Server counters (thread-safe, lock-free apart from the result-code map).
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    /// Connections refused because the server was at its connection limit.
    connections_rejected: AtomicU64,
    /// Messages that could not be decoded; each one ends its connection.
    decode_errors: AtomicU64,
    /// Requests rejected by control admission.
    admission_rejections: AtomicU64,
    requests: [AtomicU64; OPERATION_COUNT],
    errors: [AtomicU64; OPERATION_COUNT],
    durations: [DurationHistogram; OPERATION_COUNT],
    results: DashMap<i32, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_admission_rejection(&self) {
        self.admission_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one completed request. `result_code` is `None` for requests
    /// without a response (abandon, unbind).
    pub fn observe_request(
        &self,
        op: OperationType,
        result_code: Option<ResultCode>,
        duration: Duration,
    ) {
        let i = operation_index(op);
        self.requests[i].fetch_add(1, Ordering::Relaxed);
        self.durations[i].observe(duration);
        if let Some(code) = result_code {
            if !is_success_like(code) {
                self.errors[i].fetch_add(1, Ordering::Relaxed);
            }
            self.results
                .entry(code.0)
                .or_insert_with(AtomicU64::default)
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests(&self, op: OperationType) -> u64 {
        self.requests[operation_index(op)].load(Ordering::Relaxed)
    }

    pub fn errors(&self, op: OperationType) -> u64 {
        self.errors[operation_index(op)].load(Ordering::Relaxed)
    }

    pub fn connections_active(&self) -> i64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    pub fn render(&self, entry_count: usize) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_inmem_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_inmem_connections_total counter\n");
        out.push_str(&format!(
            "ldap_inmem_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_inmem_connections_active Client connections currently open.\n");
        out.push_str("# TYPE ldap_inmem_connections_active gauge\n");
        out.push_str(&format!("ldap_inmem_connections_active {}\n", self.connections_active()));

        out.push_str("# HELP ldap_inmem_connections_rejected_total Connections refused at the connection limit.\n");
        out.push_str("# TYPE ldap_inmem_connections_rejected_total counter\n");
        out.push_str(&format!(
            "ldap_inmem_connections_rejected_total {}\n",
            self.connections_rejected()
        ));

        out.push_str("# HELP ldap_inmem_decode_errors_total Total number of undecodable LDAP messages.\n");
        out.push_str("# TYPE ldap_inmem_decode_errors_total counter\n");
        out.push_str(&format!(
            "ldap_inmem_decode_errors_total {}\n",
            self.decode_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_inmem_admission_rejections_total Requests rejected because of their controls.\n");
        out.push_str("# TYPE ldap_inmem_admission_rejections_total counter\n");
        out.push_str(&format!(
            "ldap_inmem_admission_rejections_total {}\n",
            self.admission_rejections.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_inmem_entries Entries held by the directory.\n");
        out.push_str("# TYPE ldap_inmem_entries gauge\n");
        out.push_str(&format!("ldap_inmem_entries {}\n", entry_count));

        out.push_str("# HELP ldap_inmem_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_inmem_requests_total counter\n");
        for op in OperationType::ALL {
            out.push_str(&format!(
                "ldap_inmem_requests_total{{op=\"{}\"}} {}\n",
                op,
                self.requests(op)
            ));
        }

        out.push_str("# HELP ldap_inmem_errors_total Requests that did not succeed, by operation.\n");
        out.push_str("# TYPE ldap_inmem_errors_total counter\n");
        for op in OperationType::ALL {
            out.push_str(&format!(
                "ldap_inmem_errors_total{{op=\"{}\"}} {}\n",
                op,
                self.errors(op)
            ));
        }

        out.push_str("# HELP ldap_inmem_results_total Responses sent, by result code.\n");
        out.push_str("# TYPE ldap_inmem_results_total counter\n");
        let mut codes: Vec<(i32, u64)> = self
            .results
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        codes.sort_unstable();
        for (code, count) in codes {
            out.push_str(&format!(
                "ldap_inmem_results_total{{code=\"{}\",name=\"{}\"}} {}\n",
                code,
                ResultCode(code).name(),
                count
            ));
        }

        out.push_str("# HELP ldap_inmem_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_inmem_request_duration_seconds histogram\n");
        for op in OperationType::ALL {
            let hist = &self.durations[operation_index(op)];
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_inmem_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_inmem_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_inmem_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_inmem_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// Compare results and noOperation are normal outcomes, not errors.
fn is_success_like(code: ResultCode) -> bool {
    code.is_success()
        || code == ResultCode::COMPARE_TRUE
        || code == ResultCode::COMPARE_FALSE
        || code == ResultCode::NO_OPERATION
}

/// Snapshot served by `/ready` and used for the entry gauge.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub ready: bool,
    pub entries: usize,
    pub listeners: Vec<String>,
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody<'a> {
    #[serde(flatten)]
    status: &'a ServerStatus,
    connections_active: i64,
}

/// Path of the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Serves GET /metrics, GET /health and GET /ready.
/// /ready answers 503 until `status` reports the listeners as bound.
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    status: Arc<dyn Fn() -> ServerStatus + Send + Sync>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let status = Arc::clone(&status);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status_line, body, content_type) = respond(path, &metrics, &status());

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status_line,
                content_type,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

fn respond(
    path: &str,
    metrics: &Metrics,
    status: &ServerStatus,
) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let body = serde_json::to_string(&ReadyBody {
                status,
                connections_active: metrics.connections_active(),
            })
            .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
            let line = if status.ready { "200 OK" } else { "503 Service Unavailable" };
            (line, body, "application/json")
        }
        "/metrics" => (
            "200 OK",
            metrics.render(status.entries),
            "text/plain; charset=utf-8",
        ),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}
