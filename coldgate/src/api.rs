use crate::manager::TableView;
use crate::state::{AgentStats, SessionState, TargetCache};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub view: Arc<dyn TableView>,
    pub cache: Arc<TargetCache>,
    pub stats: Arc<AgentStats>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    captures: Counter,
    capture_requests_dropped: Counter,
    hellos_sent: Counter,
    hello_mismatches: Counter,
    target_updates_applied: Counter,
    target_update_failures: Counter,
    unknown_messages: Counter,
    cold_targets: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Self {
            registry: Registry::default(),
            captures: Counter::default(),
            capture_requests_dropped: Counter::default(),
            hellos_sent: Counter::default(),
            hello_mismatches: Counter::default(),
            target_updates_applied: Counter::default(),
            target_update_failures: Counter::default(),
            unknown_messages: Counter::default(),
            cold_targets: Gauge::default(),
        };

        registry.register(
            "coldgate_captures",
            "SYN packets intercepted by the XDP program",
            metrics.captures.clone(),
        );
        registry.register(
            "coldgate_capture_requests_dropped",
            "Capture requests that never reached the coordinator",
            metrics.capture_requests_dropped.clone(),
        );
        registry.register(
            "coldgate_hellos_sent",
            "Hello messages sent to the coordinator",
            metrics.hellos_sent.clone(),
        );
        registry.register(
            "coldgate_hello_mismatches",
            "Hellos whose cold count disagreed with ours",
            metrics.hello_mismatches.clone(),
        );
        registry.register(
            "coldgate_target_updates_applied",
            "Target updates written to the kernel table",
            metrics.target_updates_applied.clone(),
        );
        registry.register(
            "coldgate_target_update_failures",
            "Target updates the kernel table rejected",
            metrics.target_update_failures.clone(),
        );
        registry.register(
            "coldgate_unknown_messages",
            "Datagrams ignored because of an unknown or unexpected tag",
            metrics.unknown_messages.clone(),
        );
        registry.register(
            "coldgate_cold_targets",
            "Destinations currently scaled to zero",
            metrics.cold_targets.clone(),
        );

        Self {
            registry,
            ..metrics
        }
    }

    /// Counters are monotonic, so advance by the delta.
    fn sync(counter: &Counter, source: &AtomicU64) {
        let total = source.load(Ordering::Relaxed);
        let current = counter.get();
        if total > current {
            counter.inc_by(total - current);
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    filter_ready: bool,
    session: SessionState,
    cold_count: u16,
    uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct TargetRow {
    address: Ipv4Addr,
    port: u16,
    replicas: u16,
    updated_at: chrono::DateTime<chrono::Utc>,
    /// Whether the kernel table currently redirects this destination.
    intercepting: bool,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/targets", get(get_targets))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(_) => {
                        tracing::warn!("Ignoring invalid allowlist entry {}", s);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // No ConnectInfo only happens when served without into_make_service_with_connect_info.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let filter_ready = state.view.is_ready();
    let session = state.stats.session_state();
    let status = if filter_ready && session == SessionState::Connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        filter_ready,
        session,
        cold_count: state.cache.cold_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_targets(State(state): State<Arc<AppState>>) -> Json<Vec<TargetRow>> {
    let rows = state
        .cache
        .snapshot()
        .into_iter()
        .map(|entry| {
            let installed = state.view.lookup_target(u32::from(entry.address));
            TargetRow {
                intercepting: matches!(installed, Ok(Some(port)) if port == entry.port),
                address: entry.address,
                port: entry.port,
                replicas: entry.replicas,
                updated_at: entry.updated_at,
            }
        })
        .collect();
    Json(rows)
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    let stats = &state.stats;
    Metrics::sync(&metrics.captures, &stats.captures_total);
    Metrics::sync(&metrics.capture_requests_dropped, &stats.capture_requests_dropped);
    Metrics::sync(&metrics.hellos_sent, &stats.hellos_sent);
    Metrics::sync(&metrics.hello_mismatches, &stats.hello_mismatches);
    Metrics::sync(&metrics.target_updates_applied, &stats.target_updates_applied);
    Metrics::sync(&metrics.target_update_failures, &stats.target_update_failures);
    Metrics::sync(&metrics.unknown_messages, &stats.unknown_messages);
    metrics.cold_targets.set(i64::from(state.cache.cold_count()));

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("Encoding metrics failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
