//! Scrape endpoint: `/metrics`, `/` (overview) and `/health`.
//!
//! ```text
//!   poller thread ──spawn──► [prometheus-http] tokio runtime
//!                                 └─ axum::serve(listener)
//!                                      └─ until oneshot shutdown
//! ```

use std::fmt::Write as _;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use regex::Regex;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::cache::Cache;
use crate::errors::{HarvestError, Result};

/// Client address filter from `allow_addrs` / `allow_addrs_regex`.
#[derive(Debug, Clone, Default)]
pub struct AddrFilter {
    addrs: Vec<String>,
    patterns: Vec<Regex>,
}

impl AddrFilter {
    pub fn new(addrs: &[String], patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.trim_matches('`');
                Regex::new(p).map_err(|e| HarvestError::InvalidParam(format!("allow_addrs_regex [{}]: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            addrs: addrs.to_vec(),
            patterns,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.addrs.is_empty() || !self.patterns.is_empty()
    }

    pub fn allows(&self, ip: &str) -> bool {
        !self.is_active() || self.addrs.iter().any(|a| a == ip) || self.patterns.iter().any(|r| r.is_match(ip))
    }
}

pub struct HttpState {
    pub cache: Arc<Mutex<Cache>>,
    pub filter: AddrFilter,
    pub poller: String,
}

type SharedState = Arc<HttpState>;

async fn check_addr(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if state.filter.is_active() {
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        if !ip.as_deref().is_some_and(|ip| state.filter.allows(ip)) {
            debug!(remote = ?ip, path = %req.uri().path(), "denied request");
            return (StatusCode::FORBIDDEN, "403 Forbidden").into_response();
        }
    }
    next.run(req).await
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    let start = Instant::now();
    let (body, count) = {
        let mut cache = state.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.expire(Instant::now());
        cache.write_all()
    };
    debug!(lines = count, duration_us = start.elapsed().as_micros() as u64, "served metrics");
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Escapes text for HTML element content and attribute values.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

async fn handle_overview(State(state): State<SharedState>) -> Html<String> {
    let overview = state
        .cache
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .overview();
    let poller = escape_html(&state.poller);
    // writing into a String cannot fail
    let mut page = String::new();
    let _ = writeln!(page, "<html><head><title>{}</title></head><body>", poller);
    let _ = writeln!(page, "<h1>{}</h1>", poller);
    let _ = writeln!(
        page,
        "<p>{} collectors, {} objects, {} metrics. <a href=\"/metrics\">/metrics</a></p>",
        overview.collectors.len(),
        overview.object_count(),
        overview.metric_count(),
    );
    for (collector, objects) in &overview.collectors {
        let _ = writeln!(page, "<h2>{}</h2>", escape_html(collector));
        for (object, names) in objects {
            let _ = writeln!(page, "<h3>{}</h3>\n<ul>", escape_html(object));
            for name in names {
                let _ = writeln!(page, "  <li><code>{}</code></li>", escape_html(name));
            }
            page.push_str("</ul>\n");
        }
    }
    page.push_str("</body></html>\n");
    Html(page)
}

async fn handle_health() -> &'static str {
    "OK"
}

pub fn router(state: HttpState) -> Router {
    let state = Arc::new(state);
    let filtered = Router::new()
        .route("/", get(handle_overview))
        .route("/metrics", get(handle_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), check_addr));
    Router::new()
        .route("/health", get(handle_health))
        .merge(filtered)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// A running HTTP server thread.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds `addr` on the calling thread, so that bind errors surface
    /// here, then serves `app` from a dedicated runtime thread.
    pub fn start(addr: &str, app: Router) -> Result<Server> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| HarvestError::Config(format!("bind [{}]: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("prometheus-http".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "cannot build HTTP runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(l) => l,
                        Err(e) => {
                            error!(error = %e, "cannot register listener");
                            return;
                        }
                    };
                    let service = app.into_make_service_with_connect_info::<SocketAddr>();
                    let shutdown = async {
                        let _ = rx.await;
                    };
                    if let Err(e) = axum::serve(listener, service).with_graceful_shutdown(shutdown).await {
                        error!(error = %e, "HTTP server error");
                    }
                });
            })?;
        info!(url = %format!("http://{}/metrics", local), "server listening");
        Ok(Server {
            addr: local,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals shutdown and waits for in-flight requests.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("HTTP server thread panicked");
        }
        debug!("HTTP server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
