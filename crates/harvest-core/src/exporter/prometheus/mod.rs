//! Pull-mode sink: matrices are rendered on export into a cache that the
//! HTTP server serves on scrape.

mod cache;
mod http;
mod render;

pub use cache::{Cache, DEFAULT_MAX_KEEP, cache_key};
pub use http::{AddrFilter, HttpState, Server, router};
pub use render::{escape_label_value, render};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{Exporter, ExporterBase, ExporterOptions};
use crate::conf;
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::util::parse_duration;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0";

pub struct Prometheus {
    base: ExporterBase,
    cache: Arc<Mutex<Cache>>,
    add_meta_tags: bool,
    bind: String,
    filter: AddrFilter,
    poller: String,
    server: Mutex<Option<Server>>,
}

impl Prometheus {
    pub fn new(name: &str, params: &conf::Exporter, options: &ExporterOptions) -> Result<Self> {
        let port = options
            .prom_port
            .or(params.port)
            .ok_or_else(|| HarvestError::MissingParam(format!("exporter [{}]: port", name)))?;
        let max_keep = max_keep(params)?;
        let allow = params.allow_addrs.clone().unwrap_or_default();
        let allow_regex = params.allow_addrs_regex.clone().unwrap_or_default();
        if params.allow_addrs.as_ref().is_some_and(Vec::is_empty) {
            return Err(HarvestError::InvalidParam("allow_addrs without any".into()));
        }
        let filter = AddrFilter::new(&allow, &allow_regex)?;
        let host = params.local_http_addr.as_deref().unwrap_or(DEFAULT_HTTP_ADDR);
        debug!(port, max_keep_s = max_keep.as_secs(), filter = filter.is_active(), "prometheus exporter");
        Ok(Self {
            base: ExporterBase::new(name, "Prometheus"),
            cache: Arc::new(Mutex::new(Cache::new(max_keep))),
            add_meta_tags: params.add_meta_tags.unwrap_or(false),
            bind: format!("{}:{}", host, port),
            filter,
            poller: options.poller.clone(),
            server: Mutex::new(None),
        })
    }

    /// Address the server binds to, `host:port`.
    pub fn bind_addr(&self) -> &str {
        &self.bind
    }

    /// Current exposition text, as `/metrics` would serve it.
    pub fn scrape(&self) -> String {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.expire(Instant::now());
        cache.write_all().0
    }

    fn http_state(&self) -> HttpState {
        HttpState {
            cache: self.cache.clone(),
            filter: self.filter.clone(),
            poller: self.poller.clone(),
        }
    }
}

impl Exporter for Prometheus {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    fn export(&self, data: &Matrix) -> Result<()> {
        let start = Instant::now();
        let lines = render(data, self.add_meta_tags);
        let count = lines.iter().filter(|l| !l.starts_with('#')).count();
        let key = cache_key(data);
        trace!(key = %key, lines = lines.len(), "caching");
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, data, lines, Instant::now());
        self.base.add_exported(count as u64);
        debug!(
            object = %data.object,
            points = count,
            render_us = start.elapsed().as_micros() as u64,
            "exported"
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
        if server.is_none() {
            *server = Some(Server::start(&self.bind, router(self.http_state()))?);
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(mut server) = self.server.lock().unwrap_or_else(PoisonError::into_inner).take() {
            server.stop();
        }
    }
}

/// How long cached lines survive without a fresh export.
pub fn max_keep(params: &conf::Exporter) -> Result<Duration> {
    params
        .cache_max_keep
        .as_deref()
        .map(parse_duration)
        .unwrap_or(Ok(DEFAULT_MAX_KEEP))
}
