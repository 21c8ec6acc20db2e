//! Push-mode sink speaking the Graphite plaintext protocol.
//!
//! One line per sample: `harvest.cluster.c1.volume.v1.size 1024 1700000000`.
//! Connections are pooled; a connection that fails a write is dropped and
//! the batch is retried once on a fresh one.

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Exporter, ExporterBase};
use crate::conf;
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::util::parse_duration;

const DEFAULT_PORT: u16 = 2003;
const DEFAULT_NAMESPACE: &str = "harvest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Path segments may not contain dots or spaces.
fn segment(s: &str) -> String {
    s.chars()
        .map(|c| if c == '.' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Plaintext lines of every exportable instance.
pub fn render(data: &Matrix, namespace: &str, timestamp: i64) -> Vec<String> {
    let mut prefix = vec![segment(namespace)];
    let cluster = data.global_labels.value("cluster");
    if !cluster.is_empty() {
        prefix.push("cluster".into());
        prefix.push(segment(cluster));
    }
    prefix.push(segment(&data.object));

    let mut out = Vec::new();
    for (_, instance) in data.instances() {
        if !instance.exportable {
            continue;
        }
        let mut path = prefix.clone();
        for key in &data.export_options.instance_keys {
            let v = instance.label(key);
            if !v.is_empty() && key != "cluster" {
                path.push(segment(v));
            }
        }
        let path = path.join(".");
        let col = instance.index();
        for (_, metric) in data.metrics() {
            if !metric.exportable || !metric.enabled {
                continue;
            }
            for (offset, row) in metric.rows().enumerate() {
                let Some(value) = data.value_at(row, col) else {
                    continue;
                };
                let mut name = segment(&metric.name);
                if let Some((first, second)) = metric.element_labels(offset) {
                    name.push('.');
                    name.push_str(&segment(first));
                    if let Some(second) = second {
                        name.push('.');
                        name.push_str(&segment(second));
                    }
                }
                out.push(format!("{}.{} {} {}", path, name, value, timestamp));
            }
        }
    }
    out
}

pub struct Graphite {
    base: ExporterBase,
    addr: SocketAddr,
    namespace: String,
    timeout: Duration,
    pool: Mutex<Vec<TcpStream>>,
}

impl Graphite {
    pub fn new(name: &str, params: &conf::Exporter) -> Result<Self> {
        let host = params
            .addr
            .as_deref()
            .ok_or_else(|| HarvestError::MissingParam(format!("exporter [{}]: addr", name)))?;
        let port = params.port.unwrap_or(DEFAULT_PORT);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| HarvestError::InvalidParam(format!("exporter [{}]: addr [{}]: {}", name, host, e)))?
            .next()
            .ok_or_else(|| HarvestError::InvalidParam(format!("exporter [{}]: addr [{}] does not resolve", name, host)))?;
        let timeout = match &params.timeout {
            Some(t) => parse_duration(t)?,
            None => DEFAULT_TIMEOUT,
        };
        let namespace = params.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.into());
        debug!(%addr, namespace = %namespace, "graphite exporter");
        Ok(Self {
            base: ExporterBase::new(name, "Graphite"),
            addr,
            namespace,
            timeout,
            pool: Mutex::new(Vec::new()),
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| HarvestError::Export(format!("connect {}: {}", self.addr, e)))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn checkout(&self) -> Result<TcpStream> {
        let pooled = self.pool.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match pooled {
            Some(s) => Ok(s),
            None => self.connect(),
        }
    }

    fn checkin(&self, stream: TcpStream) {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).push(stream);
    }

    fn send(&self, payload: &[u8]) -> Result<()> {
        let mut stream = self.checkout()?;
        if let Err(e) = stream.write_all(payload).and_then(|_| stream.flush()) {
            warn!(error = %e, "write failed, reconnecting");
            stream = self.connect()?;
            stream
                .write_all(payload)
                .and_then(|_| stream.flush())
                .map_err(|e| HarvestError::Export(format!("write {}: {}", self.addr, e)))?;
        }
        self.checkin(stream);
        Ok(())
    }
}

impl Exporter for Graphite {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    fn export(&self, data: &Matrix) -> Result<()> {
        let lines = render(data, &self.namespace, chrono::Utc::now().timestamp());
        if lines.is_empty() {
            return Ok(());
        }
        let mut payload = lines.join("\n");
        payload.push('\n');
        self.send(payload.as_bytes())?;
        self.base.add_exported(lines.len() as u64);
        debug!(object = %data.object, points = lines.len(), "exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::ExportOptions;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn volume() -> Matrix {
        let mut m = Matrix::new("Zapi", "volume", "");
        m.set_global_label("cluster", "c1");
        m.export_options = ExportOptions {
            instance_keys: vec!["svm".into(), "volume".into()],
            ..Default::default()
        };
        m.add_metric("size", "size").unwrap();
        let i = m.add_instance("v1").unwrap();
        i.labels.set("svm", "svm.a");
        i.labels.set("volume", "v1");
        m.init_data().unwrap();
        m.set_value("size", "v1", 1024.0).unwrap();
        m
    }

    #[test]
    fn plaintext_path() {
        assert_eq!(
            render(&volume(), "harvest", 1_700_000_000),
            vec!["harvest.cluster.c1.volume.svm_a.v1.size 1024 1700000000"]
        );
    }

    #[test]
    fn sends_lines_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).unwrap();
            line
        });
        let params = conf::Exporter {
            exporter: "Graphite".into(),
            addr: Some("127.0.0.1".into()),
            port: Some(port),
            namespace: Some("ns".into()),
            ..Default::default()
        };
        let g = Graphite::new("g", &params).unwrap();
        g.export_tracked(&volume()).unwrap();
        let line = reader.join().unwrap();
        assert!(line.starts_with("ns.cluster.c1.volume.svm_a.v1.size 1024 "));
        assert_eq!(g.base().take_exported(), 1);
    }

    #[test]
    fn addr_is_required() {
        let params = conf::Exporter {
            exporter: "Graphite".into(),
            ..Default::default()
        };
        assert!(Graphite::new("g", &params).is_err());
    }
}
