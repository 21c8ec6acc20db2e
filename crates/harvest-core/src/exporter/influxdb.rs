//! Push-mode sink writing InfluxDB line protocol over the v2 HTTP API.
//!
//! ```text
//!   volume,cluster=c1,volume=v1 state="online",size=1024 1700000000
//! ```

use std::time::Duration;

use tracing::{debug, trace};

use super::{Exporter, ExporterBase, instance_keys};
use crate::conf;
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::util::parse_duration;

const DEFAULT_PORT: u16 = 8086;
const DEFAULT_VERSION: &str = "2";
const DEFAULT_PRECISION: &str = "s";
const DEFAULT_SCHEME: &str = "https";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Field names InfluxDB reserves or that clash with tags.
const RENAMED_FIELDS: [(&str, &str); 5] = [
    ("status", "status_code"),
    ("new_status", "new_status_code"),
    ("time", "harvest_time"),
    ("_measurement", "harvest_measurement"),
    ("_field", "harvest_field"),
];

/// Backslash-escapes comma, equals, space, backslash and newline (as `\n`).
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`].
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn field_name(name: &str) -> &str {
    RENAMED_FIELDS
        .iter()
        .find(|(from, _)| *from == name)
        .map(|(_, to)| *to)
        .unwrap_or(name)
}

/// One line per exportable instance that has at least one field.
pub fn render(data: &Matrix, timestamp: Option<i64>) -> Vec<String> {
    let mut out = Vec::new();
    let mut label_keys: Vec<&str> = data.export_options.instance_labels.iter().map(String::as_str).collect();
    for (key, instance) in data.instances() {
        if !instance.exportable {
            continue;
        }
        let tags = instance_keys(data, &instance.labels);
        if data.export_options.include_all_labels {
            label_keys = instance.labels.keys().filter(|k| !tags.iter().any(|(t, _)| t == k)).collect();
        }

        let mut fields: Vec<String> = Vec::new();
        for label in &label_keys {
            let value = instance.label(label);
            if value.is_empty() {
                continue;
            }
            let rendered = if value == "true" || value == "false" {
                value.to_string()
            } else {
                quote(value)
            };
            fields.push(format!("{}={}", escape(field_name(label)), rendered));
        }
        let col = instance.index();
        for (_, metric) in data.metrics() {
            if !metric.exportable || !metric.enabled {
                continue;
            }
            for (offset, row) in metric.rows().enumerate() {
                // line protocol has no representation for infinities
                let Some(value) = data.value_at(row, col).filter(|v| v.is_finite()) else {
                    continue;
                };
                let name = match metric.element_labels(offset) {
                    None => metric.name.clone(),
                    Some((first, None)) => format!("{}_{}", metric.name, first),
                    Some((first, Some(second))) => format!("{}_{}_{}", metric.name, first, second),
                };
                fields.push(format!("{}={}", escape(field_name(&name)), value));
            }
        }
        if fields.is_empty() {
            trace!(instance = key, "no fields, skipped");
            continue;
        }

        let mut line = escape(&data.object);
        for (k, v) in &tags {
            line.push(',');
            line.push_str(&escape(k));
            line.push('=');
            line.push_str(&escape(v));
        }
        line.push(' ');
        line.push_str(&fields.join(","));
        if let Some(ts) = timestamp {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        out.push(line);
    }
    out
}

/// Write endpoint from `url`, or from `scheme`, `addr`, `port`, `version`,
/// `org`, `bucket` and `precision`.
pub fn write_url(name: &str, params: &conf::Exporter) -> Result<String> {
    if let Some(url) = &params.url {
        return Ok(url.clone());
    }
    let missing = |p: &str| HarvestError::MissingParam(format!("exporter [{}]: {}", name, p));
    let addr = params.addr.as_deref().ok_or_else(|| missing("url or addr"))?;
    let bucket = params.bucket.as_deref().ok_or_else(|| missing("bucket"))?;
    let org = params.org.as_deref().ok_or_else(|| missing("org"))?;
    let port = params.port.unwrap_or(DEFAULT_PORT);
    let version = params.version.as_deref().unwrap_or(DEFAULT_VERSION);
    let precision = params.precision.as_deref().unwrap_or(DEFAULT_PRECISION);
    let scheme = params.scheme.as_deref().unwrap_or(DEFAULT_SCHEME);
    if scheme != "http" && scheme != "https" {
        return Err(HarvestError::InvalidParam(format!(
            "exporter [{}]: scheme [{}], expected http or https",
            name, scheme
        )));
    }
    let mut url = reqwest::Url::parse(&format!("{}://{}:{}/api/v{}/write", scheme, addr, port, version))
        .map_err(|e| HarvestError::InvalidParam(format!("exporter [{}]: addr: {}", name, e)))?;
    url.query_pairs_mut()
        .append_pair("org", org)
        .append_pair("bucket", bucket)
        .append_pair("precision", precision);
    Ok(url.to_string())
}

pub struct InfluxDb {
    base: ExporterBase,
    client: reqwest::blocking::Client,
    url: String,
    token: String,
}

impl InfluxDb {
    pub fn new(name: &str, params: &conf::Exporter) -> Result<Self> {
        let url = write_url(name, params)?;
        let token = params
            .token
            .clone()
            .ok_or_else(|| HarvestError::MissingParam(format!("exporter [{}]: token", name)))?;
        let timeout = match &params.timeout {
            Some(t) => parse_duration(t)?,
            None => DEFAULT_TIMEOUT,
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Export(format!("http client: {}", e)))?;
        debug!(url = %url, timeout_s = timeout.as_secs(), "influxdb exporter");
        Ok(Self {
            base: ExporterBase::new(name, "InfluxDB"),
            client,
            url,
            token,
        })
    }

    fn emit(&self, lines: &[String]) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .body(lines.join("\n"))
            .send()
            .map_err(|e| HarvestError::Export(format!("POST: {}", e)))?;
        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().unwrap_or_default();
            return Err(HarvestError::Export(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }
        Ok(())
    }
}

impl Exporter for InfluxDb {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    fn export(&self, data: &Matrix) -> Result<()> {
        let lines = render(data, Some(chrono::Utc::now().timestamp()));
        if lines.is_empty() {
            return Ok(());
        }
        self.emit(&lines)?;
        self.base.add_exported(lines.len() as u64);
        debug!(object = %data.object, measurements = lines.len(), "exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::ExportOptions;

    fn volume() -> Matrix {
        let mut m = Matrix::new("Zapi", "volume", "");
        m.set_global_label("cluster", "c 1");
        m.export_options = ExportOptions {
            instance_keys: vec!["volume".into()],
            instance_labels: vec!["state".into(), "is_root".into()],
            include_all_labels: false,
        };
        m.add_metric("size", "size").unwrap();
        m.add_metric("status", "status").unwrap();
        let i = m.add_instance("v1").unwrap();
        i.labels.set("volume", "v1");
        i.labels.set("state", "on\"line");
        i.labels.set("is_root", "false");
        m.init_data().unwrap();
        m.set_value("size", "v1", 1024.0).unwrap();
        m.set_value("status", "v1", 1.0).unwrap();
        m
    }

    #[test]
    fn measurement_line() {
        assert_eq!(
            render(&volume(), Some(1_700_000_000)),
            vec![r#"volume,cluster=c\ 1,volume=v1 state="on\"line",is_root=false,size=1024,status_code=1 1700000000"#]
        );
    }

    #[test]
    fn array_fields_and_no_fields() {
        let mut m = volume();
        m.add_array_metric("ops", "ops", vec!["read".into(), "write".into()], Vec::new())
            .unwrap();
        m.init_data().unwrap();
        m.set_array_values("ops", "v1", &[3.0, f64::NAN]).unwrap();
        m.export_options.instance_labels.clear();
        assert_eq!(render(&m, None), vec!["volume,cluster=c\\ 1,volume=v1 ops_read=3"]);
    }

    #[test]
    fn infinite_values_are_skipped() {
        let mut m = volume();
        m.set_value("size", "v1", f64::INFINITY).unwrap();
        m.set_value("status", "v1", f64::NEG_INFINITY).unwrap();
        m.export_options.instance_labels.clear();
        assert!(render(&m, None).is_empty());

        m.set_value("size", "v1", 2048.0).unwrap();
        assert_eq!(render(&m, None), vec!["volume,cluster=c\\ 1,volume=v1 size=2048"]);
    }

    #[test]
    fn escape_round_trip() {
        let printable: String = (0x20u8..0x7f).map(char::from).collect();
        for s in [printable.as_str(), "a,b=c d\\e\nf", ""] {
            assert_eq!(unescape(&escape(s)), s);
        }
        assert_eq!(escape("a b,c=d"), "a\\ b\\,c\\=d");
    }

    #[test]
    fn url_from_parts() {
        let mut params = conf::Exporter {
            exporter: "InfluxDB".into(),
            addr: Some("influx.local".into()),
            bucket: Some("harvest".into()),
            org: Some("my org".into()),
            token: Some("t0k3n".into()),
            ..Default::default()
        };
        assert_eq!(
            write_url("i", &params).unwrap(),
            "https://influx.local:8086/api/v2/write?org=my+org&bucket=harvest&precision=s"
        );
        params.scheme = Some("http".into());
        assert_eq!(
            write_url("i", &params).unwrap(),
            "http://influx.local:8086/api/v2/write?org=my+org&bucket=harvest&precision=s"
        );
        params.scheme = Some("ftp".into());
        assert!(matches!(write_url("i", &params), Err(HarvestError::InvalidParam(_))));
        params.scheme = None;
        params.url = Some("https://influx/api/v2/write?bucket=b".into());
        assert_eq!(write_url("i", &params).unwrap(), "https://influx/api/v2/write?bucket=b");

        params.url = None;
        params.bucket = None;
        assert!(write_url("i", &params).is_err());
    }

    #[test]
    fn token_is_required() {
        let params = conf::Exporter {
            exporter: "InfluxDB".into(),
            url: Some("http://localhost:8086/api/v2/write".into()),
            ..Default::default()
        };
        assert!(matches!(InfluxDb::new("i", &params), Err(HarvestError::MissingParam(_))));
    }
}
