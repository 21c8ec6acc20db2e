//! Typed view of `harvest.yml`.
//!
//! ```yaml
//! Exporters:
//!   prom:
//!     exporter: Prometheus
//!     port: 12990
//! Defaults:
//!   collectors: [Zapi, ZapiPerf]
//!   exporters: [prom]
//! Pollers:
//!   cluster-01:
//!     datacenter: dc1
//!     addr: 10.0.0.1
//! ```
//!
//! Poller entries keep file order and inherit unset fields from `Defaults`.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::errors::{HarvestError, Result};
use crate::util::parse_duration;

/// Default client timeout for storage APIs.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

fn env_dir(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Install root (`HARVEST_HOME`, default `/opt/harvest`).
pub fn harvest_home() -> PathBuf {
    env_dir("HARVEST_HOME", "/opt/harvest")
}

/// Config root (`HARVEST_CONF`, default `HARVEST_HOME`).
pub fn conf_dir() -> PathBuf {
    std::env::var("HARVEST_CONF")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(harvest_home)
}

/// Directory holding collector templates.
pub fn templates_dir() -> PathBuf {
    conf_dir().join("conf")
}

/// PID file root (`HARVEST_PIDS`, default `/var/run/harvest`).
pub fn pid_dir() -> PathBuf {
    env_dir("HARVEST_PIDS", "/var/run/harvest")
}

/// Log root of daemonized pollers (`HARVEST_LOGS`, default `/var/log/harvest`).
pub fn log_dir() -> PathBuf {
    env_dir("HARVEST_LOGS", "/var/log/harvest")
}

/// Resolves the config path: explicit flag, `HARVEST_CONF/harvest.yml`, `./harvest.yml`.
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(p) = flag {
        return p.to_path_buf();
    }
    if let Ok(dir) = std::env::var("HARVEST_CONF")
        && !dir.is_empty()
    {
        return Path::new(&dir).join("harvest.yml");
    }
    PathBuf::from("harvest.yml")
}

// ---------------------------------------------------------------------------
// Deserialization helpers
// ---------------------------------------------------------------------------

/// Ordered `name: value` mapping.
fn ordered_map<'de, D, T>(deserializer: D) -> std::result::Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    struct OrderedVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de> + Default> Visitor<'de> for OrderedVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of names to entries")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut out: Vec<(String, T)> = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, Option<T>>()? {
                if out.iter().any(|(k, _)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate entry [{}]", key)));
                }
                // `cluster-01:` with no body is an entry with every field unset
                out.push((key, value.unwrap_or_default()));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(OrderedVisitor(PhantomData))
}

/// Accepts `5`, `5.0` or `"5s"` and keeps the textual form.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a scalar, got {:?}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    #[default]
    #[serde(alias = "basic")]
    BasicAuth,
    CertificateAuth,
}

/// One `Pollers` (or the `Defaults`) entry. Every field is optional so
/// that defaults can be merged in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Poller {
    pub addr: Option<String>,
    pub datacenter: Option<String>,
    pub auth_style: Option<AuthStyle>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub use_insecure_tls: Option<bool>,
    pub collectors: Option<Vec<String>>,
    pub exporters: Option<Vec<String>>,
    pub prometheus_port: Option<u16>,
    #[serde(deserialize_with = "string_or_number")]
    pub client_timeout: Option<String>,
    pub log_max_bytes: Option<u64>,
    /// Extra global labels, `- key: value` items.
    pub labels: Option<Vec<std::collections::BTreeMap<String, String>>>,
}

macro_rules! inherit {
    ($self:ident, $defaults:ident, $($field:ident),+) => {
        $(
            if $self.$field.is_none() {
                $self.$field = $defaults.$field.clone();
            }
        )+
    };
}

impl Poller {
    /// Fills unset fields from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &Poller) {
        inherit!(
            self,
            defaults,
            addr,
            datacenter,
            auth_style,
            username,
            password,
            ssl_cert,
            ssl_key,
            use_insecure_tls,
            collectors,
            exporters,
            prometheus_port,
            client_timeout,
            log_max_bytes,
            labels
        );
    }

    pub fn datacenter(&self) -> &str {
        self.datacenter.as_deref().unwrap_or("")
    }

    pub fn collectors(&self) -> &[String] {
        self.collectors.as_deref().unwrap_or(&[])
    }

    pub fn exporters(&self) -> &[String] {
        self.exporters.as_deref().unwrap_or(&[])
    }

    pub fn insecure_tls(&self) -> bool {
        self.use_insecure_tls.unwrap_or(false)
    }

    pub fn client_timeout(&self) -> Result<Duration> {
        match &self.client_timeout {
            Some(t) => parse_duration(t),
            None => Ok(DEFAULT_CLIENT_TIMEOUT),
        }
    }

    /// `labels` flattened in declaration order.
    pub fn global_labels(&self) -> Vec<(String, String)> {
        self.labels
            .iter()
            .flatten()
            .flat_map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// One `Exporters` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exporter {
    /// Exporter class: `Prometheus`, `InfluxDB` or `Graphite`.
    pub exporter: String,
    pub addr: Option<String>,
    pub port: Option<u16>,
    /// `http` or `https` for push endpoints built from `addr`.
    pub scheme: Option<String>,
    pub url: Option<String>,
    pub bucket: Option<String>,
    pub org: Option<String>,
    pub token: Option<String>,
    pub precision: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub version: Option<String>,
    pub local_http_addr: Option<String>,
    pub allow_addrs: Option<Vec<String>>,
    pub allow_addrs_regex: Option<Vec<String>>,
    #[serde(deserialize_with = "string_or_number")]
    pub cache_max_keep: Option<String>,
    pub add_meta_tags: Option<bool>,
    #[serde(deserialize_with = "string_or_number")]
    pub timeout: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub asup_disabled: Option<bool>,
    pub grafana_api_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Pollers", deserialize_with = "ordered_map")]
    pub pollers: Vec<(String, Poller)>,
    #[serde(rename = "Exporters", deserialize_with = "ordered_map")]
    pub exporters: Vec<(String, Exporter)>,
    #[serde(rename = "Defaults")]
    pub defaults: Option<Poller>,
    #[serde(rename = "Tools")]
    pub tools: Option<Tools>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(text)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("read [{}]: {}", path.display(), e))
        })?;
        Self::parse(&text).map_err(|e| HarvestError::Config(format!("[{}]: {}", path.display(), e)))
    }

    pub fn poller_names(&self) -> Vec<&str> {
        self.pollers.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Poller `name` with `Defaults` merged in.
    pub fn poller(&self, name: &str) -> Result<Poller> {
        let mut poller = self
            .pollers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| HarvestError::Config(format!("poller [{}] not defined", name)))?;
        if let Some(defaults) = &self.defaults {
            poller.merge_defaults(defaults);
        }
        Ok(poller)
    }

    pub fn exporter(&self, name: &str) -> Option<&Exporter> {
        self.exporters.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// Port of the first Prometheus exporter used by `poller`.
    pub fn prometheus_port(&self, poller: &Poller) -> Option<u16> {
        if poller.prometheus_port.is_some() {
            return poller.prometheus_port;
        }
        poller
            .exporters()
            .iter()
            .filter_map(|name| self.exporter(name))
            .find(|e| e.exporter == "Prometheus")
            .and_then(|e| e.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARVEST_YML: &str = r#"
Tools:
  asup_disabled: true
Exporters:
  prom:
    exporter: Prometheus
    port: 12990
    allow_addrs_regex:
      - ^192\.168\.0\.\d+$
  influx:
    exporter: InfluxDB
    addr: localhost
    bucket: harvest
    org: netapp
    token: secret
    version: 2
    timeout: 5
Defaults:
  collectors:
    - Zapi
    - ZapiPerf
  exporters:
    - prom
  use_insecure_tls: true
Pollers:
  zeta:
    datacenter: dc1
    addr: 10.0.0.1
    client_timeout: 1m
  alpha:
    datacenter: dc2
    addr: 10.0.0.2
    collectors:
      - Rest
    labels:
      - org: abc
      - site: north
  unix:
"#;

    #[test]
    fn keeps_poller_order() {
        let config = Config::parse(HARVEST_YML).unwrap();
        assert_eq!(config.poller_names(), vec!["zeta", "alpha", "unix"]);
        assert_eq!(config.tools.unwrap().asup_disabled, Some(true));
    }

    #[test]
    fn pollers_inherit_defaults() {
        let config = Config::parse(HARVEST_YML).unwrap();
        let zeta = config.poller("zeta").unwrap();
        assert_eq!(zeta.collectors(), &["Zapi".to_string(), "ZapiPerf".to_string()]);
        assert_eq!(zeta.exporters(), &["prom".to_string()]);
        assert!(zeta.insecure_tls());
        assert_eq!(zeta.client_timeout().unwrap(), Duration::from_secs(60));

        let alpha = config.poller("alpha").unwrap();
        assert_eq!(alpha.collectors(), &["Rest".to_string()]);
        assert_eq!(
            alpha.global_labels(),
            vec![
                ("org".to_string(), "abc".to_string()),
                ("site".to_string(), "north".to_string())
            ]
        );
        assert_eq!(alpha.client_timeout().unwrap(), DEFAULT_CLIENT_TIMEOUT);

        let unix = config.poller("unix").unwrap();
        assert_eq!(unix.addr, None);
        assert_eq!(unix.exporters(), &["prom".to_string()]);

        assert!(config.poller("missing").is_err());
    }

    #[test]
    fn exporter_fields() {
        let config = Config::parse(HARVEST_YML).unwrap();
        let influx = config.exporter("influx").unwrap();
        assert_eq!(influx.exporter, "InfluxDB");
        assert_eq!(influx.version.as_deref(), Some("2"));
        assert_eq!(influx.timeout.as_deref(), Some("5"));
        let zeta = config.poller("zeta").unwrap();
        assert_eq!(config.prometheus_port(&zeta), Some(12990));
    }

    #[test]
    fn duplicate_poller_is_error() {
        let text = "Pollers:\n  a:\n    addr: x\n  a:\n    addr: y\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.yml");
        std::fs::write(&path, HARVEST_YML).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.exporters.len(), 2);
        assert!(matches!(
            Config::load(&dir.path().join("nope.yml")),
            Err(HarvestError::Config(_))
        ));
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            config_path(Some(Path::new("/tmp/h.yml"))),
            PathBuf::from("/tmp/h.yml")
        );
    }
}
