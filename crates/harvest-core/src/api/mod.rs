//! Storage API client contracts.
//!
//! ```text
//!   ┌──────────────┐        ┌──────────────┐
//!   │ Zapi/ZapiPerf│        │     Rest     │   collectors
//!   └──────┬───────┘        └──────┬───────┘
//!          │                       │
//!   ┌──────▼──────┐         ┌──────▼──────┐
//!   │ ZapiClient  │ (trait) │ RestClient  │ (trait)
//!   └──────┬──────┘         └──────┬──────┘
//!     ┌────┴─────┐            ┌────┴─────┐
//!  HttpZapi   MockZapi     HttpRest   MockRest
//! ```
//!
//! Collectors only see the traits; tests drive them with the mocks.

pub mod mock;
pub mod rest;
pub mod zapi;

pub use rest::HttpRestClient;
pub use zapi::HttpZapiClient;

use serde_json::Value;

use crate::conf::{AuthStyle, Poller};
use crate::errors::{HarvestError, Result};
use crate::template::{ClusterModel, Version};
use crate::tree::Node;

/// Identity of the monitored system, fetched once at collector init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub serial: String,
    pub release: String,
    pub version: Version,
    pub model: ClusterModel,
}

impl SystemInfo {
    pub fn is_clustered(&self) -> bool {
        self.model == ClusterModel::Clustered
    }
}

/// Connection parameters shared by both transports.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub addr: String,
    pub auth_style: AuthStyle,
    pub username: String,
    pub password: String,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub insecure_tls: bool,
    pub timeout: std::time::Duration,
}

impl ConnectionParams {
    pub fn from_poller(poller: &Poller) -> Result<Self> {
        let addr = poller
            .addr
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| HarvestError::MissingParam("addr".into()))?;
        let auth_style = poller.auth_style.unwrap_or_default();
        let (username, password) = match auth_style {
            AuthStyle::BasicAuth => (
                poller
                    .username
                    .clone()
                    .ok_or_else(|| HarvestError::MissingParam("username".into()))?,
                poller
                    .password
                    .clone()
                    .ok_or_else(|| HarvestError::MissingParam("password".into()))?,
            ),
            AuthStyle::CertificateAuth => {
                if poller.ssl_cert.is_none() || poller.ssl_key.is_none() {
                    return Err(HarvestError::MissingParam("ssl_cert/ssl_key".into()));
                }
                (String::new(), String::new())
            }
        };
        Ok(Self {
            addr,
            auth_style,
            username,
            password,
            ssl_cert: poller.ssl_cert.clone(),
            ssl_key: poller.ssl_key.clone(),
            insecure_tls: poller.insecure_tls(),
            timeout: poller.client_timeout()?,
        })
    }

    /// Blocking HTTP client configured for this target.
    pub(crate) fn http_client(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.insecure_tls);
        if self.auth_style == AuthStyle::CertificateAuth
            && let (Some(cert), Some(key)) = (&self.ssl_cert, &self.ssl_key)
        {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)?;
            builder = builder.identity(identity);
        }
        Ok(builder.build()?)
    }

    /// IPv6 literals need brackets inside URLs.
    pub(crate) fn host(&self) -> String {
        if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// ZAPI
// ---------------------------------------------------------------------------

/// XML API client. `invoke` takes the request element (e.g. `<volume-get-iter>`)
/// and returns the `<results>` element of a passed response.
pub trait ZapiClient: Send + Sync {
    fn invoke(&self, request: &Node) -> Result<Node>;

    /// Name, serial, release and model of the target.
    fn system(&self) -> Result<SystemInfo> {
        let version = self.invoke(&Node::new("system-get-version"))?;
        let release = version.child_content("version").to_string();
        let clustered = version.child_content("is-clustered") == "true";
        let parsed = parse_zapi_version(&version, &release)?;

        if clustered {
            let identity = self.invoke(&Node::new("cluster-identity-get"))?;
            let info = identity
                .child("attributes")
                .and_then(|a| a.child("cluster-identity-info"))
                .ok_or_else(|| HarvestError::Schema("cluster-identity-info".into()))?;
            Ok(SystemInfo {
                name: info.child_content("cluster-name").to_string(),
                serial: info.child_content("cluster-serial-number").to_string(),
                release,
                version: parsed,
                model: ClusterModel::Clustered,
            })
        } else {
            let system = self.invoke(&Node::new("system-get-info"))?;
            let info = system
                .child("system-info")
                .ok_or_else(|| HarvestError::Schema("system-info".into()))?;
            Ok(SystemInfo {
                name: info.child_content("system-name").to_string(),
                serial: info.child_content("system-serial-number").to_string(),
                release,
                version: parsed,
                model: ClusterModel::SevenMode,
            })
        }
    }
}

/// Version from `version-tuple/system-version-tuple`, falling back to the
/// release string (`NetApp Release 9.8P1: ...`).
fn parse_zapi_version(results: &Node, release: &str) -> Result<Version> {
    if let Some(tuple) = results
        .child("version-tuple")
        .and_then(|t| t.child("system-version-tuple"))
    {
        let part = |n: &str| tuple.child_content(n).parse::<u32>().unwrap_or(0);
        return Ok(Version(part("generation"), part("major"), part("minor")));
    }
    version_from_release(release)
        .ok_or_else(|| HarvestError::Schema(format!("version of release [{}]", release)))
}

fn version_from_release(release: &str) -> Option<Version> {
    let rest = release.split("Release").nth(1)?.trim_start();
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    token.trim_end_matches('.').parse().ok()
}

/// Builds `<name><param>value</param>...</name>`.
pub fn zapi_request(name: &str, params: &[(&str, &str)]) -> Node {
    let mut node = Node::new(name);
    for (k, v) in params {
        node.new_child(*k, *v);
    }
    node
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

/// JSON API client working on hrefs relative to the API root.
pub trait RestClient: Send + Sync {
    fn get(&self, href: &str) -> Result<Value>;

    /// Follows `_links.next.href` and gathers every `records` entry.
    fn fetch_all(&self, href: &str) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut next = href.to_string();
        loop {
            let page = self.get(&next)?;
            if let Some(items) = page.get("records").and_then(Value::as_array) {
                records.extend(items.iter().cloned());
            }
            match page
                .pointer("/_links/next/href")
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
            {
                Some(h) => next = h.trim_start_matches('/').to_string(),
                None => break,
            }
        }
        Ok(records)
    }

    fn system(&self) -> Result<SystemInfo> {
        let cluster = self.get("api/cluster?fields=name,uuid,version")?;
        let part = |n: &str| {
            cluster
                .pointer(&format!("/version/{}", n))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32
        };
        Ok(SystemInfo {
            name: cluster
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            serial: cluster
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            release: cluster
                .pointer("/version/full")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            version: Version(part("generation"), part("major"), part("minor")),
            model: ClusterModel::Clustered,
        })
    }
}

/// `api/<query>?fields=..&max_records=..&return_records=true`.
pub fn rest_href(query: &str, fields: &[String], max_records: Option<usize>) -> String {
    let mut href = format!("api/{}", query.trim_start_matches('/').trim_start_matches("api/"));
    let mut params: Vec<String> = Vec::new();
    if !fields.is_empty() {
        params.push(format!("fields={}", fields.join(",")));
    }
    if let Some(n) = max_records {
        params.push(format!("max_records={}", n));
    }
    params.push("return_records=true".to_string());
    href.push('?');
    href.push_str(&params.join("&"));
    href
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockRest, MockZapi};
    use serde_json::json;

    #[test]
    fn release_string_version() {
        assert_eq!(
            version_from_release("NetApp Release 9.8P1: Mon Dec 07 2020"),
            Some(Version(9, 8, 0))
        );
        assert_eq!(
            version_from_release("NetApp Release 8.2.5 7-Mode: Jan 1"),
            Some(Version(8, 2, 5))
        );
        assert_eq!(version_from_release("unknown"), None);
    }

    #[test]
    fn zapi_system_of_cluster() {
        let zapi = MockZapi::new();
        zapi.push_xml(
            "system-get-version",
            r#"<results status="passed">
                <is-clustered>true</is-clustered>
                <version>NetApp Release 9.10.1: Thu</version>
                <version-tuple><system-version-tuple>
                  <generation>9</generation><major>10</major><minor>1</minor>
                </system-version-tuple></version-tuple>
              </results>"#,
        );
        zapi.push_xml(
            "cluster-identity-get",
            r#"<results status="passed"><attributes><cluster-identity-info>
                <cluster-name>umeng</cluster-name>
                <cluster-serial-number>1-80-000011</cluster-serial-number>
              </cluster-identity-info></attributes></results>"#,
        );
        let info = zapi.system().unwrap();
        assert_eq!(info.name, "umeng");
        assert_eq!(info.version, Version(9, 10, 1));
        assert!(info.is_clustered());
    }

    #[test]
    fn zapi_system_of_seven_mode() {
        let zapi = MockZapi::new();
        zapi.push_xml(
            "system-get-version",
            r#"<results status="passed"><is-clustered>false</is-clustered>
               <version>NetApp Release 8.2.5 7-Mode: Jan</version></results>"#,
        );
        zapi.push_xml(
            "system-get-info",
            r#"<results status="passed"><system-info>
               <system-name>filer1</system-name><system-serial-number>42</system-serial-number>
               </system-info></results>"#,
        );
        let info = zapi.system().unwrap();
        assert_eq!(info.model, ClusterModel::SevenMode);
        assert_eq!(info.version, Version(8, 2, 5));
        assert_eq!(info.serial, "42");
    }

    #[test]
    fn rest_pagination_collects_records() {
        let rest = MockRest::new();
        rest.push(
            "api/storage/volumes",
            json!({"records": [{"name": "v1"}, {"name": "v2"}],
                   "_links": {"next": {"href": "/api/storage/volumes?start=2"}}}),
        );
        rest.push(
            "api/storage/volumes",
            json!({"records": [{"name": "v3"}], "_links": {}}),
        );
        let records = rest.fetch_all("api/storage/volumes?fields=name").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            rest.requests(),
            vec![
                "api/storage/volumes?fields=name".to_string(),
                "api/storage/volumes?start=2".to_string()
            ]
        );
    }

    #[test]
    fn rest_href_layout() {
        assert_eq!(
            rest_href("storage/volumes", &["name".into(), "svm.name".into()], Some(500)),
            "api/storage/volumes?fields=name,svm.name&max_records=500&return_records=true"
        );
    }

    #[test]
    fn connection_params_require_credentials() {
        let mut poller = Poller {
            addr: Some("10.0.0.1".into()),
            ..Default::default()
        };
        assert!(ConnectionParams::from_poller(&poller).is_err());
        poller.username = Some("admin".into());
        poller.password = Some("pw".into());
        let params = ConnectionParams::from_poller(&poller).unwrap();
        assert_eq!(params.host(), "10.0.0.1");

        poller.addr = Some("fe80::1".into());
        let params = ConnectionParams::from_poller(&poller).unwrap();
        assert_eq!(params.host(), "[fe80::1]");
    }
}
