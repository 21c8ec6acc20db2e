//! ZAPI over HTTPS.

use tracing::{debug, trace};

use super::{ConnectionParams, ZapiClient};
use crate::conf::AuthStyle;
use crate::errors::{HarvestError, Result};
use crate::tree::{Node, xml};

const ZAPI_PATH: &str = "/servlets/netapp.servlets.admin.XMLrequest_filer";
const ZAPI_NAMESPACE: &str = "http://www.netapp.com/filer/admin";
const ZAPI_VERSION: &str = "1.3";

/// Wraps a request element into the `<netapp>` envelope.
pub fn envelope(request: &Node) -> String {
    let mut root = Node::new("netapp");
    root.set_attr("xmlns", ZAPI_NAMESPACE);
    root.set_attr("version", ZAPI_VERSION);
    root.add_child(request.clone());
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", xml::to_string(&root))
}

/// Extracts `<results>` from a response and fails unless `status="passed"`.
///
/// Accepts the full `<netapp>` document or a bare `<results>` element.
pub fn check_results(doc: Node) -> Result<Node> {
    let results = if doc.name == "results" {
        doc
    } else {
        let mut doc = doc;
        doc.pop_child("results")
            .ok_or_else(|| HarvestError::Schema("missing <results> in response".into()))?
    };
    match results.attr("status") {
        Some("passed") => Ok(results),
        _ => Err(HarvestError::rejected(
            results.attr("reason").unwrap_or("unknown reason"),
            results.attr("errno").unwrap_or(""),
        )),
    }
}

pub struct HttpZapiClient {
    client: reqwest::blocking::Client,
    url: String,
    params: ConnectionParams,
}

impl HttpZapiClient {
    pub fn new(params: ConnectionParams) -> Result<Self> {
        let client = params.http_client()?;
        let url = format!("https://{}:443{}", params.host(), ZAPI_PATH);
        Ok(Self {
            client,
            url,
            params,
        })
    }
}

impl ZapiClient for HttpZapiClient {
    fn invoke(&self, request: &Node) -> Result<Node> {
        let body = envelope(request);
        trace!(api = %request.name, body = %body, "zapi request");

        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body);
        if self.params.auth_style == AuthStyle::BasicAuth {
            req = req.basic_auth(&self.params.username, Some(&self.params.password));
        }

        let response = req.send()?.error_for_status()?;
        let text = response.text()?;
        debug!(api = %request.name, bytes = text.len(), "zapi response");
        check_results(xml::parse(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::zapi_request;
    use crate::errors::ErrorKind;

    #[test]
    fn envelope_wraps_request() {
        let req = zapi_request("volume-get-iter", &[("max-records", "500")]);
        let body = envelope(&req);
        assert!(body.contains(
            r#"<netapp xmlns="http://www.netapp.com/filer/admin" version="1.3"><volume-get-iter><max-records>500</max-records></volume-get-iter></netapp>"#
        ));
    }

    #[test]
    fn passed_results_are_returned() {
        let doc = xml::parse(
            r#"<netapp version="1.3"><results status="passed"><num-records>2</num-records></results></netapp>"#,
        )
        .unwrap();
        let results = check_results(doc).unwrap();
        assert_eq!(results.child_content("num-records"), "2");
    }

    #[test]
    fn failed_results_carry_reason_and_errno() {
        let doc = xml::parse(
            r#"<netapp><results status="failed" reason="Unable to find API: foo-get-iter" errno="13005"/></netapp>"#,
        )
        .unwrap();
        let err = check_results(doc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        match err {
            HarvestError::ApiRejected { reason, errno } => {
                assert_eq!(reason, "Unable to find API: foo-get-iter");
                assert_eq!(errno, "13005");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_results_is_schema_error() {
        let doc = xml::parse("<netapp/>").unwrap();
        assert_eq!(check_results(doc).unwrap_err().kind(), ErrorKind::Schema);
    }
}
