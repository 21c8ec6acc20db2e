//! REST/JSON over HTTPS.

use serde_json::Value;
use tracing::{debug, trace};

use super::{ConnectionParams, RestClient};
use crate::conf::AuthStyle;
use crate::errors::{HarvestError, Result};

/// Turns a non-2xx response body into an error; ONTAP reports
/// `{"error": {"message": .., "code": ..}}`.
pub fn status_error(status: u16, body: &str) -> HarvestError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("HTTP {}", status));
    let code = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/code"))
        .map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| status.to_string());
    match status {
        401 => HarvestError::AuthFailed(message),
        403 => HarvestError::PermissionDenied(message),
        _ => HarvestError::rejected(message, code),
    }
}

pub struct HttpRestClient {
    client: reqwest::blocking::Client,
    base: String,
    params: ConnectionParams,
}

impl HttpRestClient {
    pub fn new(params: ConnectionParams) -> Result<Self> {
        let client = params.http_client()?;
        let base = format!("https://{}/", params.host());
        Ok(Self {
            client,
            base,
            params,
        })
    }
}

impl RestClient for HttpRestClient {
    fn get(&self, href: &str) -> Result<Value> {
        let url = format!("{}{}", self.base, href.trim_start_matches('/'));
        trace!(url = %url, "rest request");

        let mut req = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json");
        if self.params.auth_style == AuthStyle::BasicAuth {
            req = req.basic_auth(&self.params.username, Some(&self.params.password));
        }
        let response = req.send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        debug!(href, bytes = body.len(), "rest response");
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn error_body_is_surfaced() {
        let err = status_error(
            400,
            r#"{"error": {"message": "Invalid field \"foo\"", "code": "262197"}}"#,
        );
        match err {
            HarvestError::ApiRejected { reason, errno } => {
                assert_eq!(reason, "Invalid field \"foo\"");
                assert_eq!(errno, "262197");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn auth_statuses_are_fatal() {
        assert_eq!(status_error(401, "").kind(), ErrorKind::Fatal);
        assert_eq!(status_error(403, "{}").kind(), ErrorKind::Fatal);
        assert_eq!(status_error(503, "busy").kind(), ErrorKind::Rejected);
    }
}
