//! In-memory API clients for testing collectors and plugins without a
//! storage system.
//!
//! Replies are queued per API name (ZAPI) or per path (REST, the part of the
//! href before `?`). A queued reply is consumed once; a reply registered
//! with `set_*` is returned whenever the queue is empty. Every request is
//! recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

use super::{RestClient, ZapiClient, zapi::check_results};
use crate::errors::{HarvestError, Result};
use crate::tree::{Node, xml};

#[derive(Debug, Clone)]
enum Reply<T> {
    Ok(T),
    Rejected { reason: String, errno: String },
    Connection(String),
}

impl<T: Clone> Reply<T> {
    fn to_result(&self) -> Result<T> {
        match self {
            Reply::Ok(v) => Ok(v.clone()),
            Reply::Rejected { reason, errno } => Err(HarvestError::rejected(reason, errno)),
            Reply::Connection(msg) => Err(HarvestError::Connection(msg.clone())),
        }
    }
}

#[derive(Debug)]
struct Replies<T> {
    queued: HashMap<String, VecDeque<Reply<T>>>,
    sticky: HashMap<String, Reply<T>>,
}

impl<T: Clone> Default for Replies<T> {
    fn default() -> Self {
        Self {
            queued: HashMap::new(),
            sticky: HashMap::new(),
        }
    }
}

impl<T: Clone> Replies<T> {
    fn next(&mut self, key: &str) -> Result<T> {
        if let Some(reply) = self.queued.get_mut(key).and_then(VecDeque::pop_front) {
            return reply.to_result();
        }
        match self.sticky.get(key) {
            Some(reply) => reply.to_result(),
            None => Err(HarvestError::Connection(format!("no mock reply for [{}]", key))),
        }
    }

    fn push(&mut self, key: &str, reply: Reply<T>) {
        self.queued.entry(key.to_string()).or_default().push_back(reply);
    }
}

// ---------------------------------------------------------------------------
// ZAPI
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockZapi {
    replies: Mutex<Replies<Node>>,
    requests: Mutex<Vec<Node>>,
}

fn parse_results(body: &str) -> Reply<Node> {
    match xml::parse(body).and_then(check_results) {
        Ok(node) => Reply::Ok(node),
        Err(HarvestError::ApiRejected { reason, errno }) => Reply::Rejected { reason, errno },
        Err(e) => Reply::Connection(e.to_string()),
    }
}

impl MockZapi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a `<results>` document (or full `<netapp>` response) for `api`.
    pub fn push_xml(&self, api: &str, body: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(api, parse_results(body));
        }
    }

    /// Replies with `body` whenever nothing is queued for `api`.
    pub fn set_xml(&self, api: &str, body: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.sticky.insert(api.to_string(), parse_results(body));
        }
    }

    /// Answers the system identity requests for a clustered 9.8 system named `name`.
    pub fn set_cluster(&self, name: &str) {
        self.set_xml(
            "system-get-version",
            r#"<results status="passed"><version>NetApp Release 9.8P1</version><is-clustered>true</is-clustered>
               <version-tuple><system-version-tuple><generation>9</generation><major>8</major><minor>0</minor></system-version-tuple></version-tuple>
               </results>"#,
        );
        self.set_xml(
            "cluster-identity-get",
            &format!(
                r#"<results status="passed"><attributes><cluster-identity-info>
                   <cluster-name>{}</cluster-name><cluster-serial-number>1</cluster-serial-number>
                   </cluster-identity-info></attributes></results>"#,
                name
            ),
        );
    }

    pub fn push_rejected(&self, api: &str, reason: &str, errno: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(
                api,
                Reply::Rejected {
                    reason: reason.to_string(),
                    errno: errno.to_string(),
                },
            );
        }
    }

    pub fn push_connection_error(&self, api: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(api, Reply::Connection("connection refused".into()));
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Node> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Requests received for `api`.
    pub fn requests_for(&self, api: &str) -> Vec<Node> {
        self.requests()
            .into_iter()
            .filter(|n| n.name == api)
            .collect()
    }
}

impl ZapiClient for MockZapi {
    fn invoke(&self, request: &Node) -> Result<Node> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        self.replies
            .lock()
            .map_err(|_| HarvestError::Connection("mock poisoned".into()))?
            .next(&request.name)
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockRest {
    replies: Mutex<Replies<Value>>,
    requests: Mutex<Vec<String>>,
}

fn path_of(href: &str) -> &str {
    href.trim_start_matches('/')
        .split('?')
        .next()
        .unwrap_or_default()
}

impl MockRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: &str, body: Value) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(path_of(path), Reply::Ok(body));
        }
    }

    pub fn set(&self, path: &str, body: Value) {
        if let Ok(mut r) = self.replies.lock() {
            r.sticky.insert(path_of(path).to_string(), Reply::Ok(body));
        }
    }

    pub fn push_rejected(&self, path: &str, reason: &str, code: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(
                path_of(path),
                Reply::Rejected {
                    reason: reason.to_string(),
                    errno: code.to_string(),
                },
            );
        }
    }

    pub fn push_connection_error(&self, path: &str) {
        if let Ok(mut r) = self.replies.lock() {
            r.push(path_of(path), Reply::Connection("connection refused".into()));
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RestClient for MockRest {
    fn get(&self, href: &str) -> Result<Value> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(href.to_string());
        }
        self.replies
            .lock()
            .map_err(|_| HarvestError::Connection("mock poisoned".into()))?
            .next(path_of(href))
    }
}
