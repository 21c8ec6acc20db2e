//! harvest-core: runtime of a storage telemetry poller.
//!
//! Provides:
//! - `matrix`: columnar store of metrics, instances and labels
//! - `tree`: generic named tree (templates, XML responses) and its codecs
//! - `template`: counter path parsing, display names, version-directory resolution
//! - `schedule`: per-collector task scheduler with standby/recover
//! - `conf`: typed view of `harvest.yml`
//! - `api`: ZAPI (XML) and REST (JSON) client contracts, HTTP transports and mocks
//! - `collector`: collector lifecycle, state machine and the Zapi/ZapiPerf/Rest collectors
//! - `plugin`: post-processors applied between collector and exporters
//! - `exporter`: Prometheus, InfluxDB and Graphite sinks
//! - `poller`: wiring of one poller process
//! - `manager`: PID-file based start/stop/status of poller processes

pub mod api;
pub mod collector;
pub mod conf;
pub mod errors;
pub mod exporter;
pub mod manager;
pub mod matrix;
pub mod plugin;
pub mod poller;
pub mod schedule;
pub mod template;
pub mod tree;
pub mod util;

pub use errors::{ErrorKind, HarvestError, Result};

/// Package version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit id embedded at build time.
pub const GIT_SHA: &str = env!("HARVEST_GIT_SHA");

/// Version string shown by `--version` of both binaries.
pub fn version_string() -> String {
    format!(
        "harvest {} ({} {}) {}/{}",
        VERSION,
        GIT_SHA,
        env!("HARVEST_GIT_BRANCH"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
