//! QoS policy throughput strings to numbers.
//!
//! ONTAP reports limits as free text: `15000IOPS`, `468.8MB/s`,
//! `15000IOPS,468.8MB/s`, `6144IOPS/TB`, `INF`. Both plugins convert them
//! to whole IOPS and whole MB/s.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::{Plugin, PluginContext};
use crate::errors::{HarvestError, Result};
use crate::matrix::Matrix;
use crate::tree::Node;

static IOPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)iops").expect("static regex"));
static BPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(\w+)/s").expect("static regex"));

/// IOPS and MB/s of a throughput limit, as whole numbers in text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throughput {
    pub iops: String,
    pub mbps: String,
}

impl Throughput {
    fn zero() -> Self {
        Self {
            iops: "0".into(),
            mbps: "0".into(),
        }
    }
}

fn unit_to_mb(unit: &str) -> Option<f64> {
    match unit {
        "b" => Some(1.0 / (1024.0 * 1024.0)),
        "kb" => Some(1.0 / 1024.0),
        "mb" => Some(1.0),
        "gb" => Some(1024.0),
        "tb" => Some(1024.0 * 1024.0),
        _ => None,
    }
}

/// Parses a throughput limit. `INF` and `0` mean no limit and give zeros.
pub fn parse_throughput(raw: &str) -> Result<Throughput> {
    let lower = raw.trim().to_lowercase();
    if lower == "inf" || lower == "0" || lower.is_empty() {
        return Ok(Throughput::zero());
    }
    if let Some((left, right)) = lower.split_once(',') {
        let l = parse_throughput(left)?;
        let r = parse_throughput(right)?;
        return Ok(Throughput {
            iops: l.iops,
            mbps: r.mbps,
        });
    }
    if let Some(caps) = IOPS_RE.captures(&lower) {
        return Ok(Throughput {
            iops: caps[1].to_string(),
            mbps: "0".into(),
        });
    }
    let caps = BPS_RE
        .captures(&lower)
        .ok_or_else(|| HarvestError::Parse(format!("unknown qos-policy format [{}]", raw)))?;
    let multiple = unit_to_mb(&caps[2])
        .ok_or_else(|| HarvestError::Parse(format!("unknown qos-policy unit [{}] of [{}]", &caps[2], raw)))?;
    let n: f64 = caps[1]
        .parse()
        .map_err(|_| HarvestError::Parse(format!("qos-policy number [{}] of [{}]", &caps[1], raw)))?;
    Ok(Throughput {
        iops: "0".into(),
        mbps: ((n * multiple) as u64).to_string(),
    })
}

// ---------------------------------------------------------------------------
// Fixed
// ---------------------------------------------------------------------------

/// Splits `max_xput` / `min_xput` labels into IOPS and MB/s labels. Only
/// `user_defined` policies are exported.
pub struct QosPolicyFixed;

impl QosPolicyFixed {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

impl Plugin for QosPolicyFixed {
    fn name(&self) -> &str {
        "QosPolicyFixed"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        for instance in data.instances_mut() {
            if instance.label("class") != "user_defined" {
                instance.exportable = false;
                continue;
            }
            for (label, iops, mbps) in [
                ("max_xput", "max_throughput_iops", "max_throughput_mbps"),
                ("min_xput", "min_throughput_iops", "min_throughput_mbps"),
            ] {
                let raw = instance.label(label).to_string();
                match parse_throughput(&raw) {
                    Ok(t) => {
                        instance.labels.set(iops, t.iops);
                        instance.labels.set(mbps, t.mbps);
                    }
                    Err(e) => warn!(label, value = %raw, error = %e, "unable to convert, skipped"),
                }
            }
        }
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Adaptive
// ---------------------------------------------------------------------------

const ADAPTIVE_LABELS: [&str; 3] = ["expected_iops", "peak_iops", "absolute_min_iops"];

/// Turns the per-TB IOPS labels of adaptive policies into metrics of the
/// same name.
pub struct QosPolicyAdaptive;

impl QosPolicyAdaptive {
    pub fn new(_config: &Node, _ctx: &PluginContext) -> Result<Self> {
        Ok(Self)
    }
}

impl Plugin for QosPolicyAdaptive {
    fn name(&self) -> &str {
        "QosPolicyAdaptive"
    }

    fn run(&mut self, data: &mut Matrix) -> Result<Vec<Matrix>> {
        for name in ADAPTIVE_LABELS {
            if !data.has_metric(name) {
                data.add_metric(name, name)?;
            }
        }
        if !data.is_initialized() {
            return Ok(Vec::new());
        }
        let mut values = Vec::new();
        for (key, instance) in data.instances() {
            for name in ADAPTIVE_LABELS {
                let raw = instance.label(name);
                match parse_throughput(raw).map(|t| t.iops.parse::<f64>()) {
                    Ok(Ok(v)) => values.push((name, key.to_string(), v)),
                    _ => warn!(label = name, value = raw, instance = key, "unable to convert, skipped"),
                }
            }
        }
        for (metric, key, v) in values {
            data.set_value(metric, &key, v)?;
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(iops: &str, mbps: &str) -> Throughput {
        Throughput {
            iops: iops.into(),
            mbps: mbps.into(),
        }
    }

    #[test]
    fn adaptive_per_tb() {
        assert_eq!(parse_throughput("6144IOPS/TB").unwrap(), t("6144", "0"));
    }

    #[test]
    fn combined_iops_and_bandwidth() {
        assert_eq!(parse_throughput("15000IOPS,468.8MB/s").unwrap(), t("15000", "468"));
    }

    #[test]
    fn unknown_unit_is_an_error() {
        assert!(parse_throughput("1 foople/s").is_err());
        assert!(parse_throughput("10pb/s").is_err());
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(parse_throughput("INF").unwrap(), t("0", "0"));
        assert_eq!(parse_throughput("0").unwrap(), t("0", "0"));
        assert_eq!(parse_throughput("100B/s").unwrap(), t("0", "0"));
        assert_eq!(parse_throughput("500KB/s").unwrap(), t("0", "0"));
        assert_eq!(parse_throughput("2048KB/s").unwrap(), t("0", "2"));
        assert_eq!(parse_throughput("2GB/s").unwrap(), t("0", "2048"));
        assert_eq!(parse_throughput("1TB/s").unwrap(), t("0", "1048576"));
    }

    fn policies() -> Matrix {
        let mut m = Matrix::new("Zapi", "qos_policy_fixed", "");
        m.add_metric("dummy", "dummy").unwrap();
        for (key, class, max) in [("p1", "user_defined", "15000IOPS,468.8MB/s"), ("p2", "system_defined", "INF")] {
            let i = m.add_instance(key).unwrap();
            i.labels.set("class", class);
            i.labels.set("max_xput", max);
            i.labels.set("min_xput", "0");
        }
        m.init_data().unwrap();
        m
    }

    #[test]
    fn fixed_policy_labels() {
        let mut m = policies();
        QosPolicyFixed.run(&mut m).unwrap();
        let p1 = m.instance("p1").unwrap();
        assert_eq!(p1.label("max_throughput_iops"), "15000");
        assert_eq!(p1.label("max_throughput_mbps"), "468");
        assert_eq!(p1.label("min_throughput_iops"), "0");
        assert!(!m.instance("p2").unwrap().exportable);
    }

    #[test]
    fn adaptive_policy_metrics() {
        let mut m = Matrix::new("Zapi", "qos_policy_adaptive", "");
        m.add_metric("dummy", "dummy").unwrap();
        let i = m.add_instance("a1").unwrap();
        i.labels.set("expected_iops", "6144IOPS/TB");
        i.labels.set("peak_iops", "12288IOPS/TB");
        i.labels.set("absolute_min_iops", "1000IOPS");
        m.init_data().unwrap();
        QosPolicyAdaptive.run(&mut m).unwrap();
        assert_eq!(m.get_value("expected_iops", "a1"), Some(6144.0));
        assert_eq!(m.get_value("peak_iops", "a1"), Some(12288.0));
        assert_eq!(m.get_value("absolute_min_iops", "a1"), Some(1000.0));
    }
}
