//! Small helpers shared across the crate.

use std::process;
use std::time::Duration;

use crate::errors::{HarvestError, Result};

/// Parses Go-style durations (`90s`, `3m`, `1h30m`); a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(HarvestError::InvalidParam("empty duration".into()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Ok(secs) = s.parse::<f64>()
        && secs.is_finite()
        && secs >= 0.0
    {
        return Ok(Duration::from_secs_f64(secs));
    }
    humantime::parse_duration(s)
        .map_err(|e| HarvestError::InvalidParam(format!("duration [{}]: {}", s, e)))
}

/// Machine hostname via the `hostname` command, empty if unavailable.
pub fn hostname() -> String {
    process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|out| {
            if out.status.success() {
                String::from_utf8(out.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_default()
}

/// True when `HARVEST_DOCKER=yes`: process lifecycle belongs to the container runtime.
pub fn is_docker() -> bool {
    std::env::var("HARVEST_DOCKER").map(|v| v == "yes").unwrap_or(false)
}

/// Microseconds as f64, the unit of the metadata timing metrics.
pub fn micros(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_style_durations() {
        assert_eq!(parse_duration("180s").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn micros_of_duration() {
        assert!((micros(Duration::from_millis(3)) - 3000.0).abs() < 1e-9);
    }
}
