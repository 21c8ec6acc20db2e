//! Rendered lines per matrix, replaced on every export and dropped once
//! they are older than `cache_max_keep`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::matrix::Matrix;

pub const DEFAULT_MAX_KEEP: Duration = Duration::from_secs(300);

struct Entry {
    collector: String,
    object: String,
    lines: Vec<String>,
    updated: Instant,
}

/// Collector → object → metric names, for the `/` overview page.
#[derive(Debug, Default, PartialEq)]
pub struct Overview {
    pub collectors: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl Overview {
    pub fn object_count(&self) -> usize {
        self.collectors.values().map(BTreeMap::len).sum()
    }

    pub fn metric_count(&self) -> usize {
        self.collectors
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeSet::len)
            .sum()
    }
}

pub struct Cache {
    entries: HashMap<String, Entry>,
    max_keep: Duration,
}

/// Cache key of a matrix. Metadata matrices of different collectors share
/// collector and object names, so their target and instances are added.
pub fn cache_key(data: &Matrix) -> String {
    let mut key = format!("{}.{}.{}", data.collector, data.plugin, data.object);
    if data.object.starts_with("metadata_") {
        key.push('.');
        key.push_str(data.global_labels.value("object"));
        for k in data.instance_keys() {
            key.push('.');
            key.push_str(k);
        }
    }
    key
}

impl Cache {
    pub fn new(max_keep: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_keep,
        }
    }

    /// Replaces the lines stored under `key`; last writer wins.
    pub fn put(&mut self, key: String, data: &Matrix, lines: Vec<String>, now: Instant) {
        self.entries.insert(
            key,
            Entry {
                collector: data.collector.clone(),
                object: data.object.clone(),
                lines,
                updated: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries not refreshed within `max_keep` of `now`.
    pub fn expire(&mut self, now: Instant) {
        let max_keep = self.max_keep;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.updated) <= max_keep);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "expired cache entries");
        }
    }

    /// Exposition text of every entry, in key order. `# HELP`/`# TYPE`
    /// pairs are written once per metric name across all entries.
    pub fn write_all(&self) -> (String, usize) {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        let mut seen = HashSet::new();
        let mut out = String::new();
        let mut count = 0;
        for key in keys {
            let lines = &self.entries[key].lines;
            let mut i = 0;
            while i < lines.len() {
                let line = &lines[i];
                if let Some(rest) = line.strip_prefix("# ") {
                    let name = rest.split(' ').nth(1).unwrap_or("");
                    let is_new = seen.insert(name.to_string());
                    // a HELP line is followed by its TYPE line
                    let span = if rest.starts_with("HELP") && i + 1 < lines.len() { 2 } else { 1 };
                    if is_new {
                        for l in &lines[i..i + span] {
                            out.push_str(l);
                            out.push('\n');
                            count += 1;
                        }
                    }
                    i += span;
                    continue;
                }
                out.push_str(line);
                out.push('\n');
                count += 1;
                i += 1;
            }
        }
        (out, count)
    }

    pub fn overview(&self) -> Overview {
        let mut overview = Overview::default();
        for entry in self.entries.values() {
            if entry.object.starts_with("metadata_") {
                continue;
            }
            let names = overview
                .collectors
                .entry(entry.collector.clone())
                .or_default()
                .entry(entry.object.clone())
                .or_default();
            for line in &entry.lines {
                if line.starts_with('#') {
                    continue;
                }
                if let Some((name, _)) = line.split_once('{') {
                    names.insert(name.to_string());
                }
            }
        }
        overview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(collector: &str, object: &str) -> Matrix {
        Matrix::new(collector, object, "")
    }

    #[test]
    fn last_writer_wins_and_entries_expire() {
        let t0 = Instant::now();
        let mut c = Cache::new(Duration::from_secs(60));
        let m = matrix("Zapi", "volume");
        c.put(cache_key(&m), &m, vec!["volume_ops{a=\"1\"} 1".into()], t0);
        c.put(cache_key(&m), &m, vec!["volume_ops{a=\"1\"} 2".into()], t0);
        assert_eq!(c.len(), 1);
        assert_eq!(c.write_all().0, "volume_ops{a=\"1\"} 2\n");

        let n = matrix("Zapi", "node");
        c.put(cache_key(&n), &n, vec!["node_cpu{a=\"1\"} 1".into()], t0 + Duration::from_secs(50));
        c.expire(t0 + Duration::from_secs(100));
        assert_eq!(c.len(), 1);
        assert!(c.write_all().0.starts_with("node_cpu"));
    }

    #[test]
    fn meta_tags_written_once() {
        let t0 = Instant::now();
        let mut c = Cache::new(DEFAULT_MAX_KEEP);
        let lines = vec![
            "# HELP volume_ops Metric for volume".to_string(),
            "# TYPE volume_ops gauge".to_string(),
            "volume_ops{v=\"1\"} 1".to_string(),
        ];
        let a = matrix("Zapi", "volume");
        let b = matrix("ZapiPerf", "volume");
        c.put(cache_key(&a), &a, lines.clone(), t0);
        c.put(cache_key(&b), &b, lines, t0);
        let (text, count) = c.write_all();
        assert_eq!(count, 4);
        assert_eq!(text.matches("# TYPE").count(), 1);
    }

    #[test]
    fn metadata_keys_include_target() {
        let mut a = Matrix::new("Zapi", "metadata_collector", "metadata_collector");
        a.set_global_label("object", "Volume");
        let mut b = a.clone();
        b.set_global_label("object", "Lun");
        assert_ne!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn overview_skips_metadata() {
        let t0 = Instant::now();
        let mut c = Cache::new(DEFAULT_MAX_KEEP);
        let v = matrix("Zapi", "volume");
        c.put(cache_key(&v), &v, vec!["volume_size{v=\"1\"} 1".into(), "volume_used{v=\"1\"} 1".into()], t0);
        let md = Matrix::new("Zapi", "metadata_collector", "metadata_collector");
        c.put(cache_key(&md), &md, vec!["metadata_collector_poll_time{t=\"data\"} 1".into()], t0);
        let o = c.overview();
        assert_eq!(o.object_count(), 1);
        assert_eq!(o.metric_count(), 2);
    }
}
