//! Columnar store of metrics and instances.
//!
//! A `Matrix` is the single data contract between collectors, plugins and
//! exporters:
//!
//! ```text
//!              instance 0   instance 1   instance 2
//!   row 0  ops      42.5        NaN         17.0       <- scalar metric
//!   row 1  lat[r]    0.3        0.1          0.2       <- array metric (size 2)
//!   row 2  lat[w]    0.9        0.4          NaN
//! ```
//!
//! Rows belong to metrics (a scalar takes one row, an array metric takes
//! `size` contiguous rows); columns belong to instances. `NaN` marks an
//! absent value.

mod labels;
mod metric;
mod ops;

pub use labels::LabelMap;
pub use metric::{Metric, Property};

use std::collections::HashMap;

use crate::errors::{HarvestError, Result};

/// Which labels exporters promote to dimensions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportOptions {
    /// Labels rendered on every metric line.
    pub instance_keys: Vec<String>,
    /// Labels rendered only on the `_labels` line (or as fields).
    pub instance_labels: Vec<String>,
    /// Render every instance label that is not a key.
    pub include_all_labels: bool,
}

/// One column of the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub(crate) index: usize,
    pub labels: LabelMap,
    pub exportable: bool,
}

impl Instance {
    fn new(index: usize) -> Self {
        Self {
            index,
            labels: LabelMap::new(),
            exportable: true,
        }
    }

    /// Column offset in the data array.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self, key: &str) -> &str {
        self.labels.value(key)
    }
}

#[derive(Debug, Clone)]
pub struct Matrix {
    pub object: String,
    pub collector: String,
    pub plugin: String,
    /// Matrices marked non-exportable are kept for plugins only.
    pub exportable: bool,
    pub global_labels: LabelMap,
    pub export_options: ExportOptions,
    /// Raw label name to display name, for collectors that map labels.
    pub labels: LabelMap,
    metric_order: Vec<String>,
    metrics: HashMap<String, Metric>,
    instance_order: Vec<String>,
    instances: HashMap<String, Instance>,
    stride: usize,
    data: Vec<Vec<f64>>,
    initialized: bool,
}

impl Matrix {
    pub fn new(collector: impl Into<String>, object: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            collector: collector.into(),
            plugin: plugin.into(),
            exportable: true,
            global_labels: LabelMap::new(),
            export_options: ExportOptions::default(),
            labels: LabelMap::new(),
            metric_order: Vec::new(),
            metrics: HashMap::new(),
            instance_order: Vec::new(),
            instances: HashMap::new(),
            stride: 0,
            data: Vec::new(),
            initialized: false,
        }
    }

    /// Copy of the schema (metrics, instances, labels) with unallocated data.
    pub fn clone_without_data(&self) -> Matrix {
        let mut m = self.clone_schema(true, true);
        m.data = Vec::new();
        m.initialized = false;
        m
    }

    /// Copy of the descriptors; metrics and/or instances may be left out.
    pub fn clone_schema(&self, with_metrics: bool, with_instances: bool) -> Matrix {
        let mut m = Matrix::new(&self.collector, &self.object, &self.plugin);
        m.exportable = self.exportable;
        m.global_labels = self.global_labels.clone();
        m.export_options = self.export_options.clone();
        m.labels = self.labels.clone();
        if with_metrics {
            m.metric_order = self.metric_order.clone();
            m.metrics = self.metrics.clone();
            m.stride = self.stride;
        }
        if with_instances {
            m.instance_order = self.instance_order.clone();
            m.instances = self.instances.clone();
        }
        m
    }

    pub fn set_global_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.global_labels.set(key, value);
    }

    // ---------------------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------------------

    /// Adds a scalar metric.
    pub fn add_metric(&mut self, key: &str, display: &str) -> Result<&mut Metric> {
        self.insert_metric(key, Metric::new(display, Vec::new(), Vec::new()))
    }

    /// Adds an array metric spanning `len(labels) * max(1, len(sub_labels))` rows.
    pub fn add_array_metric(
        &mut self,
        key: &str,
        display: &str,
        labels: Vec<String>,
        sub_labels: Vec<String>,
    ) -> Result<&mut Metric> {
        if labels.is_empty() {
            return Err(HarvestError::Matrix(format!(
                "array metric [{}] without labels",
                key
            )));
        }
        self.insert_metric(key, Metric::new(display, labels, sub_labels))
    }

    fn insert_metric(&mut self, key: &str, mut metric: Metric) -> Result<&mut Metric> {
        if self.metrics.contains_key(key) {
            return Err(HarvestError::Duplicate(format!("metric [{}]", key)));
        }
        metric.index = self.stride;
        let size = metric.size();
        self.stride += size;
        if self.initialized {
            let width = self.instance_order.len();
            for _ in 0..size {
                self.data.push(vec![f64::NAN; width]);
            }
        }
        self.metric_order.push(key.to_string());
        Ok(self.metrics.entry(key.to_string()).or_insert(metric))
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(key)
    }

    pub fn has_metric(&self, key: &str) -> bool {
        self.metrics.contains_key(key)
    }

    /// Metrics in insertion (row) order.
    pub fn metrics(&self) -> impl Iterator<Item = (&str, &Metric)> {
        self.metric_order
            .iter()
            .filter_map(|k| self.metrics.get(k).map(|m| (k.as_str(), m)))
    }

    pub fn metric_keys(&self) -> &[String] {
        &self.metric_order
    }

    pub fn metric_count(&self) -> usize {
        self.metric_order.len()
    }

    /// Total number of rows.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Removes a metric and compacts the rows below it.
    pub fn remove_metric(&mut self, key: &str) -> Option<Metric> {
        let metric = self.metrics.remove(key)?;
        self.metric_order.retain(|k| k != key);
        let size = metric.size();
        for m in self.metrics.values_mut() {
            if m.index > metric.index {
                m.index -= size;
            }
        }
        self.stride -= size;
        if self.initialized {
            self.data.drain(metric.index..metric.index + size);
        }
        Some(metric)
    }

    // ---------------------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------------------

    pub fn add_instance(&mut self, key: &str) -> Result<&mut Instance> {
        if self.instances.contains_key(key) {
            return Err(HarvestError::Duplicate(format!("instance [{}]", key)));
        }
        let index = self.instance_order.len();
        if self.initialized {
            for row in &mut self.data {
                row.push(f64::NAN);
            }
        }
        self.instance_order.push(key.to_string());
        Ok(self
            .instances
            .entry(key.to_string())
            .or_insert(Instance::new(index)))
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    pub fn has_instance(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    /// Instances in column order.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.instance_order
            .iter()
            .filter_map(|k| self.instances.get(k).map(|i| (k.as_str(), i)))
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.values_mut()
    }

    pub fn instance_keys(&self) -> &[String] {
        &self.instance_order
    }

    pub fn instance_count(&self) -> usize {
        self.instance_order.len()
    }

    /// Removes an instance and compacts the columns to its right.
    pub fn remove_instance(&mut self, key: &str) -> Option<Instance> {
        let instance = self.instances.remove(key)?;
        self.instance_order.remove(instance.index);
        for i in self.instances.values_mut() {
            if i.index > instance.index {
                i.index -= 1;
            }
        }
        if self.initialized {
            for row in &mut self.data {
                row.remove(instance.index);
            }
        }
        Some(instance)
    }

    /// Drops every instance, keeping the metric schema.
    pub fn purge_instances(&mut self) {
        self.instance_order.clear();
        self.instances.clear();
        for row in &mut self.data {
            row.clear();
        }
    }

    // ---------------------------------------------------------------------------
    // Data
    // ---------------------------------------------------------------------------

    /// Allocates `stride x instances` cells filled with NaN.
    pub fn init_data(&mut self) -> Result<()> {
        if self.stride == 0 {
            return Err(HarvestError::EmptyMatrix(format!(
                "[{}] has no metrics",
                self.object
            )));
        }
        if self.instance_order.is_empty() {
            return Err(HarvestError::EmptyMatrix(format!(
                "[{}] has no instances",
                self.object
            )));
        }
        let width = self.instance_order.len();
        self.data = vec![vec![f64::NAN; width]; self.stride];
        self.initialized = true;
        Ok(())
    }

    /// Re-zeroes (NaN) the data for a new poll, keeping the schema.
    pub fn reset(&mut self) -> Result<()> {
        self.init_data()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn cell(&self, metric: &str, instance: &str) -> Result<(usize, usize)> {
        if !self.initialized {
            return Err(HarvestError::Matrix(format!(
                "[{}] data not initialized",
                self.object
            )));
        }
        let m = self
            .metrics
            .get(metric)
            .ok_or_else(|| HarvestError::Matrix(format!("unknown metric [{}]", metric)))?;
        let i = self
            .instances
            .get(instance)
            .ok_or_else(|| HarvestError::Matrix(format!("unknown instance [{}]", instance)))?;
        Ok((m.index, i.index))
    }

    pub fn set_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        let (row, col) = self.cell(metric, instance)?;
        self.data[row][col] = value;
        Ok(())
    }

    /// Parses `value` as a number and stores it.
    pub fn set_value_str(&mut self, metric: &str, instance: &str, value: &str) -> Result<()> {
        let v = value.trim().parse::<f64>().map_err(|_| {
            HarvestError::Parse(format!("[{}] value [{}] is not numeric", metric, value))
        })?;
        self.set_value(metric, instance, v)
    }

    pub fn set_nan(&mut self, metric: &str, instance: &str) -> Result<()> {
        self.set_value(metric, instance, f64::NAN)
    }

    /// Value of a scalar metric (or first element of an array), `None` if absent.
    pub fn get_value(&self, metric: &str, instance: &str) -> Option<f64> {
        let (row, col) = self.cell(metric, instance).ok()?;
        let v = self.data[row][col];
        (!v.is_nan()).then_some(v)
    }

    /// Writes all elements of an array metric for one instance.
    pub fn set_array_values(&mut self, metric: &str, instance: &str, values: &[f64]) -> Result<()> {
        let (row, col) = self.cell(metric, instance)?;
        let size = self.metrics[metric].size();
        if values.len() != size {
            return Err(HarvestError::Matrix(format!(
                "[{}] expected {} values, got {}",
                metric,
                size,
                values.len()
            )));
        }
        for (offset, v) in values.iter().enumerate() {
            self.data[row + offset][col] = *v;
        }
        Ok(())
    }

    pub fn get_array_values(&self, metric: &str, instance: &str) -> Option<Vec<f64>> {
        let (row, col) = self.cell(metric, instance).ok()?;
        let size = self.metrics[metric].size();
        Some((row..row + size).map(|r| self.data[r][col]).collect())
    }

    /// Raw cell access by row and column; `None` for NaN or out of range.
    pub fn value_at(&self, row: usize, col: usize) -> Option<f64> {
        let v = *self.data.get(row)?.get(col)?;
        (!v.is_nan()).then_some(v)
    }

    pub fn set_value_at(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let cell = self
            .data
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or_else(|| HarvestError::Matrix(format!("cell [{},{}] out of range", row, col)))?;
        *cell = value;
        Ok(())
    }

    pub fn row(&self, row: usize) -> Option<&[f64]> {
        self.data.get(row).map(Vec::as_slice)
    }

    /// Checks the shape invariants: one row per metric element, one cell per instance.
    pub fn is_consistent(&self) -> bool {
        let rows: usize = self.metrics.values().map(Metric::size).sum();
        if rows != self.stride || self.metric_order.len() != self.metrics.len() {
            return false;
        }
        if self.instance_order.len() != self.instances.len() {
            return false;
        }
        for (pos, key) in self.instance_order.iter().enumerate() {
            if self.instances.get(key).map(|i| i.index) != Some(pos) {
                return false;
            }
        }
        let mut next = 0;
        for key in &self.metric_order {
            let m = &self.metrics[key];
            if m.index != next {
                return false;
            }
            next += m.size();
        }
        if self.initialized {
            self.data.len() == self.stride
                && self
                    .data
                    .iter()
                    .all(|r| r.len() == self.instance_order.len())
        } else {
            true
        }
    }
}
