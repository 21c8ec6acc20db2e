use std::fmt;
use std::str::FromStr;

use crate::errors::HarvestError;

/// How a raw counter is cooked into an exported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Property {
    #[default]
    Raw,
    Delta,
    Rate,
    Average,
    Percent,
}

impl Property {
    /// Average and percent counters are divided by a base counter.
    pub fn requires_base(self) -> bool {
        matches!(self, Property::Average | Property::Percent)
    }

    /// Parses a ZAPI `properties` string such as `"rate,no-zero-values"`.
    ///
    /// Returns `None` for string counters and unknown properties.
    pub fn from_counter_properties(props: &str) -> Option<Property> {
        let props = props.to_lowercase();
        let has = |p: &str| props.split(',').any(|x| x.trim() == p);
        if has("string") {
            None
        } else if has("raw") {
            Some(Property::Raw)
        } else if has("delta") {
            Some(Property::Delta)
        } else if has("rate") {
            Some(Property::Rate)
        } else if has("average") {
            Some(Property::Average)
        } else if has("percent") {
            Some(Property::Percent)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Property::Raw => "raw",
            Property::Delta => "delta",
            Property::Rate => "rate",
            Property::Average => "average",
            Property::Percent => "percent",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Property {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(Property::Raw),
            "delta" => Ok(Property::Delta),
            "rate" => Ok(Property::Rate),
            "average" => Ok(Property::Average),
            "percent" => Ok(Property::Percent),
            other => Err(HarvestError::InvalidParam(format!("property [{}]", other))),
        }
    }
}

/// Descriptor of one metric row (scalar) or row span (array).
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub(crate) index: usize,
    /// Display name used by exporters.
    pub name: String,
    pub enabled: bool,
    pub exportable: bool,
    pub property: Property,
    pub base_counter: Option<String>,
    pub unit: Option<String>,
    /// Denominator below which average/percent values are suppressed (NaN).
    pub threshold: f64,
    /// Free-text description, rendered as `# HELP` when enabled.
    pub comment: Option<String>,
    /// Exposition type, rendered as `# TYPE` when enabled.
    pub metric_type: Option<String>,
    pub(crate) labels: Vec<String>,
    pub(crate) sub_labels: Vec<String>,
}

impl Metric {
    pub(crate) fn new(name: impl Into<String>, labels: Vec<String>, sub_labels: Vec<String>) -> Self {
        Self {
            index: 0,
            name: name.into(),
            enabled: true,
            exportable: true,
            property: Property::Raw,
            base_counter: None,
            unit: None,
            threshold: 0.0,
            comment: None,
            metric_type: None,
            labels,
            sub_labels,
        }
    }

    /// Starting row in the data array.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_scalar(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of rows: 1 for scalars, `len(labels) * max(1, len(sub_labels))` for arrays.
    pub fn size(&self) -> usize {
        if self.labels.is_empty() {
            1
        } else {
            self.labels.len() * self.sub_labels.len().max(1)
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn sub_labels(&self) -> &[String] {
        &self.sub_labels
    }

    /// Label pair of the `offset`-th element of an array metric.
    ///
    /// The second element is set only for two-dimensional arrays.
    pub fn element_labels(&self, offset: usize) -> Option<(&str, Option<&str>)> {
        if self.labels.is_empty() || offset >= self.size() {
            return None;
        }
        if self.sub_labels.is_empty() {
            return Some((self.labels[offset].as_str(), None));
        }
        let inner = self.sub_labels.len();
        Some((
            self.labels[offset / inner].as_str(),
            Some(self.sub_labels[offset % inner].as_str()),
        ))
    }

    pub fn rows(&self) -> std::ops::Range<usize> {
        self.index..self.index + self.size()
    }
}
