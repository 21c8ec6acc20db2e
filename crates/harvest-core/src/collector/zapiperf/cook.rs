//! Cooked values from two raw polls.
//!
//! ```text
//!   raw      curr
//!   delta    curr - prev
//!   rate     (curr - prev) / (ts_curr - ts_prev)
//!   average  (curr - prev) / (base_curr - base_prev)
//!   percent  100 * average
//! ```
//!
//! Passes run in a fixed order: deltas of every non-raw counter (and the
//! timestamp), then average/percent against the already-delta'd bases,
//! then rates against the timestamp delta. A base counter that is itself
//! a rate is therefore divided only after its dependents used it.

use tracing::{debug, warn};

use crate::errors::{HarvestError, Result};
use crate::matrix::{Matrix, Property};

/// Name of the hidden per-instance timestamp metric.
pub const TIMESTAMP: &str = "timestamp";

/// Cooks `curr` in place against `prev`, the raw values of the previous
/// poll. Returns the number of metrics that could not be cooked and were
/// left as NaN.
pub fn cook(curr: &mut Matrix, prev: &Matrix) -> Result<usize> {
    let prev = prev.aligned_to(curr);
    let ts_row = curr
        .metric(TIMESTAMP)
        .map(|m| m.index())
        .ok_or_else(|| HarvestError::Matrix("missing timestamp metric".into()))?;
    curr.delta(&prev, ts_row)?;

    let mut deltas: Vec<std::ops::Range<usize>> = Vec::new();
    let mut dependents: Vec<String> = Vec::new();
    let mut rates: Vec<std::ops::Range<usize>> = Vec::new();
    for (key, metric) in curr.metrics() {
        if key == TIMESTAMP || metric.property == Property::Raw {
            continue;
        }
        deltas.push(metric.rows());
        if metric.property.requires_base() {
            dependents.push(key.to_string());
        }
        if metric.property == Property::Rate {
            rates.push(metric.rows());
        }
    }

    for rows in deltas {
        for row in rows {
            curr.delta(&prev, row)?;
        }
    }

    let mut skipped = 0;
    for key in &dependents {
        if !divide_by_base(curr, key)? {
            skipped += 1;
        }
    }

    for rows in rates {
        for row in rows {
            curr.divide(row, ts_row, 0.0)?;
        }
    }

    if skipped > 0 {
        debug!(skipped, "metrics without usable base counter");
    }
    Ok(skipped)
}

/// Divides an average/percent metric by its base. Returns `false` (and
/// leaves NaN) when the base is missing or its size does not fit.
fn divide_by_base(curr: &mut Matrix, key: &str) -> Result<bool> {
    let Some(metric) = curr.metric(key) else {
        return Ok(false);
    };
    let (rows, size, property, threshold) =
        (metric.rows(), metric.size(), metric.property, metric.threshold);
    let base = metric
        .base_counter
        .as_deref()
        .and_then(|b| curr.metric(b))
        .map(|b| (b.index(), b.size()));

    let Some((base_index, base_size)) = base else {
        warn!(metric = key, "base counter missing");
        set_rows_nan(curr, rows)?;
        return Ok(false);
    };

    if base_size == size {
        for (offset, row) in rows.clone().enumerate() {
            curr.divide(row, base_index + offset, threshold)?;
        }
    } else if base_size == 1 {
        for row in rows.clone() {
            curr.divide(row, base_index, threshold)?;
        }
    } else {
        warn!(metric = key, size, base_size, "array size does not match base counter");
        set_rows_nan(curr, rows)?;
        return Ok(false);
    }

    if property == Property::Percent {
        for row in rows {
            curr.mult_scalar(row, 100.0)?;
        }
    }
    Ok(true)
}

fn set_rows_nan(curr: &mut Matrix, rows: std::ops::Range<usize>) -> Result<()> {
    let width = curr.instance_count();
    for row in rows {
        for col in 0..width {
            curr.set_value_at(row, col, f64::NAN)?;
        }
    }
    Ok(())
}
