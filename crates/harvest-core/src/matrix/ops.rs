//! Row-wise arithmetic used by the cooked-value engine.
//!
//! Every operation works on two matrices of identical shape (use
//! [`Matrix::aligned_to`] first). A NaN on either side yields NaN.

use crate::errors::{HarvestError, Result};

use super::Matrix;

impl Matrix {
    fn check_row(&self, row: usize) -> Result<()> {
        if !self.initialized || row >= self.stride {
            return Err(HarvestError::Matrix(format!(
                "[{}] row {} out of range",
                self.object, row
            )));
        }
        Ok(())
    }

    fn check_shape(&self, other: &Matrix) -> Result<()> {
        if self.stride != other.stride || self.instance_count() != other.instance_count() {
            return Err(HarvestError::Matrix(format!(
                "[{}] shape mismatch: {}x{} vs {}x{}",
                self.object,
                self.stride,
                self.instance_count(),
                other.stride,
                other.instance_count()
            )));
        }
        Ok(())
    }

    /// `self[row] -= prev[row]`. A negative result (counter reset) becomes NaN.
    pub fn delta(&mut self, prev: &Matrix, row: usize) -> Result<()> {
        self.check_shape(prev)?;
        self.check_row(row)?;
        prev.check_row(row)?;
        for (curr, before) in self.data[row].iter_mut().zip(&prev.data[row]) {
            *curr = match (curr.is_nan(), before.is_nan()) {
                (false, false) if *curr >= *before => *curr - *before,
                _ => f64::NAN,
            };
        }
        Ok(())
    }

    /// `self[row] /= self[base_row]`, NaN where the denominator is zero or
    /// below `threshold`.
    pub fn divide(&mut self, row: usize, base_row: usize, threshold: f64) -> Result<()> {
        self.check_row(row)?;
        self.check_row(base_row)?;
        if row == base_row {
            return Err(HarvestError::Matrix(format!(
                "[{}] row {} divided by itself",
                self.object, row
            )));
        }
        let base = self.data[base_row].clone();
        divide_slice(&mut self.data[row], &base, threshold);
        Ok(())
    }

    /// `self[row] /= other[other_row]` for two matrices of identical shape.
    pub fn divide_by(&mut self, other: &Matrix, row: usize, other_row: usize) -> Result<()> {
        self.check_shape(other)?;
        self.check_row(row)?;
        other.check_row(other_row)?;
        divide_slice(&mut self.data[row], &other.data[other_row], 0.0);
        Ok(())
    }

    /// `self[row] *= k`.
    pub fn mult_scalar(&mut self, row: usize, k: f64) -> Result<()> {
        self.check_row(row)?;
        for v in &mut self.data[row] {
            *v *= k;
        }
        Ok(())
    }

    /// Copy of `self` re-shaped to the metric rows and instance columns of
    /// `schema`. Cells missing in `self` become NaN.
    pub fn aligned_to(&self, schema: &Matrix) -> Matrix {
        let mut out = schema.clone_without_data();
        if out.init_data().is_err() {
            return out;
        }
        let columns: Vec<Option<usize>> = schema
            .instance_keys()
            .iter()
            .map(|k| self.instance(k).map(|i| i.index))
            .collect();
        for (key, metric) in schema.metrics() {
            let Some(src) = self.metric(key) else {
                continue;
            };
            if src.size() != metric.size() {
                continue;
            }
            for offset in 0..metric.size() {
                let (dst_row, src_row) = (metric.index + offset, src.index + offset);
                for (col, src_col) in columns.iter().enumerate() {
                    if let Some(c) = src_col
                        && let Some(v) = self.value_at(src_row, *c)
                    {
                        out.data[dst_row][col] = v;
                    }
                }
            }
        }
        out
    }

    /// True when both matrices have the same instance keys in the same columns.
    pub fn same_instances(&self, other: &Matrix) -> bool {
        self.instance_keys() == other.instance_keys()
    }
}

fn divide_slice(values: &mut [f64], base: &[f64], threshold: f64) {
    for (v, b) in values.iter_mut().zip(base) {
        *v = if v.is_nan() || b.is_nan() || *b == 0.0 || *b < threshold {
            f64::NAN
        } else {
            *v / *b
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_ticks() -> (Matrix, Matrix) {
        let mut prev = Matrix::new("ZapiPerf", "volume", "");
        prev.add_metric("ops", "ops").unwrap();
        prev.add_metric("total", "total").unwrap();
        prev.add_instance("a").unwrap();
        prev.add_instance("b").unwrap();
        prev.init_data().unwrap();
        let mut curr = prev.clone_without_data();
        curr.init_data().unwrap();
        (prev, curr)
    }

    #[test]
    fn delta_skips_nan_and_regression() {
        let (mut prev, mut curr) = two_ticks();
        prev.set_value("ops", "a", 100.0).unwrap();
        prev.set_value("ops", "b", 500.0).unwrap();
        curr.set_value("ops", "a", 150.0).unwrap();
        curr.set_value("ops", "b", 10.0).unwrap();
        curr.delta(&prev, 0).unwrap();
        assert_eq!(curr.get_value("ops", "a"), Some(50.0));
        assert_eq!(curr.get_value("ops", "b"), None);
    }

    #[test]
    fn divide_by_zero_is_nan() {
        let (_, mut curr) = two_ticks();
        curr.set_value("ops", "a", 10.0).unwrap();
        curr.set_value("total", "a", 0.0).unwrap();
        curr.set_value("ops", "b", 10.0).unwrap();
        curr.set_value("total", "b", 4.0).unwrap();
        curr.divide(0, 1, 0.0).unwrap();
        assert_eq!(curr.get_value("ops", "a"), None);
        assert_eq!(curr.get_value("ops", "b"), Some(2.5));
    }

    #[test]
    fn divide_threshold_suppresses() {
        let (_, mut curr) = two_ticks();
        curr.set_value("ops", "a", 10.0).unwrap();
        curr.set_value("total", "a", 5.0).unwrap();
        curr.divide(0, 1, 10.0).unwrap();
        assert_eq!(curr.get_value("ops", "a"), None);
    }

    #[test]
    fn mult_scalar_keeps_nan() {
        let (_, mut curr) = two_ticks();
        curr.set_value("ops", "a", 0.5).unwrap();
        curr.mult_scalar(0, 100.0).unwrap();
        assert_eq!(curr.get_value("ops", "a"), Some(50.0));
        assert_eq!(curr.get_value("ops", "b"), None);
    }

    #[test]
    fn aligned_to_maps_by_key() {
        let (mut prev, _) = two_ticks();
        prev.set_value("ops", "b", 7.0).unwrap();

        let mut curr = Matrix::new("ZapiPerf", "volume", "");
        curr.add_metric("ops", "ops").unwrap();
        curr.add_metric("total", "total").unwrap();
        curr.add_instance("c").unwrap();
        curr.add_instance("b").unwrap();
        curr.init_data().unwrap();

        let aligned = prev.aligned_to(&curr);
        assert!(aligned.same_instances(&curr));
        assert_eq!(aligned.get_value("ops", "b"), Some(7.0));
        assert_eq!(aligned.get_value("ops", "c"), None);
    }

    #[test]
    fn shape_mismatch_is_error() {
        let (prev, mut curr) = two_ticks();
        curr.add_instance("c").unwrap();
        assert!(curr.delta(&prev, 0).is_err());
    }
}
