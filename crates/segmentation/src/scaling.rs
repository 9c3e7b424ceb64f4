//! Zero-mean / unit-variance standardisation fitted on the current batch.

use audience_core::{SegmentationError, SegmentationResult};
use ndarray::Array2;

#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
    zero_variance: Vec<bool>,
}

impl StandardScaler {
    /// Fits per-column mean and population standard deviation. Zero-variance
    /// columns get a scale of 1, so they transform to all zeros.
    pub fn fit(data: &Array2<f64>) -> SegmentationResult<Self> {
        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return Err(SegmentationError::computation(
                "cannot standardise an empty feature matrix",
            ));
        }

        let mut means = Vec::with_capacity(cols);
        let mut scales = Vec::with_capacity(cols);
        let mut zero_variance = Vec::with_capacity(cols);
        for column in data.columns() {
            let mean = column.iter().sum::<f64>() / rows as f64;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / rows as f64;
            let std = var.sqrt();
            if !mean.is_finite() || !std.is_finite() {
                return Err(SegmentationError::computation(
                    "feature matrix contains non-finite values",
                ));
            }
            let degenerate = std <= f64::EPSILON * mean.abs().max(1.0);
            means.push(mean);
            scales.push(if degenerate { 1.0 } else { std });
            zero_variance.push(degenerate);
        }

        Ok(Self {
            means,
            scales,
            zero_variance,
        })
    }

    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut out = data.clone();
        for (j, mut column) in out.columns_mut().into_iter().enumerate() {
            let (mean, scale) = (self.means[j], self.scales[j]);
            column.mapv_inplace(|v| if self.zero_variance[j] { 0.0 } else { (v - mean) / scale });
        }
        out
    }

    pub fn fit_transform(data: &Array2<f64>) -> SegmentationResult<(Self, Array2<f64>)> {
        let scaler = Self::fit(data)?;
        let scaled = scaler.transform(data);
        Ok((scaler, scaled))
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn zero_variance_columns(&self) -> Vec<usize> {
        (0..self.zero_variance.len())
            .filter(|&j| self.zero_variance[j])
            .collect()
    }

    /// Fails when no column varies at all: every row is identical after
    /// scaling and there is nothing to separate.
    pub fn ensure_informative(&self) -> SegmentationResult<()> {
        if self.zero_variance.iter().all(|&z| z) {
            return Err(SegmentationError::computation(
                "all features have zero variance",
            ));
        }
        Ok(())
    }
}
