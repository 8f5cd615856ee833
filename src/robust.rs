//! Tukey M-estimator over a modality's residual vector.
//!
//! Weights follow the biweight influence function with a scale derived from
//! the median absolute deviation of the residual distribution, recomputed
//! every iteration, and floored by the configured noise threshold (expressed
//! in normalized image units). A weight of zero removes a row from the normal
//! equations entirely.

use nalgebra::DVector;
use tracing::trace;

/// 95% asymptotic efficiency constant for the Tukey biweight.
const TUKEY_C: f64 = 4.6851;

/// Consistency factor turning a MAD into a Gaussian sigma estimate.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Pose parameters constrained by the solve; enters the small-sample
/// correction of the scale estimate.
const POSE_DOF: usize = 6;

/// Robust weighting engine for one modality.
#[derive(Debug, Clone)]
pub struct TukeyEstimator {
    /// Scale floor in normalized image units (pixel threshold / focal length).
    threshold: f64,
}

impl TukeyEstimator {
    /// Create an estimator with the given scale floor.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compute one weight in `[0, 1]` per residual row.
    ///
    /// The scale is re-estimated from the current residual distribution:
    /// median-centered absolute deviations, MAD consistency factor and a
    /// small-sample correction, floored by the configured threshold. The
    /// iteration index only feeds the trace diagnostics; the statistics are
    /// recomputed from scratch each call.
    pub fn weights(&self, residuals: &DVector<f64>, iteration: usize, weights: &mut DVector<f64>) {
        let n = residuals.len();
        debug_assert_eq!(weights.len(), n);
        if n == 0 {
            return;
        }

        let center = median(residuals.as_slice());
        let deviations: Vec<f64> = residuals.iter().map(|r| (r - center).abs()).collect();
        let mad = median(&deviations);

        let correction = if n > POSE_DOF {
            1.0 + 5.0 / (n - POSE_DOF) as f64
        } else {
            1.0
        };
        let sigma = (MAD_TO_SIGMA * correction * mad).max(self.threshold);
        let c = TUKEY_C * sigma;

        trace!(
            iteration,
            rows = n,
            sigma,
            "tukey scale estimated from residual distribution"
        );

        for (i, deviation) in deviations.iter().enumerate() {
            weights[i] = if *deviation <= c {
                let u = deviation / c;
                let inner = 1.0 - u * u;
                inner * inner
            } else {
                0.0
            };
        }
    }
}

/// Mean absolute residual of a modality, tracked for diagnostics only.
pub fn mean_absolute(residuals: &DVector<f64>) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    residuals.iter().map(|r| r.abs()).sum::<f64>() / residuals.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}
