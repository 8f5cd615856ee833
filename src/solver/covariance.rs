//! Pose covariance of the converged estimate.

use nalgebra::{DMatrix, DVector, Matrix6};

use crate::error::{TrackError, TrackResult};

/// Estimate the 6x6 pose covariance from the last-accepted iteration.
///
/// Inputs are the unweighted stacked interaction matrix and residual plus the
/// final fused weights as a diagonal:
///
/// ```text
/// σ² = rᵀ W r / n        Σ = σ² · pinv(Jᵀ W J)
/// ```
pub fn pose_covariance(
    jacobian: &DMatrix<f64>,
    residual: &DVector<f64>,
    weights: &DVector<f64>,
) -> TrackResult<Matrix6<f64>> {
    let n = residual.len();
    if n == 0 {
        return Err(TrackError::InsufficientData { rows: 0 });
    }

    let weighted_residual = residual.component_mul(weights);
    let sigma2 = residual.dot(&weighted_residual) / n as f64;

    // Jᵀ W J without forming the full diagonal matrix
    let mut weighted_jacobian = jacobian.clone();
    for i in 0..n {
        let w = weights[i];
        for j in 0..6 {
            weighted_jacobian[(i, j)] *= w;
        }
    }
    let jtwj = jacobian.transpose() * weighted_jacobian;
    let inverse = jtwj
        .pseudo_inverse(6.0 * f64::EPSILON)
        .map_err(|e| TrackError::InteractionMatrix(format!("covariance inversion failed: {e}")))?;

    let scaled = inverse * sigma2;
    Ok(Matrix6::from_fn(|i, j| scaled[(i, j)]))
}
