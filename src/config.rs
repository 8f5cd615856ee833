//! Tracker configuration surface.
//!
//! Owned by an external loader and consumed read-only by the solver. The
//! struct carries serde derives so callers can persist it; parsing and file
//! handling stay outside this crate.

use serde::{Deserialize, Serialize};

use crate::error::{TrackError, TrackResult};
use crate::solver::OptimizationMethod;

/// Configuration of the fused pose solve.
///
/// Defaults reproduce the reference behavior: Tukey thresholds of 2.0
/// image-plane units per modality, step gain 0.8, 200 iterations for the
/// fused solve and 30 for the point-only warm start, and a fixed 0.35/0.65
/// contour/point share split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tukey threshold for contour residuals, in image-plane (pixel) units.
    /// Normalized by the focal length before use.
    pub contour_threshold: f64,
    /// Tukey threshold for point residuals, in image-plane (pixel) units.
    pub point_threshold: f64,
    /// Step-size gain applied to every velocity increment.
    pub gain: f64,
    /// Iteration cap of the fused solve.
    pub max_iterations: usize,
    /// Iteration cap of the point-only warm-start solve.
    pub point_only_max_iterations: usize,
    /// Gauss-Newton or Levenberg-Marquardt stepping.
    pub method: OptimizationMethod,
    /// Share of the contour modality in the fused weights.
    pub contour_share: f64,
    /// Share of the point modality in the fused weights.
    pub point_share: f64,
    /// Compute the pose covariance after the solve.
    pub compute_covariance: bool,
    /// Estimated degrees of freedom; a `false` entry locks that component of
    /// the velocity `[vx, vy, vz, wx, wy, wz]`. All-true means the minimal
    /// parameterization and skips the twist projection entirely.
    pub dof_mask: [bool; 6],
    /// Distance to the image border, in pixels, under which a contour
    /// primitive is considered unreliable.
    pub border_margin: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            contour_threshold: 2.0,
            point_threshold: 2.0,
            gain: 0.8,
            max_iterations: 200,
            point_only_max_iterations: 30,
            method: OptimizationMethod::default(),
            contour_share: 0.35,
            point_share: 0.65,
            compute_covariance: false,
            dof_mask: [true; 6],
            border_margin: 10.0,
        }
    }
}

impl TrackerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the optimization method.
    pub fn with_method(mut self, method: OptimizationMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the step-size gain.
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Set the fused-solve iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the per-modality Tukey thresholds (pixel units).
    pub fn with_thresholds(mut self, contour: f64, point: f64) -> Self {
        self.contour_threshold = contour;
        self.point_threshold = point;
        self
    }

    /// Set the modality share split. Must sum to 1.
    pub fn with_shares(mut self, contour: f64, point: f64) -> Self {
        self.contour_share = contour;
        self.point_share = point;
        self
    }

    /// Enable or disable covariance computation.
    pub fn with_covariance(mut self, enabled: bool) -> Self {
        self.compute_covariance = enabled;
        self
    }

    /// Lock or free individual velocity components.
    pub fn with_dof_mask(mut self, mask: [bool; 6]) -> Self {
        self.dof_mask = mask;
        self
    }

    /// True when all six degrees of freedom are estimated.
    pub fn is_full_dof(&self) -> bool {
        self.dof_mask.iter().all(|&free| free)
    }

    /// Check the configuration for values the solver cannot work with.
    pub fn validate(&self) -> TrackResult<()> {
        if self.gain <= 0.0 {
            return Err(TrackError::InvalidConfig(format!(
                "gain must be positive, got {}",
                self.gain
            )));
        }
        if self.contour_threshold <= 0.0 || self.point_threshold <= 0.0 {
            return Err(TrackError::InvalidConfig(
                "robust thresholds must be positive".to_string(),
            ));
        }
        if self.max_iterations == 0 || self.point_only_max_iterations == 0 {
            return Err(TrackError::InvalidConfig(
                "iteration caps must be at least 1".to_string(),
            ));
        }
        let share_sum = self.contour_share + self.point_share;
        if self.contour_share < 0.0 || self.point_share < 0.0 || (share_sum - 1.0).abs() > 1e-9 {
            return Err(TrackError::InvalidConfig(format!(
                "modality shares must be non-negative and sum to 1, got {} + {}",
                self.contour_share, self.point_share
            )));
        }
        if self.border_margin < 0.0 {
            return Err(TrackError::InvalidConfig(
                "border margin must be non-negative".to_string(),
            ));
        }
        if !self.dof_mask.iter().any(|&free| free) {
            return Err(TrackError::InvalidConfig(
                "at least one degree of freedom must stay free".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.point_only_max_iterations, 30);
        assert_eq!(config.contour_share, 0.35);
        assert_eq!(config.point_share, 0.65);
        assert!(config.is_full_dof());
    }

    #[test]
    fn test_builder_chain() {
        let config = TrackerConfig::new()
            .with_method(OptimizationMethod::LevenbergMarquardt)
            .with_gain(0.5)
            .with_max_iterations(50)
            .with_shares(0.5, 0.5);
        assert!(config.validate().is_ok());
        assert_eq!(config.method, OptimizationMethod::LevenbergMarquardt);
        assert_eq!(config.gain, 0.5);
    }

    #[test]
    fn test_rejects_bad_shares() {
        let config = TrackerConfig::new().with_shares(0.4, 0.4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_gain_and_locked_everything() {
        assert!(TrackerConfig::new().with_gain(0.0).validate().is_err());
        assert!(TrackerConfig::new()
            .with_dof_mask([false; 6])
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_dof_detected() {
        let config = TrackerConfig::new().with_dof_mask([true, true, true, true, true, false]);
        assert!(config.validate().is_ok());
        assert!(!config.is_full_dof());
    }
}
