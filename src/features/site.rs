//! Sampled contour sites and their lifecycle state.

use nalgebra::Point2;

/// State of a contour site along a projected primitive.
///
/// Sites are produced by the external edge-sampling collaborator in `Normal`
/// state; the tracker only ever moves them to `EstimatorOutlier` when the
/// robust weights condemn them. Suppressed sites (low contrast, ambiguous
/// matches) arrive already flagged by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteState {
    /// Reliable measurement.
    #[default]
    Normal,
    /// Suppressed by the edge-sampling stage (contrast or matching failure).
    Suppressed,
    /// Down-weighted below the outlier threshold by the M-estimator.
    EstimatorOutlier,
}

/// One sampled point along a contour primitive, in normalized image
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourSite {
    /// Observed position in the current image, normalized coordinates.
    pub position: Point2<f64>,
    /// Reliability state carried across frames.
    pub state: SiteState,
}

impl ContourSite {
    /// A site in `Normal` state at the given normalized position.
    pub fn new(position: Point2<f64>) -> Self {
        Self {
            position,
            state: SiteState::Normal,
        }
    }

    /// A site with an explicit state.
    pub fn with_state(position: Point2<f64>, state: SiteState) -> Self {
        Self { position, state }
    }
}
