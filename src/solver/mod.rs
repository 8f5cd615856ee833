//! The fused pose solver: residual assembly, robust reweighting and the
//! iteratively-reweighted least-squares loop.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod assembler;
pub mod covariance;
pub mod vvs;

pub use assembler::{ContourAssembly, PointAssembly};
pub use vvs::{PoseSolver, SolveOutcome, RESIDUE_TOLERANCE};

/// A modality with fewer usable rows than this is excluded from the solve.
pub const MIN_MODALITY_ROWS: usize = 4;

/// Stepping strategy of the solve.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationMethod {
    /// Plain Gauss-Newton steps (fast convergence near the solution).
    #[default]
    GaussNewton,
    /// Damped steps with rejection/rollback (robust far from the solution).
    LevenbergMarquardt,
}

impl fmt::Display for OptimizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationMethod::GaussNewton => write!(f, "Gauss-Newton"),
            OptimizationMethod::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
        }
    }
}

/// Per-solve share of each modality in the fused weights.
///
/// Starts from the configured split; a modality with fewer than
/// [`MIN_MODALITY_ROWS`] usable rows is excluded outright (share 0) and the
/// other takes the full weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModalityShares {
    pub contour: f64,
    pub point: f64,
}

impl ModalityShares {
    /// Resolve the effective shares for one solve.
    pub fn resolve(
        configured_contour: f64,
        configured_point: f64,
        contour_rows: usize,
        point_rows: usize,
    ) -> Self {
        let mut shares = Self {
            contour: configured_contour,
            point: configured_point,
        };
        if contour_rows < MIN_MODALITY_ROWS {
            shares.contour = 0.0;
            shares.point = 1.0;
        }
        if point_rows < MIN_MODALITY_ROWS {
            shares.point = 0.0;
            shares.contour = 1.0;
        }
        shares
    }
}
