//! Residual assembly: flattening per-feature blocks into the stacked
//! per-modality system.
//!
//! A solve builds each modality's assembly once (row count, per-primitive
//! offsets, attenuation factors) and refills the interaction-matrix/residual
//! blocks at every iteration. Offsets are computed a single time so the
//! attenuation and fill passes share one indexing step, and row order is the
//! stable primitive insertion order: the row-to-feature mapping is positional.

use nalgebra::{DMatrix, DVector};

use crate::camera::CameraIntrinsics;
use crate::error::TrackResult;
use crate::features::contour::ContourFeatureSet;
use crate::features::points::PointFeatureSet;
use crate::features::site::SiteState;
use crate::manifold::Pose;

/// Attenuation for a primitive whose governing face just entered the
/// visible set, and for sites flagged suspect by earlier passes.
const FACTOR_UNSETTLED: f64 = 0.2;

/// Attenuation for a primitive projecting near the image border.
const FACTOR_BORDER: f64 = 0.1;

/// The contour modality's stacked block for one solve.
#[derive(Debug, Clone)]
pub struct ContourAssembly {
    /// `(primitive index, row offset, row count)` for every active primitive.
    spans: Vec<(usize, usize, usize)>,
    /// Total contour rows.
    pub rows: usize,
    /// Per-row reliability attenuation, fixed for the whole solve.
    pub factors: DVector<f64>,
    /// Stacked interaction matrix (rows x 6), refilled each iteration.
    pub jacobian: DMatrix<f64>,
    /// Stacked residuals, refilled each iteration.
    pub residual: DVector<f64>,
}

impl ContourAssembly {
    /// Row-count and attenuation passes at the solve's starting pose.
    pub fn prepare(
        set: &ContourFeatureSet,
        level: usize,
        pose: &Pose,
        camera: &CameraIntrinsics,
        image_size: (u32, u32),
        border_margin: f64,
    ) -> TrackResult<Self> {
        set.check_level(level)?;

        let spans = set.active_spans(level);
        let rows = spans.last().map_or(0, |&(_, offset, count)| offset + count);

        let mut factors = DVector::from_element(rows, 1.0);
        for &(index, offset, _) in &spans {
            let primitive = &set.primitives()[index];
            let fac = if primitive.face_appearing {
                FACTOR_UNSETTLED
            } else if primitive.near_border(pose, camera, image_size, border_margin) {
                FACTOR_BORDER
            } else {
                1.0
            };
            for (i, state) in primitive.row_states(level).iter().enumerate() {
                factors[offset + i] = if *state != SiteState::Normal {
                    FACTOR_UNSETTLED
                } else {
                    fac
                };
            }
        }

        Ok(Self {
            spans,
            rows,
            factors,
            jacobian: DMatrix::zeros(rows, 6),
            residual: DVector::zeros(rows),
        })
    }

    /// Fill pass: recompute every active primitive's block at the candidate
    /// pose and copy it at the primitive's assigned offset.
    pub fn fill(&mut self, set: &ContourFeatureSet, level: usize, pose: &Pose) -> TrackResult<()> {
        for &(index, offset, _) in &self.spans {
            set.primitives()[index].fill(level, pose, &mut self.jacobian, &mut self.residual, offset)?;
        }
        Ok(())
    }
}

/// The point modality's stacked block for one solve.
#[derive(Debug, Clone)]
pub struct PointAssembly {
    /// Total point rows (2 per usable tracked point).
    pub rows: usize,
    /// Stacked interaction matrix (rows x 6), refilled each iteration.
    pub jacobian: DMatrix<f64>,
    /// Stacked residuals, refilled each iteration.
    pub residual: DVector<f64>,
}

impl PointAssembly {
    /// Size the block from the current usable groups.
    pub fn prepare(set: &PointFeatureSet) -> Self {
        let rows = set.row_count();
        Self {
            rows,
            jacobian: DMatrix::zeros(rows, 6),
            residual: DVector::zeros(rows),
        }
    }

    /// Fill pass: rebuild every usable group's block from the incremental
    /// pose `ctTc0`.
    pub fn fill(&mut self, set: &PointFeatureSet, ct_tc0: &Pose) -> TrackResult<()> {
        set.fill(ct_tc0, &mut self.jacobian, &mut self.residual)
    }
}
