//! Per-frame orchestration of the hybrid solve.
//!
//! The tracker owns the pose and both feature sets. External collaborators
//! refresh the sets between frames through the mutable accessors (the point
//! tracker updates correspondences, the edge sampler re-seeds contour sites,
//! the visibility stage sets the culling flags); `track` then runs the
//! point-only warm start, the fused solve and the reconciliation pass.

use nalgebra::Matrix6;
use tracing::{debug, warn};

use crate::camera::CameraIntrinsics;
use crate::config::TrackerConfig;
use crate::error::TrackResult;
use crate::features::contour::ContourFeatureSet;
use crate::features::points::{PointFeatureSet, MIN_GROUP_POINTS};
use crate::manifold::Pose;
use crate::reconcile::{reconcile_contours, SITE_OUTLIER_THRESHOLD};
use crate::solver::PoseSolver;

/// Result of one tracked frame.
#[derive(Debug, Clone)]
pub struct TrackSummary {
    /// Refined pose `cMo`.
    pub pose: Pose,
    /// Iterations of the fused solve.
    pub iterations: usize,
    /// Final weighted residual norm of the fused solve.
    pub residue: f64,
    /// The point-feature collaborator requests a full re-initialization.
    pub needs_reinit: bool,
    /// Pose covariance, when enabled in the configuration.
    pub covariance: Option<Matrix6<f64>>,
}

/// Frame-sequential hybrid tracker: one fused solve per frame, no overlap.
pub struct HybridTracker {
    config: TrackerConfig,
    camera: CameraIntrinsics,
    contours: ContourFeatureSet,
    points: PointFeatureSet,
    c_mo: Pose,
}

impl HybridTracker {
    /// Create a tracker with validated configuration.
    pub fn new(
        config: TrackerConfig,
        camera: CameraIntrinsics,
        pyramid_levels: usize,
    ) -> TrackResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            camera,
            contours: ContourFeatureSet::new(pyramid_levels),
            points: PointFeatureSet::new(),
            c_mo: Pose::identity(),
        })
    }

    /// Current pose estimate.
    pub fn pose(&self) -> Pose {
        self.c_mo
    }

    /// Seed the pose for the next frame (initialization or external re-seed).
    pub fn set_pose(&mut self, pose: Pose) {
        self.c_mo = pose;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    pub fn contours(&self) -> &ContourFeatureSet {
        &self.contours
    }

    /// Contour boundary for the edge-sampling/culling collaborators.
    pub fn contours_mut(&mut self) -> &mut ContourFeatureSet {
        &mut self.contours
    }

    pub fn points(&self) -> &PointFeatureSet {
        &self.points
    }

    /// Point boundary for the external point tracker.
    pub fn points_mut(&mut self) -> &mut PointFeatureSet {
        &mut self.points
    }

    /// Drop all features and reset the pose; the caller re-populates the
    /// sets from a fresh model pass before tracking again.
    pub fn reset(&mut self) {
        self.contours.clear();
        self.points.clear();
        self.c_mo = Pose::identity();
    }

    /// Track one frame: warm-start on points, fused solve, reconciliation.
    ///
    /// Feature sets must have been refreshed for this frame by their external
    /// collaborators. Errors are frame-fatal: the pose keeps the value of the
    /// last solve that succeeded this frame (the pre-frame value when even
    /// the warm start did not run) and the caller decides between a retry
    /// and a re-initialization.
    pub fn track(&mut self, image_size: (u32, u32)) -> TrackResult<TrackSummary> {
        let solver = PoseSolver::new(&self.config, &self.camera);

        // the frame reference: point-group data was frozen relative to the
        // pose the frame starts from, and the incremental transform threads
        // through every solve of this frame
        let c0_mo = self.c_mo;
        let mut ct_tc0 = Pose::identity();

        // point-only warm start, mirroring the dedicated sub-solve with its
        // shorter iteration cap; a failure here is not fatal because the
        // fused solve below surfaces every abort path itself
        if self.points.usable_point_count() >= MIN_GROUP_POINTS {
            match solver.solve(
                None,
                image_size,
                &self.points,
                c0_mo,
                ct_tc0,
                self.config.point_only_max_iterations,
            ) {
                Ok(outcome) => {
                    debug!(
                        iterations = outcome.iterations,
                        residue = outcome.residue,
                        "point-only warm start"
                    );
                    ct_tc0 = outcome.ct_tc0;
                    self.c_mo = outcome.pose;
                }
                Err(error) => {
                    warn!(%error, "point-only warm start failed, fused solve continues");
                }
            }
        }

        let outcome = solver.solve(
            Some((&self.contours, 0)),
            image_size,
            &self.points,
            c0_mo,
            ct_tc0,
            self.config.max_iterations,
        )?;
        self.c_mo = outcome.pose;

        if outcome.contour_rows > 0 {
            reconcile_contours(&mut self.contours, 0, outcome.contour_weights.as_slice());
        }

        let needs_reinit = if outcome.point_rows > 0 {
            let point_block = &outcome.fused_weights.as_slice()[outcome.contour_rows..];
            self.points
                .apply_weights(point_block, outcome.shares.point, SITE_OUTLIER_THRESHOLD)
        } else {
            // the point collaborator is configured but starved this frame
            !self.points.groups().is_empty()
        };

        Ok(TrackSummary {
            pose: self.c_mo,
            iterations: outcome.iterations,
            residue: outcome.residue,
            needs_reinit,
            covariance: outcome.covariance,
        })
    }
}
