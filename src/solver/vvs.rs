//! Fused iteratively-reweighted least-squares pose refinement.
//!
//! Both modalities' residual blocks are rebuilt at every iteration, robustly
//! reweighted, fused through the modality shares and solved as one stacked
//! weighted least-squares system. The velocity increment is composed with the
//! incremental pose through the exponential map, keeping the update on the
//! rigid-motion manifold. Under Levenberg-Marquardt, a step that increases
//! the mean squared residual is rejected: the damping grows tenfold, the
//! previous pose and buffers are restored exactly, and the iteration is spent
//! without a solve.

use nalgebra::{DMatrix, DVector, Matrix6};
use tracing::{debug, trace, warn};

use crate::camera::CameraIntrinsics;
use crate::config::TrackerConfig;
use crate::error::{TrackError, TrackResult};
use crate::features::contour::ContourFeatureSet;
use crate::features::points::PointFeatureSet;
use crate::manifold::{exp, velocity_twist, Pose, Velocity};
use crate::robust::{mean_absolute, TukeyEstimator};
use crate::solver::assembler::{ContourAssembly, PointAssembly};
use crate::solver::covariance::pose_covariance;
use crate::solver::{ModalityShares, OptimizationMethod, MIN_MODALITY_ROWS};

/// Convergence tolerance on the change of the weighted residual norm between
/// consecutive accepted iterations.
pub const RESIDUE_TOLERANCE: f64 = 1e-8;

/// Initial Levenberg-Marquardt damping.
const INITIAL_MU: f64 = 0.01;

/// Damping ceiling; exceeding it aborts the frame as diverged.
const MU_CEILING: f64 = 1.0;

/// Damping growth on rejection and relaxation divisor on acceptance.
const MU_FACTOR: f64 = 10.0;

/// Result of one frame's pose solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Refined pose `cMo`.
    pub pose: Pose,
    /// Incremental pose relative to the frame-start reference `c0`. Feeds a
    /// follow-up solve within the same frame (warm start, then fused).
    pub ct_tc0: Pose,
    /// Iterations spent, including rejected ones.
    pub iterations: usize,
    /// Accepted solve steps.
    pub accepted_steps: usize,
    /// Rejected Levenberg-Marquardt steps.
    pub rejected_steps: usize,
    /// Final weighted residual norm.
    pub residue: f64,
    /// Contour rows that entered the solve (0 when the modality was excluded).
    pub contour_rows: usize,
    /// Point rows that entered the solve (0 when the modality was excluded).
    pub point_rows: usize,
    /// Effective modality shares of this solve.
    pub shares: ModalityShares,
    /// Per-row M-estimator weights of the contour block.
    pub contour_weights: DVector<f64>,
    /// Final fused weights over the stacked rows (contour block first).
    pub fused_weights: DVector<f64>,
    /// Pose covariance, when requested.
    pub covariance: Option<Matrix6<f64>>,
}

/// Verdict of the Levenberg-Marquardt acceptance test.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LmVerdict {
    Accept,
    /// Step rejected; carries the grown damping factor.
    Reject { mu: f64 },
}

/// Acceptance test on the mean squared residual. Growth past the ceiling is
/// the divergence condition.
fn lm_acceptance(new_cost: f64, previous_cost: f64, mu: f64) -> TrackResult<LmVerdict> {
    if new_cost <= previous_cost {
        return Ok(LmVerdict::Accept);
    }
    let grown = mu * MU_FACTOR;
    if grown > MU_CEILING {
        return Err(TrackError::Diverged { mu: grown });
    }
    Ok(LmVerdict::Reject { mu: grown })
}

/// Mutable state threaded through one solve.
///
/// Keeps the `cMo = ctTc0 · c0Mo` invariant: `c0Mo` is frozen at solve start
/// and only the incremental part is composed with updates.
#[derive(Debug, Clone)]
struct SolveContext {
    c0_mo: Pose,
    ct_tc0: Pose,
    c_mo: Pose,
    mu: f64,
    residue: f64,
    residue_prev: f64,
    iteration: usize,
    accepted_steps: usize,
    rejected_steps: usize,
    c_mo_snapshot: Pose,
    ct_tc0_snapshot: Pose,
}

impl SolveContext {
    fn new(c0_mo: Pose, ct_tc0: Pose) -> Self {
        let c_mo = ct_tc0 * c0_mo;
        Self {
            c0_mo,
            ct_tc0,
            c_mo,
            mu: INITIAL_MU,
            residue: 0.0,
            residue_prev: -1.0,
            iteration: 0,
            accepted_steps: 0,
            rejected_steps: 0,
            c_mo_snapshot: c_mo,
            ct_tc0_snapshot: ct_tc0,
        }
    }

    fn snapshot_pose(&mut self) {
        self.c_mo_snapshot = self.c_mo;
        self.ct_tc0_snapshot = self.ct_tc0;
    }

    /// Restore the pose of the last accepted iteration, exactly.
    fn rollback_pose(&mut self) {
        self.c_mo = self.c_mo_snapshot;
        self.ct_tc0 = self.ct_tc0_snapshot;
    }

    /// Compose the velocity increment with the incremental pose.
    fn apply_velocity(&mut self, velocity: &Velocity) {
        self.ct_tc0 = exp(velocity).inverse() * self.ct_tc0;
        self.c_mo = self.ct_tc0 * self.c0_mo;
    }
}

/// Fused pose solver over both feature modalities.
pub struct PoseSolver<'a> {
    config: &'a TrackerConfig,
    camera: &'a CameraIntrinsics,
}

impl<'a> PoseSolver<'a> {
    pub fn new(config: &'a TrackerConfig, camera: &'a CameraIntrinsics) -> Self {
        Self { config, camera }
    }

    /// Run the IRLS loop from the frame reference `c0Mo` and the incremental
    /// pose `ctTc0` accumulated so far within this frame.
    ///
    /// The point groups' reference data is frozen in the `c0` frame, so a
    /// follow-up solve in the same frame (warm start, then fused) must pass
    /// the previous solve's `ct_tc0` rather than the identity. `contours`
    /// carries the contour set and the pyramid level to solve on; `None` runs
    /// a point-only solve (the warm-start mode). A failed solve leaves the
    /// caller's pose untouched.
    pub fn solve(
        &self,
        contours: Option<(&ContourFeatureSet, usize)>,
        image_size: (u32, u32),
        points: &PointFeatureSet,
        c0_mo: Pose,
        ct_tc0: Pose,
        max_iterations: usize,
    ) -> TrackResult<SolveOutcome> {
        self.config.validate()?;
        let starting_pose = ct_tc0 * c0_mo;

        let mut contour = match contours {
            Some((set, level)) => {
                let assembly = ContourAssembly::prepare(
                    set,
                    level,
                    &starting_pose,
                    self.camera,
                    image_size,
                    self.config.border_margin,
                )?;
                Some((set, level, assembly))
            }
            None => None,
        };
        let raw_contour_rows = contour.as_ref().map_or(0, |(_, _, a)| a.rows);
        let mut point_assembly = PointAssembly::prepare(points);
        let raw_point_rows = point_assembly.rows;

        if raw_contour_rows < MIN_MODALITY_ROWS && raw_point_rows < MIN_MODALITY_ROWS {
            return Err(TrackError::InsufficientData {
                rows: raw_contour_rows + raw_point_rows,
            });
        }

        // a deficient modality sits out the whole frame
        let contour_rows = if raw_contour_rows < MIN_MODALITY_ROWS {
            contour = None;
            0
        } else {
            raw_contour_rows
        };
        let point_rows = if raw_point_rows < MIN_MODALITY_ROWS {
            0
        } else {
            raw_point_rows
        };
        let shares = ModalityShares::resolve(
            self.config.contour_share,
            self.config.point_share,
            contour_rows,
            point_rows,
        );
        let total_rows = contour_rows + point_rows;

        let contour_estimator = TukeyEstimator::new(
            self.camera.normalize_threshold(self.config.contour_threshold),
        );
        let point_estimator =
            TukeyEstimator::new(self.camera.normalize_threshold(self.config.point_threshold));

        let mut w_contour = DVector::from_element(contour_rows, 1.0);
        let mut w_point = DVector::from_element(point_rows, 1.0);
        let mut fused = DVector::from_element(total_rows, 1.0);
        let mut error = DVector::zeros(total_rows);
        let mut weighted_error = DVector::zeros(total_rows);
        let mut jacobian = DMatrix::zeros(total_rows, 6);
        let mut error_snapshot = DVector::zeros(total_rows);
        let mut fused_snapshot = DVector::from_element(total_rows, 1.0);
        let mut covariance_jacobian: Option<DMatrix<f64>> = None;

        let lm = self.config.method == OptimizationMethod::LevenbergMarquardt;
        let mut ctx = SolveContext::new(c0_mo, ct_tc0);

        while (ctx.residue - ctx.residue_prev).abs() > RESIDUE_TOLERANCE
            && ctx.iteration < max_iterations
        {
            // fill pass at the current pose estimate
            if let Some((set, level, assembly)) = contour.as_mut() {
                assembly.fill(*set, *level, &ctx.c_mo)?;
                error.rows_mut(0, contour_rows).copy_from(&assembly.residual);
                jacobian
                    .rows_mut(0, contour_rows)
                    .copy_from(&assembly.jacobian);
            }
            if point_rows > 0 {
                point_assembly.fill(points, &ctx.ct_tc0)?;
                error
                    .rows_mut(contour_rows, point_rows)
                    .copy_from(&point_assembly.residual);
                jacobian
                    .rows_mut(contour_rows, point_rows)
                    .copy_from(&point_assembly.jacobian);
            }

            // Levenberg-Marquardt acceptance of the previous step
            if lm && ctx.iteration != 0 {
                let n = total_rows as f64;
                let verdict = lm_acceptance(
                    error.norm_squared() / n,
                    error_snapshot.norm_squared() / n,
                    ctx.mu,
                )?;
                if let LmVerdict::Reject { mu } = verdict {
                    warn!(
                        iteration = ctx.iteration,
                        mu, "step rejected, damping increased"
                    );
                    ctx.mu = mu;
                    ctx.rollback_pose();
                    error.copy_from(&error_snapshot);
                    fused.copy_from(&fused_snapshot);
                    ctx.rejected_steps += 1;
                    ctx.iteration += 1;
                    continue;
                }
            }

            // robust pass, independently per modality
            if contour_rows > 3 {
                let block = error.rows(0, contour_rows).into_owned();
                trace!(
                    mean_abs_contour = mean_absolute(&block),
                    "contour residual diagnostics"
                );
                contour_estimator.weights(&block, ctx.iteration, &mut w_contour);
            }
            if point_rows > 3 {
                let block = error.rows(contour_rows, point_rows).into_owned();
                trace!(
                    mean_abs_point = mean_absolute(&block),
                    "point residual diagnostics"
                );
                point_estimator.weights(&block, ctx.iteration, &mut w_point);
            }

            // fuse estimator weight, reliability factor and modality share
            if let Some((_, _, assembly)) = contour.as_ref() {
                for i in 0..contour_rows {
                    fused[i] = w_contour[i] * assembly.factors[i] * shares.contour;
                }
            }
            for i in 0..point_rows {
                fused[contour_rows + i] = w_point[i] * shares.point;
            }

            // weighted residual norm: the convergence statistic
            let mut num = 0.0;
            let mut den = 0.0;
            for i in 0..total_rows {
                num += fused[i] * error[i] * error[i];
                den += fused[i];
                weighted_error[i] = fused[i] * error[i];
            }
            ctx.residue_prev = ctx.residue;
            ctx.residue = if den > 0.0 { (num / den).sqrt() } else { 0.0 };

            if self.config.compute_covariance {
                covariance_jacobian = Some(self.covariance_system(&jacobian, &ctx.c_mo));
            }

            // scale the interaction matrix rows in place (IRLS)
            for i in 0..total_rows {
                for j in 0..6 {
                    jacobian[(i, j)] *= fused[i];
                }
            }

            let velocity = self.solve_normal_equations(&jacobian, &weighted_error, &ctx)?;

            if lm {
                if ctx.iteration != 0 {
                    ctx.mu /= MU_FACTOR;
                }
                error_snapshot.copy_from(&error);
                fused_snapshot.copy_from(&fused);
            }
            ctx.snapshot_pose();
            ctx.apply_velocity(&velocity);
            ctx.accepted_steps += 1;

            debug!(
                iteration = ctx.iteration,
                residue = ctx.residue,
                mu = ctx.mu,
                "iteration accepted"
            );
            ctx.iteration += 1;
        }

        let covariance = match (self.config.compute_covariance, covariance_jacobian) {
            (true, Some(system)) => Some(pose_covariance(&system, &error, &fused)?),
            _ => None,
        };

        Ok(SolveOutcome {
            pose: ctx.c_mo,
            ct_tc0: ctx.ct_tc0,
            iterations: ctx.iteration,
            accepted_steps: ctx.accepted_steps,
            rejected_steps: ctx.rejected_steps,
            residue: ctx.residue,
            contour_rows,
            point_rows,
            shares,
            contour_weights: w_contour,
            fused_weights: fused,
            covariance,
        })
    }

    /// Build the damped normal equations and solve for the velocity.
    fn solve_normal_equations(
        &self,
        weighted_jacobian: &DMatrix<f64>,
        weighted_error: &DVector<f64>,
        ctx: &SolveContext,
    ) -> TrackResult<Velocity> {
        let system: DMatrix<f64> = if self.config.is_full_dof() {
            weighted_jacobian.clone()
        } else {
            weighted_jacobian * self.object_frame_projection(&ctx.c_mo)
        };

        let mut jtj = system.transpose() * &system;
        if self.config.method == OptimizationMethod::LevenbergMarquardt {
            for d in 0..6 {
                jtj[(d, d)] += ctx.mu;
            }
        }
        let jtr = system.transpose() * weighted_error;

        let inverse = jtj
            .pseudo_inverse(6.0 * f64::EPSILON)
            .map_err(|e| TrackError::InteractionMatrix(format!("normal equations: {e}")))?;
        let solution = -(inverse * jtr) * self.config.gain;

        let velocity = if self.config.is_full_dof() {
            Velocity::from_column_slice(solution.as_slice())
        } else {
            // bring the object-frame increment back to the camera frame
            let twist = velocity_twist(&ctx.c_mo);
            twist * Velocity::from_column_slice(solution.as_slice())
        };
        Ok(velocity)
    }

    /// Projection `cVo · oJo` expressing the interaction matrix in the
    /// object frame with locked components zeroed.
    fn object_frame_projection(&self, c_mo: &Pose) -> DMatrix<f64> {
        let twist = velocity_twist(c_mo);
        let mut dof = Matrix6::<f64>::zeros();
        for (d, &free) in self.config.dof_mask.iter().enumerate() {
            if free {
                dof[(d, d)] = 1.0;
            }
        }
        let projection = twist * dof;
        DMatrix::from_fn(6, 6, |i, j| projection[(i, j)])
    }

    /// System matrix used for the covariance: the unweighted stacked
    /// interaction matrix, projected when the parameterization is not minimal.
    fn covariance_system(&self, jacobian: &DMatrix<f64>, c_mo: &Pose) -> DMatrix<f64> {
        if self.config.is_full_dof() {
            jacobian.clone()
        } else {
            jacobian * self.object_frame_projection(c_mo)
        }
    }
}
