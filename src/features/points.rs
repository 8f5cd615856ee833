//! Sparse point correspondences grouped by surface patch or cylinder.
//!
//! The external point tracker refreshes the groups every frame; the solver
//! only consumes their residual/interaction blocks, rebuilt per iteration
//! from the incremental pose `ctTc0`. Planar groups predict their points
//! through the Euclidean homography of their reference plane; cylindrical
//! groups re-project per-point 3D anchors directly. Every tracked point
//! contributes two residual rows.

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, Vector3};

use crate::error::{TrackError, TrackResult};
use crate::features::point_feature_rows;
use crate::manifold::Pose;

/// A group with fewer currently-tracked points than this contributes zero
/// rows for the frame.
pub const MIN_GROUP_POINTS: usize = 4;

/// Depth below which a predicted point is considered degenerate.
const MIN_DEPTH: f64 = 1e-9;

/// A correspondence on a planar patch: normalized coordinates in the
/// reference view (frozen at solve start) and in the current view.
#[derive(Debug, Clone, Copy)]
pub struct TrackedPoint {
    pub reference: Point2<f64>,
    pub current: Point2<f64>,
}

/// A correspondence on a cylinder: 3D anchor in the frozen camera frame and
/// the current normalized observation.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredPoint {
    pub anchor: Point3<f64>,
    pub current: Point2<f64>,
}

/// Geometry backing a point group.
#[derive(Debug, Clone)]
pub enum GroupGeometry {
    /// Points on a plane `n₀·X = d₀` expressed in the frozen camera frame.
    Planar {
        normal: Vector3<f64>,
        distance: f64,
        points: Vec<TrackedPoint>,
    },
    /// Points anchored on a cylinder surface, re-projected rigidly.
    Cylindrical { points: Vec<AnchoredPoint> },
}

/// One point-correspondence group with its tracking bookkeeping.
#[derive(Debug, Clone)]
pub struct PointGroup {
    pub geometry: GroupGeometry,
    /// The governing polygon passed the visibility culling.
    pub visible: bool,
    /// Still selected for tracking by the caller.
    pub tracked: bool,
}

impl PointGroup {
    /// A visible, tracked planar group.
    pub fn planar(normal: Vector3<f64>, distance: f64, points: Vec<TrackedPoint>) -> Self {
        Self {
            geometry: GroupGeometry::Planar {
                normal: normal.normalize(),
                distance,
                points,
            },
            visible: true,
            tracked: true,
        }
    }

    /// A visible, tracked cylindrical group.
    pub fn cylindrical(points: Vec<AnchoredPoint>) -> Self {
        Self {
            geometry: GroupGeometry::Cylindrical { points },
            visible: true,
            tracked: true,
        }
    }

    /// Number of currently-tracked points.
    pub fn point_count(&self) -> usize {
        match &self.geometry {
            GroupGeometry::Planar { points, .. } => points.len(),
            GroupGeometry::Cylindrical { points } => points.len(),
        }
    }

    /// Enough points for a usable block this frame.
    pub fn has_enough_points(&self) -> bool {
        self.point_count() >= MIN_GROUP_POINTS
    }

    /// Contributes rows to the current solve.
    pub fn is_usable(&self) -> bool {
        self.visible && self.tracked && self.has_enough_points()
    }

    /// Rows contributed this frame (2 per point, 0 below the usability
    /// threshold).
    pub fn row_count(&self) -> usize {
        if self.is_usable() {
            2 * self.point_count()
        } else {
            0
        }
    }

    /// Euclidean homography `H = R + (t/d₀) n₀ᵀ` of a planar group under the
    /// relative pose `ctTc0`.
    fn homography(normal: &Vector3<f64>, distance: f64, ct_tc0: &Pose) -> Matrix3<f64> {
        let r = ct_tc0.rotation().matrix().to_owned();
        let t = ct_tc0.translation();
        r + (t / distance) * normal.transpose()
    }

    /// Fill this group's residual and interaction rows at `offset`.
    ///
    /// Residual convention matches the contour modality: predicted position
    /// (from the relative pose) minus the tracked observation.
    pub fn fill(
        &self,
        ct_tc0: &Pose,
        jacobian: &mut DMatrix<f64>,
        residual: &mut DVector<f64>,
        offset: usize,
    ) -> TrackResult<()> {
        match &self.geometry {
            GroupGeometry::Planar {
                normal,
                distance,
                points,
            } => {
                let h = Self::homography(normal, *distance, ct_tc0);
                // plane transported to the current frame: n_c·X = d_c
                let n_c = ct_tc0.transform_vector(normal);
                let d_c = distance + n_c.dot(&ct_tc0.translation());
                for (i, point) in points.iter().enumerate() {
                    let q = h * Vector3::new(point.reference.x, point.reference.y, 1.0);
                    if q.z.abs() < MIN_DEPTH {
                        return Err(TrackError::InteractionMatrix(
                            "homography maps reference point to infinity".to_string(),
                        ));
                    }
                    let (xp, yp) = (q.x / q.z, q.y / q.z);
                    let denom = n_c.dot(&Vector3::new(xp, yp, 1.0));
                    let z = d_c / denom;
                    if !z.is_finite() || z < MIN_DEPTH {
                        return Err(TrackError::InteractionMatrix(
                            "predicted point has non-positive depth".to_string(),
                        ));
                    }
                    write_point_rows(
                        jacobian,
                        residual,
                        offset + 2 * i,
                        xp,
                        yp,
                        1.0 / z,
                        &point.current,
                    );
                }
                Ok(())
            }
            GroupGeometry::Cylindrical { points } => {
                for (i, point) in points.iter().enumerate() {
                    let pc = ct_tc0.transform_point(&point.anchor);
                    if pc.z < MIN_DEPTH {
                        return Err(TrackError::InteractionMatrix(
                            "cylinder anchor behind the camera".to_string(),
                        ));
                    }
                    let (xp, yp) = (pc.x / pc.z, pc.y / pc.z);
                    write_point_rows(
                        jacobian,
                        residual,
                        offset + 2 * i,
                        xp,
                        yp,
                        1.0 / pc.z,
                        &point.current,
                    );
                }
                Ok(())
            }
        }
    }

    /// Drop points whose per-point weight falls below `threshold`. Weights
    /// come in row order (two per point, averaged).
    fn prune(&mut self, point_weights: &[f64], threshold: f64) {
        let keep = |i: usize| point_weights.get(i).copied().unwrap_or(1.0) >= threshold;
        match &mut self.geometry {
            GroupGeometry::Planar { points, .. } => {
                let mut index = 0;
                points.retain(|_| {
                    let kept = keep(index);
                    index += 1;
                    kept
                });
            }
            GroupGeometry::Cylindrical { points } => {
                let mut index = 0;
                points.retain(|_| {
                    let kept = keep(index);
                    index += 1;
                    kept
                });
            }
        }
    }
}

fn write_point_rows(
    jacobian: &mut DMatrix<f64>,
    residual: &mut DVector<f64>,
    row: usize,
    xp: f64,
    yp: f64,
    inv_z: f64,
    observed: &Point2<f64>,
) {
    let rows = point_feature_rows(xp, yp, inv_z);
    for (k, r) in rows.iter().enumerate() {
        for j in 0..6 {
            jacobian[(row + k, j)] = r[j];
        }
    }
    residual[row] = xp - observed.x;
    residual[row + 1] = yp - observed.y;
}

/// The set of point groups maintained by the external tracker.
#[derive(Debug, Clone)]
pub struct PointFeatureSet {
    groups: Vec<PointGroup>,
    /// Minimum surviving points before the set requests re-initialization.
    min_total_points: usize,
}

impl Default for PointFeatureSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PointFeatureSet {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            min_total_points: MIN_GROUP_POINTS,
        }
    }

    /// Append a group; insertion order fixes the row order of the solve.
    pub fn push(&mut self, group: PointGroup) {
        self.groups.push(group);
    }

    /// All groups, in stable order.
    pub fn groups(&self) -> &[PointGroup] {
        &self.groups
    }

    /// Mutable access for the external point tracker.
    pub fn groups_mut(&mut self) -> &mut [PointGroup] {
        &mut self.groups
    }

    /// Drop every group (full re-initialization).
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Points currently usable by the solve, across groups.
    pub fn usable_point_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.is_usable())
            .map(PointGroup::point_count)
            .sum()
    }

    /// Residual rows the set contributes this frame.
    pub fn row_count(&self) -> usize {
        2 * self.usable_point_count()
    }

    /// Fill every usable group's block in stable order.
    pub fn fill(
        &self,
        ct_tc0: &Pose,
        jacobian: &mut DMatrix<f64>,
        residual: &mut DVector<f64>,
    ) -> TrackResult<()> {
        let mut offset = 0;
        for group in self.groups.iter().filter(|g| g.is_usable()) {
            group.fill(ct_tc0, jacobian, residual, offset)?;
            offset += group.row_count();
        }
        Ok(())
    }

    /// Hand the final fused point-row weights back to the set.
    ///
    /// Weights arrive share-scaled; `share` de-scales them so the outlier
    /// threshold keeps its absolute meaning. Points below `threshold` are
    /// dropped. Returns true when the set needs a full re-initialization
    /// (too few surviving points).
    pub fn apply_weights(&mut self, fused_rows: &[f64], share: f64, threshold: f64) -> bool {
        let descale = if share > 0.0 { 1.0 / share } else { 0.0 };
        let mut offset = 0;
        for group in &mut self.groups {
            if !group.is_usable() {
                continue;
            }
            let rows = group.row_count();
            let point_weights: Vec<f64> = fused_rows[offset..offset + rows]
                .chunks_exact(2)
                .map(|pair| 0.5 * (pair[0] + pair[1]) * descale)
                .collect();
            group.prune(&point_weights, threshold);
            offset += rows;
        }
        self.total_point_count() < self.min_total_points
    }

    /// All tracked points, usable or not.
    pub fn total_point_count(&self) -> usize {
        self.groups.iter().map(PointGroup::point_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    /// A fronto-parallel reference plane one meter ahead with a 2x2 point grid.
    fn test_planar_group() -> PointGroup {
        let refs = [
            Point2::new(-0.1, -0.1),
            Point2::new(0.1, -0.1),
            Point2::new(0.1, 0.1),
            Point2::new(-0.1, 0.1),
        ];
        let points = refs
            .iter()
            .map(|&reference| TrackedPoint {
                reference,
                current: reference,
            })
            .collect();
        PointGroup::planar(Vector3::z(), 1.0, points)
    }

    #[test]
    fn test_identity_relative_pose_gives_zero_residual() {
        let group = test_planar_group();
        let mut jac = DMatrix::zeros(8, 6);
        let mut res = DVector::zeros(8);
        group.fill(&Pose::identity(), &mut jac, &mut res, 0).unwrap();
        assert_relative_eq!(res.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_translated_relative_pose_predicts_shift() {
        let group = test_planar_group();
        // camera shifted 1cm along -x: points appear shifted +x... the
        // homography maps reference coordinates into the current frame
        let ct_tc0 = Pose::from_translation_axis_angle(
            Vector3::new(0.01, 0.0, 0.0),
            Vector3::zeros(),
        );
        let mut jac = DMatrix::zeros(8, 6);
        let mut res = DVector::zeros(8);
        group.fill(&ct_tc0, &mut jac, &mut res, 0).unwrap();
        // plane at unit distance: predicted x picks up the full translation
        for i in 0..4 {
            assert_relative_eq!(res[2 * i], 0.01, epsilon = 1e-12);
            assert_relative_eq!(res[2 * i + 1], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_planar_jacobian_matches_finite_differences() {
        let group = test_planar_group();
        let base = Pose::from_translation_axis_angle(
            Vector3::new(0.005, -0.003, 0.002),
            Vector3::new(0.01, -0.005, 0.002),
        );
        let mut jac = DMatrix::zeros(8, 6);
        let mut res = DVector::zeros(8);
        group.fill(&base, &mut jac, &mut res, 0).unwrap();

        let eps = 1e-7;
        for k in 0..6 {
            let mut dv = Vector6::zeros();
            dv[k] = eps;
            let perturbed = crate::manifold::exp(&dv).inverse() * base;
            let mut jp = DMatrix::zeros(8, 6);
            let mut rp = DVector::zeros(8);
            group.fill(&perturbed, &mut jp, &mut rp, 0).unwrap();
            for row in 0..8 {
                let numeric = (rp[row] - res[row]) / eps;
                assert_relative_eq!(numeric, jac[(row, k)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_below_threshold_group_contributes_no_rows() {
        let mut group = test_planar_group();
        if let GroupGeometry::Planar { points, .. } = &mut group.geometry {
            points.truncate(3);
        }
        assert_eq!(group.point_count(), 3);
        assert!(!group.is_usable());
        assert_eq!(group.row_count(), 0);
    }

    #[test]
    fn test_cylindrical_anchor_behind_camera_fails() {
        let group = PointGroup::cylindrical(vec![
            AnchoredPoint {
                anchor: Point3::new(0.0, 0.0, -1.0),
                current: Point2::origin(),
            };
            4
        ]);
        let mut jac = DMatrix::zeros(8, 6);
        let mut res = DVector::zeros(8);
        let result = group.fill(&Pose::identity(), &mut jac, &mut res, 0);
        assert!(matches!(result, Err(TrackError::InteractionMatrix(_))));
    }

    #[test]
    fn test_apply_weights_prunes_and_reports_health() {
        let mut set = PointFeatureSet::new();
        set.push(test_planar_group());
        assert_eq!(set.row_count(), 8);

        // condemn the last three points: 1 survivor < 4 -> reinit requested
        let mut fused = vec![0.65; 8];
        for w in fused.iter_mut().skip(2) {
            *w = 0.1;
        }
        let needs_reinit = set.apply_weights(&fused, 0.65, 0.5);
        assert!(needs_reinit);
        assert_eq!(set.total_point_count(), 1);
    }

    #[test]
    fn test_apply_weights_keeps_healthy_set() {
        let mut set = PointFeatureSet::new();
        set.push(test_planar_group());
        let fused = vec![0.65; 8];
        let needs_reinit = set.apply_weights(&fused, 0.65, 0.5);
        assert!(!needs_reinit);
        assert_eq!(set.total_point_count(), 4);
    }
}
