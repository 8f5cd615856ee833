//! Post-tracking reconciliation: propagating the solve's verdict back to the
//! feature sets.
//!
//! After convergence the per-row M-estimator weights walk each primitive's
//! rows in the same stable order the assembler used. Sites condemned by the
//! estimator are flagged (not deleted) so the next resampling pass can
//! replace them, and a primitive whose mean weight degrades is marked for
//! re-initialization. Point-feature reconciliation is delegated to the point
//! set itself, which receives the fused weight rows.

use crate::features::contour::{ContourFeatureSet, PrimitiveKind};
use crate::features::site::SiteState;

/// Weight below which a site is provisionally suppressed.
pub const SITE_OUTLIER_THRESHOLD: f64 = 0.5;

/// Mean weight below which a primitive is flagged for re-initialization.
pub const PRIMITIVE_REINIT_THRESHOLD: f64 = 0.8;

/// Propagate the contour block's estimator weights back to sites and
/// primitives at the given level.
///
/// `weights` holds one entry per contour row in stacked order; it must come
/// from the same frame's solve, before any mutation of the feature set.
pub fn reconcile_contours(set: &mut ContourFeatureSet, level: usize, weights: &[f64]) {
    let spans = set.active_spans(level);
    for (index, offset, rows) in spans {
        if rows == 0 {
            continue;
        }
        let block = &weights[offset..offset + rows];
        let primitive = &mut set.primitives_mut()[index];
        match &mut primitive.kind {
            PrimitiveKind::Line(line) => {
                let mean = flag_sites(line.sites[level].iter_mut().map(|s| &mut s.state), block);
                line.mean_weight = mean;
                if mean < PRIMITIVE_REINIT_THRESHOLD {
                    primitive.needs_reinit = true;
                }
            }
            PrimitiveKind::Cylinder(cyl) => {
                // each limb keeps its own verdict
                let split = cyl.sites_limb1[level].len();
                let mean1 = flag_sites(
                    cyl.sites_limb1[level].iter_mut().map(|s| &mut s.state),
                    &block[..split],
                );
                let mean2 = flag_sites(
                    cyl.sites_limb2[level].iter_mut().map(|s| &mut s.state),
                    &block[split..],
                );
                cyl.mean_weight1 = mean1;
                cyl.mean_weight2 = mean2;
                if mean1 < PRIMITIVE_REINIT_THRESHOLD || mean2 < PRIMITIVE_REINIT_THRESHOLD {
                    primitive.needs_reinit = true;
                }
            }
            PrimitiveKind::Circle(circle) => {
                // two rows per sample: judge each site on its pair mean
                let mut sum = 0.0;
                for (i, sample) in circle.samples[level].iter_mut().enumerate() {
                    let pair = 0.5 * (block[2 * i] + block[2 * i + 1]);
                    sum += block[2 * i] + block[2 * i + 1];
                    if pair < SITE_OUTLIER_THRESHOLD {
                        sample.site.state = SiteState::EstimatorOutlier;
                    }
                }
                let mean = if rows > 0 { sum / rows as f64 } else { 1.0 };
                circle.mean_weight = mean;
                if mean < PRIMITIVE_REINIT_THRESHOLD {
                    primitive.needs_reinit = true;
                }
            }
        }
    }
}

/// Flag sites with sub-threshold weights and return the mean weight.
/// An empty row block counts as fully reliable.
fn flag_sites<'a>(
    states: impl Iterator<Item = &'a mut SiteState>,
    weights: &[f64],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (state, &w) in states.zip(weights.iter()) {
        sum += w;
        count += 1;
        if w < SITE_OUTLIER_THRESHOLD {
            *state = SiteState::EstimatorOutlier;
        }
    }
    if count == 0 {
        1.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::contour::{
        Circle, ContourPrimitive, Cylinder, Line, PrimitiveKind, SupportPlane,
    };
    use crate::features::contour::CircleSample;
    use crate::features::site::ContourSite;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Point3, Vector3};

    fn line_with_sites(n: usize) -> ContourPrimitive {
        let support = SupportPlane {
            normal: Vector3::z(),
            offset: 0.0,
        };
        let mut line = Line::new(
            Point3::new(-0.5, 0.0, 0.0),
            Point3::new(0.5, 0.0, 0.0),
            support,
            1,
        );
        for i in 0..n {
            line.sites[0].push(ContourSite::new(Point2::new(i as f64 * 0.01, 0.0)));
        }
        ContourPrimitive::new(PrimitiveKind::Line(line))
    }

    #[test]
    fn test_low_weight_sites_flagged_not_deleted() {
        let mut set = ContourFeatureSet::new(1);
        set.push(line_with_sites(4));
        reconcile_contours(&mut set, 0, &[0.9, 0.4, 0.95, 0.2]);

        let PrimitiveKind::Line(line) = &set.primitives()[0].kind else {
            panic!("expected a line");
        };
        assert_eq!(line.sites[0].len(), 4);
        assert_eq!(line.sites[0][0].state, SiteState::Normal);
        assert_eq!(line.sites[0][1].state, SiteState::EstimatorOutlier);
        assert_eq!(line.sites[0][2].state, SiteState::Normal);
        assert_eq!(line.sites[0][3].state, SiteState::EstimatorOutlier);
        assert_relative_eq!(line.mean_weight, 0.6125, epsilon = 1e-12);
        assert!(set.primitives()[0].needs_reinit);
    }

    #[test]
    fn test_healthy_primitive_keeps_tracking() {
        let mut set = ContourFeatureSet::new(1);
        set.push(line_with_sites(3));
        reconcile_contours(&mut set, 0, &[0.9, 0.85, 0.95]);
        let PrimitiveKind::Line(line) = &set.primitives()[0].kind else {
            panic!("expected a line");
        };
        assert_relative_eq!(line.mean_weight, 0.9, epsilon = 1e-12);
        assert!(!set.primitives()[0].needs_reinit);
    }

    #[test]
    fn test_cylinder_limbs_judged_independently() {
        let mut set = ContourFeatureSet::new(1);
        let mut cyl = Cylinder::new(
            Point3::new(0.0, -0.5, 2.0),
            Point3::new(0.0, 0.5, 2.0),
            0.1,
            1,
        );
        for i in 0..2 {
            cyl.sites_limb1[0].push(ContourSite::new(Point2::new(-0.05, i as f64 * 0.1)));
            cyl.sites_limb2[0].push(ContourSite::new(Point2::new(0.05, i as f64 * 0.1)));
        }
        set.push(ContourPrimitive::new(PrimitiveKind::Cylinder(cyl)));

        // healthy first limb, degraded second limb
        reconcile_contours(&mut set, 0, &[0.9, 0.95, 0.3, 0.4]);
        let PrimitiveKind::Cylinder(cyl) = &set.primitives()[0].kind else {
            panic!("expected a cylinder");
        };
        assert_relative_eq!(cyl.mean_weight1, 0.925, epsilon = 1e-12);
        assert_relative_eq!(cyl.mean_weight2, 0.35, epsilon = 1e-12);
        assert_eq!(cyl.sites_limb1[0][0].state, SiteState::Normal);
        assert_eq!(cyl.sites_limb2[0][0].state, SiteState::EstimatorOutlier);
        assert!(set.primitives()[0].needs_reinit);
    }

    #[test]
    fn test_circle_sites_judged_on_row_pairs() {
        let mut set = ContourFeatureSet::new(1);
        let mut circle = Circle::new(Point3::new(0.0, 0.0, 1.0), Vector3::z(), 0.2, 1);
        for i in 0..2 {
            circle.samples[0].push(CircleSample {
                angle: i as f64,
                site: ContourSite::new(Point2::new(0.0, 0.0)),
            });
        }
        set.push(ContourPrimitive::new(PrimitiveKind::Circle(circle)));

        reconcile_contours(&mut set, 0, &[0.9, 0.8, 0.3, 0.5]);
        let PrimitiveKind::Circle(circle) = &set.primitives()[0].kind else {
            panic!("expected a circle");
        };
        assert_eq!(circle.samples[0][0].site.state, SiteState::Normal);
        assert_eq!(circle.samples[0][1].site.state, SiteState::EstimatorOutlier);
        assert_relative_eq!(circle.mean_weight, 0.625, epsilon = 1e-12);
        assert!(set.primitives()[0].needs_reinit);
    }

    #[test]
    fn test_inactive_primitives_not_touched() {
        let mut set = ContourFeatureSet::new(1);
        let mut skipped = line_with_sites(2);
        skipped.tracked = false;
        set.push(skipped);
        set.push(line_with_sites(2));

        // weights cover only the active primitive's two rows
        reconcile_contours(&mut set, 0, &[0.1, 0.1]);
        assert!(!set.primitives()[0].needs_reinit);
        assert!(set.primitives()[1].needs_reinit);
    }
}
