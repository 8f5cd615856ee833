//! Feature sets consumed by the fused pose solve.
//!
//! Two independently-maintained modalities feed the solver: geometric contour
//! primitives sampled along the projected model ([`contour`]) and sparse point
//! correspondences grouped by surface patch or cylinder ([`points`]). Both
//! expose the same capability: given a candidate pose (or relative pose),
//! fill a block of residual rows and their 6-column interaction matrix.

pub mod contour;
pub mod points;
pub mod site;

pub use contour::{Circle, ContourFeatureSet, ContourPrimitive, Cylinder, Line, PrimitiveKind};
pub use points::{PointFeatureSet, PointGroup, MIN_GROUP_POINTS};
pub use site::{ContourSite, SiteState};

/// Interaction-matrix rows of a 2D point feature at normalized coordinates
/// `(x, y)` with inverse depth `1/Z`.
///
/// ```text
/// Lx = [ -1/Z   0    x/Z    xy    -(1+x²)   y ]
/// Ly = [  0   -1/Z   y/Z   1+y²    -xy     -x ]
/// ```
pub(crate) fn point_feature_rows(x: f64, y: f64, inv_z: f64) -> [[f64; 6]; 2] {
    [
        [-inv_z, 0.0, x * inv_z, x * y, -(1.0 + x * x), y],
        [0.0, -inv_z, y * inv_z, 1.0 + y * y, -x * y, -x],
    ]
}
