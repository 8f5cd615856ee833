//! SE(3) rigid-body transform and the se(3) exponential map.
//!
//! [`Pose`] represents the transform from the object frame to the camera
//! frame (`cMo`). The solver updates it by composing exponential-map
//! increments: `exp(v)` converts a 6-vector velocity into a rigid motion
//! using the closed-form `V(θ)` coupling between rotation and translation.

use std::fmt;
use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Matrix6, Point3, Rotation3, Vector3, Vector6};

/// Velocity in se(3): `[vx, vy, vz, wx, wy, wz]`, translation first.
pub type Velocity = Vector6<f64>;

/// Angle below which the exp/log maps switch to their series expansions.
const SMALL_ANGLE: f64 = 1e-8;

/// Rigid transform from the object frame to the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let axis_angle = self.rotation.scaled_axis();
        write!(
            f,
            "Pose(t: [{:.4}, {:.4}, {:.4}], θu: [{:.4}, {:.4}, {:.4}])",
            t.x, t.y, t.z, axis_angle.x, axis_angle.y, axis_angle.z
        )
    }
}

impl Pose {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from rotation and translation parts.
    pub fn from_parts(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a translation and an axis-angle rotation vector.
    pub fn from_translation_axis_angle(translation: Vector3<f64>, axis_angle: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::from_scaled_axis(axis_angle),
            translation,
        }
    }

    /// Rotation part.
    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    /// Translation part.
    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    /// Homogeneous 4x4 matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Inverse transform: `(R, t)⁻¹ = (Rᵀ, -Rᵀ t)`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            translation: -(rot_inv * self.translation),
            rotation: rot_inv,
        }
    }

    /// Apply the transform to a point: `R p + t`.
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// Rotate a direction without translating it.
    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * vector
    }

    /// Logarithmic map to se(3): the velocity whose exponential is this pose.
    pub fn log(&self) -> Velocity {
        let theta_vec = self.rotation.scaled_axis();
        let theta = theta_vec.norm();
        let s = skew(&theta_vec);

        // V(θ)⁻¹ = I - S/2 + (1/θ² - (1 + cos θ)/(2 θ sin θ)) S²
        let v_inv = if theta < SMALL_ANGLE {
            Matrix3::identity() - 0.5 * s + (1.0 / 12.0) * (s * s)
        } else {
            let coeff = 1.0 / (theta * theta)
                - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
            Matrix3::identity() - 0.5 * s + coeff * (s * s)
        };

        let mut out = Velocity::zeros();
        out.fixed_rows_mut::<3>(0).copy_from(&(v_inv * self.translation));
        out.fixed_rows_mut::<3>(3).copy_from(&theta_vec);
        out
    }

    /// Rotation angle, in radians, between this pose and another.
    pub fn rotation_angle_to(&self, other: &Pose) -> f64 {
        (self.rotation.inverse() * other.rotation).angle()
    }

    /// Euclidean distance between the translation parts.
    pub fn translation_distance_to(&self, other: &Pose) -> f64 {
        (self.translation - other.translation).norm()
    }
}

impl Mul for Pose {
    type Output = Pose;

    /// Composition: `(Ra, ta) · (Rb, tb) = (Ra Rb, Ra tb + ta)`.
    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

/// Skew-symmetric cross-product matrix `[v]ₓ`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map se(3) → SE(3).
///
/// For `v = [ρ, θ]`: `R = exp([θ]ₓ)` and `t = V(θ) ρ` with
/// `V(θ) = I + (1 - cos θ)/θ² [θ]ₓ + (θ - sin θ)/θ³ [θ]ₓ²`.
pub fn exp(v: &Velocity) -> Pose {
    let rho = Vector3::new(v[0], v[1], v[2]);
    let theta_vec = Vector3::new(v[3], v[4], v[5]);
    let theta = theta_vec.norm();
    let s = skew(&theta_vec);

    let v_mat = if theta < SMALL_ANGLE {
        Matrix3::identity() + 0.5 * s + (1.0 / 6.0) * (s * s)
    } else {
        let theta2 = theta * theta;
        Matrix3::identity()
            + ((1.0 - theta.cos()) / theta2) * s
            + ((theta - theta.sin()) / (theta2 * theta)) * (s * s)
    };

    Pose {
        rotation: Rotation3::from_scaled_axis(theta_vec),
        translation: v_mat * rho,
    }
}

/// Velocity-twist matrix of a pose: maps object-frame velocities into the
/// camera frame.
///
/// ```text
/// cVo = [ R  [t]ₓ R ]
///       [ 0     R   ]
/// ```
pub fn velocity_twist(pose: &Pose) -> Matrix6<f64> {
    let r = pose.rotation().matrix().to_owned();
    let t_skew_r = skew(&pose.translation()) * r;
    let mut twist = Matrix6::zeros();
    twist.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    twist.fixed_view_mut::<3, 3>(0, 3).copy_from(&t_skew_r);
    twist.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
    twist
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_4;

    #[test]
    fn test_exp_of_zero_is_identity() {
        let pose = exp(&Velocity::zeros());
        assert_relative_eq!(pose.translation().norm(), 0.0, epsilon = 1e-15);
        assert_relative_eq!(pose.rotation().angle(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_zero_velocity_leaves_composition_unchanged() {
        let pose = Pose::from_translation_axis_angle(
            Vector3::new(0.1, -0.2, 1.5),
            Vector3::new(0.3, 0.1, -0.2),
        );
        let updated = exp(&Velocity::zeros()).inverse() * pose;
        assert_relative_eq!(
            updated.translation_distance_to(&pose),
            0.0,
            epsilon = 1e-14
        );
        assert_relative_eq!(updated.rotation_angle_to(&pose), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_exp_log_round_trip() {
        let v = Velocity::from_column_slice(&[0.05, -0.02, 0.1, 0.3, -0.1, 0.2]);
        let recovered = exp(&v).log();
        for i in 0..6 {
            assert_relative_eq!(recovered[i], v[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_pure_translation_exp() {
        let v = Velocity::from_column_slice(&[0.1, 0.2, 0.3, 0.0, 0.0, 0.0]);
        let pose = exp(&v);
        assert_relative_eq!(pose.translation().x, 0.1, epsilon = 1e-12);
        assert_relative_eq!(pose.translation().y, 0.2, epsilon = 1e-12);
        assert_relative_eq!(pose.translation().z, 0.3, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation().angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_inverse_is_identity() {
        let pose = Pose::from_translation_axis_angle(
            Vector3::new(0.4, 0.0, 2.0),
            Vector3::new(0.0, FRAC_PI_4, 0.1),
        );
        let ident = pose * pose.inverse();
        assert_relative_eq!(ident.translation().norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(ident.rotation().angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let pose = Pose::from_translation_axis_angle(
            Vector3::new(0.1, 0.2, 0.3),
            Vector3::new(0.2, -0.3, 0.15),
        );
        let p = Point3::new(0.5, -0.4, 1.2);
        let transformed = pose.transform_point(&p);
        let homogeneous = pose.matrix() * p.to_homogeneous();
        assert_relative_eq!(transformed.x, homogeneous[0], epsilon = 1e-12);
        assert_relative_eq!(transformed.y, homogeneous[1], epsilon = 1e-12);
        assert_relative_eq!(transformed.z, homogeneous[2], epsilon = 1e-12);
    }

    #[test]
    fn test_velocity_twist_blocks() {
        let pose = Pose::from_translation_axis_angle(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, 0.0),
        );
        let twist = velocity_twist(&pose);
        // identity rotation: diagonal blocks are I, off-diagonal is [t]x
        assert_relative_eq!(twist[(0, 0)], 1.0);
        assert_relative_eq!(twist[(5, 5)], 1.0);
        assert_relative_eq!(twist[(0, 4)], 1.0, epsilon = 1e-12); // [t]x with t = e_z
        assert_relative_eq!(twist[(1, 3)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(twist[(3, 0)], 0.0);
    }
}
