//! Rigid-motion manifold used by the pose solver.
//!
//! The solver composes its incremental updates on SE(3) through the
//! exponential map rather than in an additive parameterization, so the pose
//! never leaves the rotation manifold. Velocity vectors follow the
//! `[vx, vy, vz, wx, wy, wz]` ordering: translational components first.

pub mod se3;

pub use se3::{exp, skew, velocity_twist, Pose, Velocity};
