//! Hybrid 6-DoF model-based tracking core.
//!
//! Estimates the pose of a rigid object relative to a camera, frame by
//! frame, by fusing two complementary visual cues: geometric contour
//! features projected from a 3D model (lines, cylinders, circles) and sparse
//! point correspondences maintained by an external tracker. Both modalities
//! feed one robust iteratively-reweighted least-squares solve driving the
//! projected-feature error to zero through exponential-map pose updates
//! (virtual visual servoing).
//!
//! Detection, sampling and model parsing live outside this crate: the
//! [`tracker::HybridTracker`] exposes mutable feature-set boundaries for
//! those collaborators and owns only the residual-fusion and pose-solving
//! pipeline.
//!
//! # Example
//!
//! ```no_run
//! use hybrid_tracker::{CameraIntrinsics, HybridTracker, TrackerConfig};
//!
//! # fn main() -> hybrid_tracker::TrackResult<()> {
//! let camera = CameraIntrinsics::new(686.24, 686.24, 320.0, 240.0)?;
//! let mut tracker = HybridTracker::new(TrackerConfig::default(), camera, 1)?;
//! // ...external collaborators populate tracker.contours_mut() and
//! // tracker.points_mut() and seed the pose...
//! let summary = tracker.track((640, 480))?;
//! if summary.needs_reinit {
//!     tracker.reset();
//! }
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod error;
pub mod features;
pub mod logger;
pub mod manifold;
pub mod reconcile;
pub mod robust;
pub mod solver;
pub mod tracker;

pub use camera::CameraIntrinsics;
pub use config::TrackerConfig;
pub use error::{TrackError, TrackResult};
pub use manifold::{Pose, Velocity};
pub use solver::{OptimizationMethod, PoseSolver, SolveOutcome};
pub use tracker::{HybridTracker, TrackSummary};
