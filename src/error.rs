//! Error types for the hybrid-tracker library
//!
//! All abort paths of a frame's solve are surfaced here as typed variants;
//! none of them is recoverable within the frame. Transient Levenberg-Marquardt
//! step rejections are normal control flow and never reach this module.

use thiserror::Error;

/// Main result type used throughout the hybrid-tracker library
pub type TrackResult<T> = Result<T, TrackError>;

/// Frame-fatal tracking errors.
///
/// The caller decides whether to retry the frame with a fresh detection pass
/// or to request a full re-initialization; the solver never retries on its own.
#[derive(Debug, Clone, Error)]
pub enum TrackError {
    /// Fewer than four usable residual rows across both modalities at solve start.
    /// The pose is left untouched.
    #[error("not enough data to constrain a 6-DoF solve: {rows} usable rows")]
    InsufficientData { rows: usize },

    /// Levenberg-Marquardt damping grew past its ceiling without an accepted step.
    #[error("optimization diverged: damping factor reached {mu:.3e}")]
    Diverged { mu: f64 },

    /// A feature block could not produce its interaction matrix or residual,
    /// e.g. degenerate geometry behind the camera or inside a cylinder.
    #[error("cannot compute interaction matrix: {0}")]
    InteractionMatrix(String),

    /// The requested pyramid level holds no features.
    #[error("pyramid level {level} not used")]
    LevelNotUsed { level: usize },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_insufficient_data() {
        let err = TrackError::InsufficientData { rows: 3 };
        assert_eq!(
            err.to_string(),
            "not enough data to constrain a 6-DoF solve: 3 usable rows"
        );
    }

    #[test]
    fn test_display_diverged() {
        let err = TrackError::Diverged { mu: 10.0 };
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> TrackResult<()> {
            Err(TrackError::InteractionMatrix("behind camera".to_string()))
        }
        fn outer() -> TrackResult<()> {
            inner()?;
            Ok(())
        }
        assert!(matches!(outer(), Err(TrackError::InteractionMatrix(_))));
    }
}
