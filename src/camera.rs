//! Pinhole camera intrinsics.
//!
//! The tracker treats calibration as an opaque input: intrinsics are produced
//! by an external calibration stage and consumed read-only here, for converting
//! between pixel and normalized image coordinates at the collaborator boundary
//! and for expressing M-estimator thresholds in normalized units.

use nalgebra::Point2;

use crate::error::{TrackError, TrackResult};

/// Pinhole intrinsics `(px, py, u0, v0)`: focal lengths in pixels and the
/// principal point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    px: f64,
    py: f64,
    u0: f64,
    v0: f64,
}

impl CameraIntrinsics {
    /// Create intrinsics from focal lengths (pixels) and principal point.
    ///
    /// Fails with [`TrackError::InvalidConfig`] if either focal length is not
    /// strictly positive.
    pub fn new(px: f64, py: f64, u0: f64, v0: f64) -> TrackResult<Self> {
        if px <= 0.0 || py <= 0.0 {
            return Err(TrackError::InvalidConfig(format!(
                "focal lengths must be positive, got px={px}, py={py}"
            )));
        }
        Ok(Self { px, py, u0, v0 })
    }

    /// Horizontal focal length in pixels.
    pub fn px(&self) -> f64 {
        self.px
    }

    /// Vertical focal length in pixels.
    pub fn py(&self) -> f64 {
        self.py
    }

    /// Principal point.
    pub fn principal_point(&self) -> Point2<f64> {
        Point2::new(self.u0, self.v0)
    }

    /// Convert a pixel position to normalized image coordinates.
    pub fn pixel_to_normalized(&self, pixel: Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.u0) / self.px, (pixel.y - self.v0) / self.py)
    }

    /// Convert normalized image coordinates to a pixel position.
    pub fn normalized_to_pixel(&self, point: Point2<f64>) -> Point2<f64> {
        Point2::new(point.x * self.px + self.u0, point.y * self.py + self.v0)
    }

    /// Express a pixel-space threshold in normalized image units.
    pub fn normalize_threshold(&self, threshold_px: f64) -> f64 {
        threshold_px / self.px
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_non_positive_focal() {
        assert!(CameraIntrinsics::new(0.0, 600.0, 320.0, 240.0).is_err());
        assert!(CameraIntrinsics::new(600.0, -1.0, 320.0, 240.0).is_err());
    }

    #[test]
    fn test_pixel_normalized_round_trip() {
        let cam = CameraIntrinsics::new(686.24, 686.24, 320.0, 240.0).unwrap();
        let pixel = Point2::new(100.0, 410.5);
        let back = cam.normalized_to_pixel(cam.pixel_to_normalized(pixel));
        assert_relative_eq!(back.x, pixel.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, pixel.y, epsilon = 1e-12);
    }

    #[test]
    fn test_principal_point_maps_to_origin() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0).unwrap();
        let center = cam.pixel_to_normalized(Point2::new(320.0, 240.0));
        assert_relative_eq!(center.x, 0.0);
        assert_relative_eq!(center.y, 0.0);
    }

    #[test]
    fn test_threshold_normalization() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0).unwrap();
        assert_relative_eq!(cam.normalize_threshold(2.0), 0.004);
    }
}
