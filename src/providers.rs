//! Interfaces of the external collaborators: AR tracking, camera, GPS/compass,
//! on-device model assets and inference.
//!
//! Implementations live in the host engine. [`crate::sim`] has in-memory
//! versions for tests and the demos.

use crate::types::{Capabilities, CameraIntrinsics, CompassFix, GpsFix, TrackingSnapshot};
use crate::Result;
use std::sync::Arc;

/// Pixel layout of a requested camera buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale.
    R8,
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::R8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }
}

/// Size and format a consumer needs from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRequirement {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TextureRequirement {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Size in bytes of a tightly packed buffer.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// The AR engine's motion tracking.
pub trait TrackingProvider: Send + Sync {
    /// Current camera pose in the tracking frame. Sampled on every call.
    fn local_pose(&self) -> TrackingSnapshot;

    /// Mark tracking as localized in `location_id`. Returns true if the location changed.
    fn localize(&self, location_id: &str) -> bool;

    /// Forget the localization state.
    fn reset(&self);

    fn is_localized(&self) -> bool;
}

/// GPS receiver and compass.
pub trait GeoProvider: Send + Sync {
    /// Latest fix, or None when the receiver has nothing (or is disabled).
    fn gps(&self) -> Option<GpsFix>;

    fn compass(&self) -> Option<CompassFix>;

    fn set_enabled(&self, enabled: bool);
}

/// Device camera.
pub trait CameraProvider: Send + Sync {
    /// Prepare conversions for every requirement the run will ask for.
    fn init(&self, requirements: &[TextureRequirement]);

    fn is_ready(&self) -> bool;

    /// Encoded (JPEG) frame for upload.
    fn capture_frame(&self, requirement: &TextureRequirement) -> Option<Vec<u8>>;

    /// Raw pixel buffer for the on-device model.
    fn capture_buffer(&self, requirement: &TextureRequirement) -> Option<Vec<u8>>;

    /// Intrinsics of a frame captured at `requirement`'s resolution.
    fn intrinsics(&self, requirement: &TextureRequirement) -> CameraIntrinsics;
}

/// Download state of the on-device model weights.
pub trait AssetProvider: Send + Sync {
    /// Download progress in [0, 1].
    fn progress(&self) -> f32;

    /// Download missing assets. Blocks until done.
    fn download(&self) -> Result<()>;

    fn is_ready(&self) -> bool {
        self.progress() >= 1.0
    }
}

/// On-device feature extraction and global descriptor model.
pub trait FeatureExtractor: Send + Sync {
    /// Input expected by the local feature extractor.
    fn extractor_requirement(&self) -> TextureRequirement;

    /// Input expected by the global descriptor encoder.
    fn encoder_requirement(&self) -> TextureRequirement;

    /// Run both networks and return the serialized embedding.
    fn infer(&self, extractor_input: &[u8], encoder_input: &[u8]) -> Result<Vec<u8>>;

    /// Abandon a running inference, if any.
    fn cancel(&self);
}

/// The set of collaborators one localization run works with.
#[derive(Clone, Default)]
pub struct Providers {
    pub tracking: Option<Arc<dyn TrackingProvider>>,
    pub camera: Option<Arc<dyn CameraProvider>>,
    pub geo: Option<Arc<dyn GeoProvider>>,
    pub extractor: Option<Arc<dyn FeatureExtractor>>,
    /// Result of the platform AR capability check.
    pub ar_supported: bool,
}

impl Providers {
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::AR_SUPPORTED, self.ar_supported);
        caps.set(Capabilities::CAMERA, self.camera.is_some());
        caps.set(Capabilities::TRACKING, self.tracking.is_some());
        caps.set(Capabilities::GEO, self.geo.is_some());
        caps.set(Capabilities::INFERENCE, self.extractor.is_some());
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeGeo, StaticCamera, StaticTracking};

    #[test]
    fn test_capabilities_follow_providers() {
        let mut providers = Providers::default();
        assert_eq!(providers.capabilities(), Capabilities::empty());

        providers.ar_supported = true;
        providers.camera = Some(Arc::new(StaticCamera::new()));
        providers.tracking = Some(Arc::new(StaticTracking::new()));
        providers.geo = Some(Arc::new(FakeGeo::new(None, None)));
        assert_eq!(
            providers.capabilities(),
            Capabilities::AR_SUPPORTED
                | Capabilities::CAMERA
                | Capabilities::TRACKING
                | Capabilities::GEO
        );
        assert!(!providers.capabilities().contains(Capabilities::INFERENCE));
    }
}
