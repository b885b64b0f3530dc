//! In-memory collaborators for tests, demos and free-flight sessions.

use crate::providers::{
    AssetProvider, CameraProvider, FeatureExtractor, GeoProvider, PixelFormat,
    TextureRequirement, TrackingProvider,
};
use crate::types::{euler_to_quaternion, CameraIntrinsics, CompassFix, GpsFix, TrackingSnapshot};
use crate::{Result, VpsError};
use nalgebra::{UnitQuaternion, Vector3};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracking whose pose only changes when told to.
#[derive(Debug, Default)]
pub struct StaticTracking {
    snapshot: Mutex<TrackingSnapshot>,
}

impl StaticTracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// `euler_deg` is [x, y, z] in engine convention.
    pub fn set_pose(&self, position: Vector3<f64>, euler_deg: Vector3<f64>) {
        let mut snapshot = lock(&self.snapshot);
        snapshot.position = position;
        snapshot.rotation = euler_to_quaternion(&euler_deg);
    }

    pub fn set_position(&self, position: Vector3<f64>) {
        lock(&self.snapshot).position = position;
    }

    pub fn set_rotation(&self, rotation: UnitQuaternion<f64>) {
        lock(&self.snapshot).rotation = rotation;
    }

    pub fn location_id(&self) -> String {
        lock(&self.snapshot).location_id.clone()
    }
}

impl TrackingProvider for StaticTracking {
    fn local_pose(&self) -> TrackingSnapshot {
        lock(&self.snapshot).clone()
    }

    fn localize(&self, location_id: &str) -> bool {
        let mut snapshot = lock(&self.snapshot);
        let changed = snapshot.location_id != location_id;
        if changed {
            log::info!("Tracking localized in {}", location_id);
            snapshot.location_id = location_id.to_string();
        }
        snapshot.is_localized = true;
        changed
    }

    fn reset(&self) {
        let mut snapshot = lock(&self.snapshot);
        snapshot.location_id.clear();
        snapshot.is_localized = false;
    }

    fn is_localized(&self) -> bool {
        lock(&self.snapshot).is_localized
    }
}

/// GPS and compass with fixed readings.
#[derive(Debug)]
pub struct FakeGeo {
    gps: Option<GpsFix>,
    compass: Option<CompassFix>,
    enabled: AtomicBool,
}

impl FakeGeo {
    pub fn new(gps: Option<GpsFix>, compass: Option<CompassFix>) -> Self {
        Self {
            gps,
            compass,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl GeoProvider for FakeGeo {
    fn gps(&self) -> Option<GpsFix> {
        self.gps.filter(|_| self.is_enabled())
    }

    fn compass(&self) -> Option<CompassFix> {
        self.compass.filter(|_| self.is_enabled())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Minimal JPEG (SOI, EOI) standing in for a real frame.
const PLACEHOLDER_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

/// Camera returning the same frame and mid-gray buffers on every call.
#[derive(Debug)]
pub struct StaticCamera {
    frame: Vec<u8>,
    ready: AtomicBool,
    buffers: AtomicBool,
    initialized: Mutex<Vec<TextureRequirement>>,
}

impl StaticCamera {
    pub fn new() -> Self {
        Self::with_frame(PLACEHOLDER_JPEG.to_vec())
    }

    pub fn with_frame(frame: Vec<u8>) -> Self {
        Self {
            frame,
            ready: AtomicBool::new(true),
            buffers: AtomicBool::new(true),
            initialized: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_buffers_available(&self, available: bool) {
        self.buffers.store(available, Ordering::Relaxed);
    }

    /// Requirements passed to the last `init`.
    pub fn initialized(&self) -> Vec<TextureRequirement> {
        lock(&self.initialized).clone()
    }
}

impl Default for StaticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraProvider for StaticCamera {
    fn init(&self, requirements: &[TextureRequirement]) {
        *lock(&self.initialized) = requirements.to_vec();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn capture_frame(&self, _requirement: &TextureRequirement) -> Option<Vec<u8>> {
        Some(self.frame.clone())
    }

    fn capture_buffer(&self, requirement: &TextureRequirement) -> Option<Vec<u8>> {
        self.buffers
            .load(Ordering::Relaxed)
            .then(|| vec![0x80; requirement.byte_len()])
    }

    fn intrinsics(&self, requirement: &TextureRequirement) -> CameraIntrinsics {
        let focal = f64::from(requirement.width.max(requirement.height));
        CameraIntrinsics {
            width: requirement.width,
            height: requirement.height,
            fx: focal,
            fy: focal,
            cx: f64::from(requirement.width) / 2.0,
            cy: f64::from(requirement.height) / 2.0,
        }
    }
}

/// Model assets that are always present.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadyAssets;

impl AssetProvider for ReadyAssets {
    fn progress(&self) -> f32 {
        1.0
    }

    fn download(&self) -> Result<()> {
        Ok(())
    }
}

/// Extractor that returns a fixed embedding.
#[derive(Debug)]
pub struct FixedExtractor {
    embedding: Vec<u8>,
    runs: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FixedExtractor {
    pub fn new(embedding: Vec<u8>) -> Self {
        Self {
            embedding,
            runs: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl FeatureExtractor for FixedExtractor {
    fn extractor_requirement(&self) -> TextureRequirement {
        TextureRequirement::new(960, 540, PixelFormat::R8)
    }

    fn encoder_requirement(&self) -> TextureRequirement {
        TextureRequirement::new(224, 224, PixelFormat::Rgb24)
    }

    fn infer(&self, extractor_input: &[u8], encoder_input: &[u8]) -> Result<Vec<u8>> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let expected = (
            self.extractor_requirement().byte_len(),
            self.encoder_requirement().byte_len(),
        );
        if (extractor_input.len(), encoder_input.len()) != expected {
            return Err(VpsError::Inference(format!(
                "input sizes {}/{} do not match {}/{}",
                extractor_input.len(),
                encoder_input.len(),
                expected.0,
                expected.1
            )));
        }
        Ok(self.embedding.clone())
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}
