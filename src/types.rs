use nalgebra::{UnitQuaternion, Vector3};
use std::fmt;

/// Rigid transform of a frame: position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Orientation as engine Euler angles [x, y, z] in degrees, each in [0, 360).
    pub fn euler_deg(&self) -> Vector3<f64> {
        quaternion_to_euler(&self.rotation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Local tracking state sampled from the AR engine at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSnapshot {
    /// Camera position in the tracking (anchor-local) frame.
    pub position: Vector3<f64>,
    /// Camera orientation in the tracking (anchor-local) frame.
    pub rotation: UnitQuaternion<f64>,
    /// Location the tracking is localized in; empty until the first success.
    pub location_id: String,
    pub is_localized: bool,
}

impl TrackingSnapshot {
    pub fn euler_deg(&self) -> Vector3<f64> {
        quaternion_to_euler(&self.rotation)
    }
}

impl Default for TrackingSnapshot {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            location_id: String::new(),
            is_localized: false,
        }
    }
}

/// GPS reading. `accuracy` is in the provider's units (meters on every supported platform).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Compass reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompassFix {
    /// Degrees clockwise from true north.
    pub heading: f64,
    pub accuracy: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Pinhole intrinsics of the captured image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// What the client sends to the server with each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalizationMode {
    /// Camera image only.
    #[default]
    Texture,
    /// On-device embedding only.
    Features,
    /// Image and embedding.
    Both,
}

impl LocalizationMode {
    pub fn sends_image(self) -> bool {
        matches!(self, LocalizationMode::Texture | LocalizationMode::Both)
    }

    pub fn needs_inference(self) -> bool {
        matches!(self, LocalizationMode::Features | LocalizationMode::Both)
    }

    pub fn parse(name: &str) -> Option<LocalizationMode> {
        match name.trim().to_ascii_lowercase().as_str() {
            "texture" | "image" => Some(LocalizationMode::Texture),
            "features" | "embedding" => Some(LocalizationMode::Features),
            "both" => Some(LocalizationMode::Both),
            _ => None,
        }
    }
}

/// Coarse localization status, mirroring the server's view of the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizationStatus {
    NotLocalized,
    SensorOnly,
    Localized,
}

/// Error taxonomy of a localization attempt or of service startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoInternet,
    NoCamera,
    TrackingNotAvailable,
    ArNotSupported,
    ServerInternalError,
    ValidationError,
    LocalizationFail,
    DeserializedError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoInternet => "NO_INTERNET",
            ErrorKind::NoCamera => "NO_CAMERA",
            ErrorKind::TrackingNotAvailable => "TRACKING_NOT_AVAILABLE",
            ErrorKind::ArNotSupported => "AR_NOT_SUPPORTED",
            ErrorKind::ServerInternalError => "SERVER_INTERNAL_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::LocalizationFail => "LOCALIZATION_FAIL",
            ErrorKind::DeserializedError => "DESERIALIZED_ERROR",
        }
    }

    /// Startup failures end the run; everything else is retried on the next attempt.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::NoCamera | ErrorKind::TrackingNotAvailable | ErrorKind::ArNotSupported
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A localization failure as surfaced to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Slash-joined path of the offending request field; validation errors only.
    pub field: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode: {}. Msg: {}.", self.kind, self.message)?;
        match &self.field {
            Some(field) if !field.is_empty() => write!(f, " Error field: {}", field),
            _ => Ok(()),
        }
    }
}

/// Absolute pose resolved by the server, with the tracking pose it was computed for.
///
/// Rotations are engine Euler angles in degrees, as on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Localization {
    pub vps_position: Vector3<f64>,
    pub vps_rotation: Vector3<f64>,
    pub tracking_position: Vector3<f64>,
    pub tracking_rotation: Vector3<f64>,
    pub location_id: String,
}

/// Outcome of the most recent attempt. Carries a pose or an error, never both.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LocalizationResult {
    /// No attempt has completed yet.
    #[default]
    NotLocalized,
    Localized(Localization),
    /// The attempt failed; the client still has sensor data only.
    Failed(ErrorInfo),
}

impl LocalizationResult {
    pub fn status(&self) -> LocalizationStatus {
        match self {
            LocalizationResult::NotLocalized => LocalizationStatus::NotLocalized,
            LocalizationResult::Localized(_) => LocalizationStatus::Localized,
            LocalizationResult::Failed(_) => LocalizationStatus::SensorOnly,
        }
    }

    pub fn localization(&self) -> Option<&Localization> {
        match self {
            LocalizationResult::Localized(loc) => Some(loc),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            LocalizationResult::Failed(err) => Some(err),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Platform capabilities checked before the localization loop starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Capabilities: u32 {
        const AR_SUPPORTED = 1 << 0;
        const CAMERA       = 1 << 1;
        const TRACKING     = 1 << 2;
        const GEO          = 1 << 3;
        const INFERENCE    = 1 << 4;
    }
}

/// Wrap an angle in degrees into [0, 360).
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Build a rotation from engine Euler angles [x, y, z] in degrees.
///
/// Applied as z first, then x, then y (R = Ry·Rx·Rz), y up and z forward.
pub fn euler_to_quaternion(euler_deg: &Vector3<f64>) -> UnitQuaternion<f64> {
    let rx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), euler_deg.x.to_radians());
    let ry = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), euler_deg.y.to_radians());
    let rz = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), euler_deg.z.to_radians());
    ry * rx * rz
}

/// Inverse of [`euler_to_quaternion`]; angles normalized to [0, 360).
///
/// From R = Ry(b)·Rx(a)·Rz(c):
///   a = asin(-R[1][2]), b = atan2(R[0][2], R[2][2]), c = atan2(R[1][0], R[1][1])
/// At gimbal lock (|a| = 90°) z is pinned to 0 and b = atan2(-R[2][0], R[0][0]).
pub fn quaternion_to_euler(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let rot = q.to_rotation_matrix();
    let m = rot.matrix();
    let x = (-m[(1, 2)]).clamp(-1.0, 1.0).asin();
    let (y, z) = if x.cos().abs() > 1e-6 {
        (m[(0, 2)].atan2(m[(2, 2)]), m[(1, 0)].atan2(m[(1, 1)]))
    } else {
        ((-m[(2, 0)]).atan2(m[(0, 0)]), 0.0)
    };
    Vector3::new(
        normalize_degrees(x.to_degrees()),
        normalize_degrees(y.to_degrees()),
        normalize_degrees(z.to_degrees()),
    )
}
