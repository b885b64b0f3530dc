//! C FFI layer for vps-client.
//!
//! Exposes the anchor correction, response decoding and the angle gate to
//! engines that own their own loop (Unity, Unreal, native hosts) through
//! opaque handles. The generated C header is written to `include/vps_client.h`
//! by cbindgen.

use crate::config::CorrectionOptions;
use crate::correction::PoseCorrector;
use crate::error::LastError;
use crate::types::{euler_to_quaternion, ErrorKind, Localization, LocalizationResult, Pose};
use crate::VpsError;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::ffi::{c_char, c_int, CStr};
use std::time::Duration;

static LAST_ERROR: LastError = LastError::new();

/// Opaque anchor corrector handle for C consumers.
pub struct VpsCorrector(PoseCorrector);

/// Transform in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VpsPose {
    /// Position [x, y, z].
    pub position: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Euler angles [x, y, z] in degrees. Output only.
    pub euler_deg: [f64; 3],
}

/// Server localization in C-compatible layout. Rotations are Euler degrees.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VpsLocalization {
    pub vps_position: [f64; 3],
    pub vps_rotation: [f64; 3],
    pub tracking_position: [f64; 3],
    pub tracking_rotation: [f64; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VpsCorrectionOptions {
    pub max_interpolation_distance: f64,
    pub lerp_speed: f64,
    pub rotate_only_y: bool,
    pub freeze_y_pos: bool,
}

/// Decoded server response.
#[repr(C)]
pub struct VpsResult {
    /// 0 = not localized, 1 = sensor only (failed), 2 = localized.
    pub status: c_int,
    /// Valid when `status` is 2.
    pub localization: VpsLocalization,
    /// Null-terminated location id; empty unless localized.
    pub location_id: [c_char; 128],
    /// Error kind code, -1 when localized. See `vps_error_kind_name`.
    pub error_kind: c_int,
    /// Null-terminated error message.
    pub message: [c_char; 256],
    /// Null-terminated field path of a validation error.
    pub field: [c_char; 128],
}

const ERROR_KINDS: [ErrorKind; 8] = [
    ErrorKind::NoInternet,
    ErrorKind::NoCamera,
    ErrorKind::TrackingNotAvailable,
    ErrorKind::ArNotSupported,
    ErrorKind::ServerInternalError,
    ErrorKind::ValidationError,
    ErrorKind::LocalizationFail,
    ErrorKind::DeserializedError,
];

fn error_kind_code(kind: ErrorKind) -> c_int {
    ERROR_KINDS
        .iter()
        .position(|k| *k == kind)
        .map_or(-1, |i| i as c_int)
}

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

fn vec3(v: &Vector3<f64>) -> [f64; 3] {
    [v.x, v.y, v.z]
}

fn to_c_pose(pose: &Pose) -> VpsPose {
    let q = pose.rotation.quaternion();
    VpsPose {
        position: vec3(&pose.position),
        quaternion: [q.i, q.j, q.k, q.w],
        euler_deg: vec3(&pose.euler_deg()),
    }
}

fn from_c_pose(pose: &VpsPose) -> Pose {
    let [x, y, z, w] = pose.quaternion;
    Pose::new(
        Vector3::from(pose.position),
        UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
    )
}

fn from_c_localization(loc: &VpsLocalization) -> Localization {
    Localization {
        vps_position: Vector3::from(loc.vps_position),
        vps_rotation: Vector3::from(loc.vps_rotation),
        tracking_position: Vector3::from(loc.tracking_position),
        tracking_rotation: Vector3::from(loc.tracking_rotation),
        location_id: String::new(),
    }
}

/// Create a corrector. `options` may be null for the defaults.
///
/// # Safety
/// `options` must point to a valid `VpsCorrectionOptions`, or be null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_new(options: *const VpsCorrectionOptions) -> *mut VpsCorrector {
    let options = match options.as_ref() {
        Some(o) => CorrectionOptions {
            max_interpolation_distance: o.max_interpolation_distance,
            lerp_speed: o.lerp_speed,
            rotate_only_y: o.rotate_only_y,
            freeze_y_pos: o.freeze_y_pos,
        },
        None => CorrectionOptions::default(),
    };
    Box::into_raw(Box::new(VpsCorrector(PoseCorrector::new(options))))
}

/// Free a corrector.
///
/// # Safety
/// `corrector` must be a pointer returned by `vps_corrector_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_free(corrector: *mut VpsCorrector) {
    if !corrector.is_null() {
        drop(Box::from_raw(corrector));
    }
}

/// Update the camera's tracking pose (relative to the anchor). Call every frame.
///
/// # Safety
/// `corrector` and `camera` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_set_camera(corrector: *const VpsCorrector, camera: *const VpsPose) {
    if let (Some(corrector), Some(camera)) = (corrector.as_ref(), camera.as_ref()) {
        corrector.0.set_camera_local(from_c_pose(camera));
    }
}

/// Apply a server localization. Writes the applied correction (anchor delta)
/// to `out` if non-null.
///
/// Returns 1 if the anchor will animate, 0 if it jumped, -1 on error.
///
/// # Safety
/// `corrector` and `localization` must be valid pointers; `out` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_apply(
    corrector: *const VpsCorrector,
    localization: *const VpsLocalization,
    instantly: bool,
    out: *mut VpsPose,
) -> c_int {
    let (Some(corrector), Some(localization)) = (corrector.as_ref(), localization.as_ref()) else {
        LAST_ERROR.set(&"null corrector or localization");
        return -1;
    };

    let correction = corrector.0.apply(&from_c_localization(localization), instantly);
    if !out.is_null() {
        let delta = Pose::new(correction.position, euler_to_quaternion(&correction.rotation));
        let mut pose = to_c_pose(&delta);
        pose.euler_deg = vec3(&correction.rotation);
        out.write(pose);
    }
    c_int::from(correction.animated)
}

/// Advance the anchor animation by `dt_seconds`. Returns true while animating.
///
/// # Safety
/// `corrector` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_tick(corrector: *const VpsCorrector, dt_seconds: f64) -> bool {
    let Some(corrector) = corrector.as_ref() else {
        return false;
    };
    match Duration::try_from_secs_f64(dt_seconds) {
        Ok(dt) => corrector.0.tick(dt),
        Err(e) => {
            LAST_ERROR.set(&e);
            corrector.0.is_animating()
        }
    }
}

/// Current anchor transform. Returns 0 on success, -1 on error.
///
/// # Safety
/// `corrector` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_anchor(corrector: *const VpsCorrector, out: *mut VpsPose) -> c_int {
    match corrector.as_ref() {
        Some(corrector) if !out.is_null() => {
            out.write(to_c_pose(&corrector.0.anchor()));
            0
        }
        _ => -1,
    }
}

/// Return anchor and camera to the identity transform.
///
/// # Safety
/// `corrector` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn vps_corrector_reset(corrector: *const VpsCorrector) {
    if let Some(corrector) = corrector.as_ref() {
        corrector.0.reset();
    }
}

/// Decode a server response (HTTP status + JSON body) into `out`.
///
/// A null `body` is treated as empty. Returns `out->status`, or -1 if `out`
/// is null or `body` is not UTF-8.
///
/// # Safety
/// `body` must be a null-terminated string or null; `out` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn vps_decode_response(status_code: u16, body: *const c_char, out: *mut VpsResult) -> c_int {
    if out.is_null() {
        LAST_ERROR.set(&"null output");
        return -1;
    }
    let body = if body.is_null() {
        ""
    } else {
        match CStr::from_ptr(body).to_str() {
            Ok(body) => body,
            Err(e) => {
                LAST_ERROR.set(&VpsError::MalformedResponse(e.to_string()));
                return -1;
            }
        }
    };

    let result = crate::protocol::decode_response(status_code, body);
    let status = match &result {
        LocalizationResult::NotLocalized => 0,
        LocalizationResult::Failed(_) => 1,
        LocalizationResult::Localized(_) => 2,
    };
    let mut decoded = VpsResult {
        status,
        localization: VpsLocalization::default(),
        location_id: [0; 128],
        error_kind: -1,
        message: [0; 256],
        field: [0; 128],
    };
    match result {
        LocalizationResult::Localized(loc) => {
            decoded.localization = VpsLocalization {
                vps_position: vec3(&loc.vps_position),
                vps_rotation: vec3(&loc.vps_rotation),
                tracking_position: vec3(&loc.tracking_position),
                tracking_rotation: vec3(&loc.tracking_rotation),
            };
            decoded.location_id = str_to_fixed(&loc.location_id);
        }
        LocalizationResult::Failed(error) => {
            decoded.error_kind = error_kind_code(error.kind);
            decoded.message = str_to_fixed(&error.message);
            decoded.field = str_to_fixed(error.field.as_deref().unwrap_or(""));
        }
        LocalizationResult::NotLocalized => {}
    }
    out.write(decoded);
    status
}

/// Name of an error kind code ("NO_INTERNET", ...), or null for an unknown code.
/// The string is static.
#[no_mangle]
pub extern "C" fn vps_error_kind_name(code: c_int) -> *const c_char {
    const NAMES: [&CStr; 8] = [
        c"NO_INTERNET",
        c"NO_CAMERA",
        c"TRACKING_NOT_AVAILABLE",
        c"AR_NOT_SUPPORTED",
        c"SERVER_INTERNAL_ERROR",
        c"VALIDATION_ERROR",
        c"LOCALIZATION_FAIL",
        c"DESERIALIZED_ERROR",
    ];
    usize::try_from(code)
        .ok()
        .and_then(|i| NAMES.get(i))
        .map_or(std::ptr::null(), |name| name.as_ptr())
}

/// Angle gate on tracking Euler angles (degrees, [0, 360)).
#[no_mangle]
pub extern "C" fn vps_angle_ok(euler_x: f64, euler_z: f64, max_angle_x: f64, max_angle_z: f64) -> bool {
    crate::orchestrator::angle_ok(&Vector3::new(euler_x, 0.0, euler_z), max_angle_x, max_angle_z)
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next vps-client API call.
#[no_mangle]
pub extern "C" fn vps_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

/// Clear the last error message.
#[no_mangle]
pub extern "C" fn vps_clear_error() {
    LAST_ERROR.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn c_str(buf: &[c_char]) -> String {
        unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
    }

    fn empty_result() -> VpsResult {
        VpsResult {
            status: -1,
            localization: VpsLocalization::default(),
            location_id: [0; 128],
            error_kind: -1,
            message: [0; 256],
            field: [0; 128],
        }
    }

    #[test]
    fn test_error_kind_codes_match_names() {
        for (code, kind) in ERROR_KINDS.iter().enumerate() {
            assert_eq!(error_kind_code(*kind), code as c_int);
            let name = unsafe { CStr::from_ptr(vps_error_kind_name(code as c_int)) };
            assert_eq!(name.to_str().unwrap(), kind.as_str());
        }
        assert!(vps_error_kind_name(8).is_null());
        assert!(vps_error_kind_name(-1).is_null());
    }

    #[test]
    fn test_decode_validation_error() {
        let body = CString::new(r#"{"detail":[{"loc":["body","image"],"msg":"field required","type":"value_error.missing"}]}"#).unwrap();
        let mut out = empty_result();
        let status = unsafe { vps_decode_response(422, body.as_ptr(), &mut out) };
        assert_eq!(status, 1);
        assert_eq!(out.error_kind, error_kind_code(ErrorKind::ValidationError));
        assert_eq!(c_str(&out.message), "field required");
        assert_eq!(c_str(&out.field), "body/image");
    }

    #[test]
    fn test_decode_success() {
        let body = CString::new(r#"{"data":{"status":"done","attributes":{"location_id":"hall","tracking_pose":{"x":0,"y":0,"z":0,"rx":0,"ry":0,"rz":0},"vps_pose":{"x":1,"y":2,"z":3,"rx":0,"ry":45,"rz":0}}}}"#).unwrap();
        let mut out = empty_result();
        let status = unsafe { vps_decode_response(200, body.as_ptr(), &mut out) };
        assert_eq!(status, 2);
        assert_eq!(out.error_kind, -1);
        assert_eq!(out.localization.vps_position, [1.0, 2.0, 3.0]);
        assert_eq!(out.localization.vps_rotation[1], 45.0);
        assert_eq!(c_str(&out.location_id), "hall");
    }

    #[test]
    fn test_decode_null_body() {
        let mut out = empty_result();
        let status = unsafe { vps_decode_response(200, std::ptr::null(), &mut out) };
        assert_eq!(status, 1);
        assert_eq!(out.error_kind, error_kind_code(ErrorKind::DeserializedError));
        assert_eq!(unsafe { vps_decode_response(200, std::ptr::null(), std::ptr::null_mut()) }, -1);
    }

    #[test]
    fn test_corrector_lifecycle() {
        unsafe {
            let corrector = vps_corrector_new(std::ptr::null());
            let localization = VpsLocalization {
                vps_position: [1.0, 2.0, 3.0],
                ..Default::default()
            };
            let mut delta = VpsPose::default();
            assert_eq!(vps_corrector_apply(corrector, &localization, true, &mut delta), 0);
            assert_eq!(delta.position, [1.0, 2.0, 3.0]);

            let mut anchor = VpsPose::default();
            assert_eq!(vps_corrector_anchor(corrector, &mut anchor), 0);
            assert!((anchor.position[0] - 1.0).abs() < 1e-9);
            assert!((anchor.quaternion[3] - 1.0).abs() < 1e-9);

            let near = VpsLocalization {
                vps_position: [1.5, 2.0, 3.0],
                ..Default::default()
            };
            assert_eq!(vps_corrector_apply(corrector, &near, false, std::ptr::null_mut()), 1);
            assert!(vps_corrector_tick(corrector, 0.1));
            assert!(!vps_corrector_tick(corrector, 1.0));

            vps_corrector_reset(corrector);
            assert_eq!(vps_corrector_anchor(corrector, &mut anchor), 0);
            assert_eq!(anchor.position, [0.0, 0.0, 0.0]);
            vps_corrector_free(corrector);
        }
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            let localization = VpsLocalization::default();
            assert_eq!(
                vps_corrector_apply(std::ptr::null(), &localization, true, std::ptr::null_mut()),
                -1
            );
            assert!(!vps_last_error().is_null());
            assert!(!vps_corrector_tick(std::ptr::null(), 0.1));
            assert_eq!(vps_corrector_anchor(std::ptr::null(), std::ptr::null_mut()), -1);
            vps_corrector_reset(std::ptr::null());
            vps_corrector_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_angle_ok() {
        assert!(vps_angle_ok(10.0, 350.0, 30.0, 30.0));
        assert!(!vps_angle_ok(40.0, 0.0, 30.0, 30.0));
        assert!(vps_angle_ok(350.0, 10.0, 30.0, 30.0));
    }
}
