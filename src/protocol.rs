//! Wire format of the localization API (JSON:API style envelope) and the
//! mapping of server responses onto [`LocalizationResult`].
//!
//! Everything here is pure: no I/O, no clocks except [`unix_timestamp`].

use crate::types::{
    CameraIntrinsics, CompassFix, ErrorInfo, ErrorKind, GpsFix, Localization,
    LocalizationResult, TrackingSnapshot,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Coordinate convention of the poses we send and expect back.
pub const CLIENT_COORDINATE_SYSTEM: &str = "unity";

/// GPS fixes at or above this accuracy are not sent.
pub const GPS_ACCURACY_LIMIT: f64 = 1000.0;

pub const MSG_NO_INTERNET: &str = "Network is not available";
pub const MSG_DESERIALIZE: &str = "Can't deserialize server response";
pub const MSG_NO_DATA: &str = "There is no data come from server";

// -- Request wire structs --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub data: RequestData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub attributes: RequestAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub location_ids: Vec<String>,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<WireLocation>,
    pub client_coordinate_system: String,
    pub tracking_pose: WirePose,
    pub intrinsics: WireIntrinsics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<WireGps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compass: Option<WireCompass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireGps {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireCompass {
    pub heading: f64,
    pub accuracy: f64,
    pub timestamp: f64,
}

/// Position plus engine Euler angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WirePose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl WirePose {
    pub fn new(position: &Vector3<f64>, rotation: &Vector3<f64>) -> Self {
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            rx: rotation.x,
            ry: rotation.y,
            rz: rotation.z,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn rotation(&self) -> Vector3<f64> {
        Vector3::new(self.rx, self.ry, self.rz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireIntrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

// -- Response wire structs --

#[derive(Debug, Clone, Deserialize)]
struct ResponseEnvelope {
    data: ResponseData,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseData {
    status: String,
    #[serde(default)]
    status_description: Option<String>,
    #[serde(default)]
    attributes: Option<ResponseAttributes>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseAttributes {
    #[serde(default)]
    location_id: Option<String>,
    #[serde(default)]
    tracking_pose: Option<WirePose>,
    #[serde(default)]
    vps_pose: Option<WirePose>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailDetails {
    detail: Vec<FailDetail>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailDetail {
    #[serde(default)]
    loc: Vec<String>,
    msg: String,
    #[serde(default, rename = "type")]
    #[allow(dead_code)]
    kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailStringDetail {
    detail: String,
}

/// Sensor state gathered for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCapture {
    pub tracking: TrackingSnapshot,
    pub gps: Option<GpsFix>,
    pub compass: Option<CompassFix>,
    pub intrinsics: CameraIntrinsics,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Everything sent as request metadata for one localization attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizationAttemptRequest {
    pub location_ids: Vec<String>,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: f64,
    pub tracking_position: Vector3<f64>,
    /// Engine Euler angles in degrees.
    pub tracking_rotation: Vector3<f64>,
    pub gps: Option<GpsFix>,
    pub compass: Option<CompassFix>,
    pub intrinsics: CameraIntrinsics,
}

/// Assemble the request for one attempt.
///
/// A GPS fix is dropped unless its accuracy is below [`GPS_ACCURACY_LIMIT`];
/// the compass fix is kept whenever the provider had one.
pub fn build_request(
    location_ids: &[String],
    session_id: &str,
    user_id: &str,
    capture: &SensorCapture,
) -> LocalizationAttemptRequest {
    LocalizationAttemptRequest {
        location_ids: location_ids.to_vec(),
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        timestamp: capture.timestamp,
        tracking_position: capture.tracking.position,
        tracking_rotation: capture.tracking.euler_deg(),
        gps: capture.gps.filter(|fix| fix.accuracy < GPS_ACCURACY_LIMIT),
        compass: capture.compass,
        intrinsics: capture.intrinsics,
    }
}

impl LocalizationAttemptRequest {
    pub fn to_wire(&self) -> RequestEnvelope {
        let gps = self.gps.map(|g| WireGps {
            latitude: g.latitude,
            longitude: g.longitude,
            altitude: g.altitude,
            accuracy: g.accuracy,
            timestamp: g.timestamp,
        });
        let compass = self.compass.map(|c| WireCompass {
            heading: c.heading,
            accuracy: c.accuracy,
            timestamp: c.timestamp,
        });
        let location = if gps.is_some() || compass.is_some() {
            Some(WireLocation { gps, compass })
        } else {
            None
        };

        RequestEnvelope {
            data: RequestData {
                attributes: RequestAttributes {
                    location_ids: self.location_ids.clone(),
                    session_id: self.session_id.clone(),
                    user_id: self.user_id.clone(),
                    timestamp: self.timestamp,
                    location,
                    client_coordinate_system: CLIENT_COORDINATE_SYSTEM.to_string(),
                    tracking_pose: WirePose::new(&self.tracking_position, &self.tracking_rotation),
                    intrinsics: WireIntrinsics {
                        width: self.intrinsics.width,
                        height: self.intrinsics.height,
                        fx: self.intrinsics.fx,
                        fy: self.intrinsics.fy,
                        cx: self.intrinsics.cx,
                        cy: self.intrinsics.cy,
                    },
                },
            },
        }
    }

    pub fn from_wire(wire: &RequestEnvelope) -> Self {
        let attrs = &wire.data.attributes;
        let location = attrs.location.as_ref();
        LocalizationAttemptRequest {
            location_ids: attrs.location_ids.clone(),
            session_id: attrs.session_id.clone(),
            user_id: attrs.user_id.clone(),
            timestamp: attrs.timestamp,
            tracking_position: attrs.tracking_pose.position(),
            tracking_rotation: attrs.tracking_pose.rotation(),
            gps: location.and_then(|l| l.gps).map(|g| GpsFix {
                latitude: g.latitude,
                longitude: g.longitude,
                altitude: g.altitude,
                accuracy: g.accuracy,
                timestamp: g.timestamp,
            }),
            compass: location.and_then(|l| l.compass).map(|c| CompassFix {
                heading: c.heading,
                accuracy: c.accuracy,
                timestamp: c.timestamp,
            }),
            intrinsics: CameraIntrinsics {
                width: attrs.intrinsics.width,
                height: attrs.intrinsics.height,
                fx: attrs.intrinsics.fx,
                fy: attrs.intrinsics.fy,
                cx: attrs.intrinsics.cx,
                cy: attrs.intrinsics.cy,
            },
        }
    }
}

/// Serialize request metadata to the JSON sent in the `json` form part.
pub fn encode_request(request: &LocalizationAttemptRequest) -> crate::Result<String> {
    let json = serde_json::to_string(&request.to_wire())?;
    log::debug!("Json to send: {}", json);
    Ok(json)
}

/// Parse request metadata, as a server (or a test double) sees it.
pub fn decode_request(json: &str) -> crate::Result<LocalizationAttemptRequest> {
    let wire: RequestEnvelope = serde_json::from_str(json)?;
    Ok(LocalizationAttemptRequest::from_wire(&wire))
}

/// Map a server response onto a localization result.
///
/// Never fails: anything that cannot be understood becomes a
/// `DESERIALIZED_ERROR` result.
pub fn decode_response(status_code: u16, body: &str) -> LocalizationResult {
    if body.trim().is_empty() {
        log::error!("Empty response body (status {})", status_code);
        return failure(ErrorKind::DeserializedError, MSG_NO_DATA);
    }

    let decoded = match status_code {
        200 => decode_success(body),
        422 => decode_validation(body),
        404 | 500 => serde_json::from_str::<FailStringDetail>(body)
            .map(|d| failure(ErrorKind::ServerInternalError, d.detail))
            .map_err(|e| e.to_string()),
        other => Err(format!("unexpected status code {}", other)),
    };

    match decoded {
        Ok(result) => result,
        Err(reason) => {
            log::error!("Failed to decode response (status {}): {}", status_code, reason);
            failure(ErrorKind::DeserializedError, MSG_DESERIALIZE)
        }
    }
}

/// Result of an attempt whose request never got a response.
pub fn network_failure() -> LocalizationResult {
    failure(ErrorKind::NoInternet, MSG_NO_INTERNET)
}

fn failure(kind: ErrorKind, message: impl Into<String>) -> LocalizationResult {
    LocalizationResult::Failed(ErrorInfo::new(kind, message))
}

fn decode_success(body: &str) -> Result<LocalizationResult, String> {
    let envelope: ResponseEnvelope = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let data = envelope.data;

    if data.status != "done" {
        let description = data.status_description.unwrap_or_default();
        return Ok(failure(ErrorKind::LocalizationFail, description));
    }

    let attrs = data
        .attributes
        .ok_or_else(|| "status done without attributes".to_string())?;
    let vps_pose = attrs
        .vps_pose
        .ok_or_else(|| "status done without vps_pose".to_string())?;
    let tracking_pose = attrs
        .tracking_pose
        .ok_or_else(|| "status done without tracking_pose".to_string())?;

    Ok(LocalizationResult::Localized(Localization {
        vps_position: vps_pose.position(),
        vps_rotation: vps_pose.rotation(),
        tracking_position: tracking_pose.position(),
        tracking_rotation: tracking_pose.rotation(),
        location_id: attrs.location_id.unwrap_or_default(),
    }))
}

fn decode_validation(body: &str) -> Result<LocalizationResult, String> {
    let details: FailDetails = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let first = details
        .detail
        .into_iter()
        .next()
        .ok_or_else(|| "validation error without details".to_string())?;

    let field = first.loc.join("/");
    Ok(LocalizationResult::Failed(
        ErrorInfo::new(ErrorKind::ValidationError, first.msg).with_field(field),
    ))
}

/// Current time in seconds since the Unix epoch, millisecond precision.
pub fn unix_timestamp() -> f64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis as f64 / 1000.0
}
