//! Runtime settings for the localization service and the anchor correction.
//!
//! Defaults match the production service; every field can be overridden
//! from `VPS_*` environment variables via [`Settings::from_env`] and
//! [`CorrectionOptions::from_env`].

use crate::providers::{PixelFormat, TextureRequirement};
use crate::types::LocalizationMode;
use crate::{Result, VpsError};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://vps.naviar.io/";
pub const DEFAULT_API_PATH: &str = "vps/api/v3";

/// Settings of one localization run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Candidate locations to localize against. Must not be empty.
    pub location_ids: Vec<String>,
    /// Delay between attempts until the first success of a session.
    pub localization_interval: Duration,
    /// Delay between attempts once localized (periodic recalibration).
    pub calibration_interval: Duration,
    /// Consecutive failures after a lock that invalidate the session.
    pub fails_count_to_reset_session: u32,
    /// Half-width in degrees of the allowed window around 0° for the x (pitch) angle.
    pub max_angle_x: f64,
    /// Half-width in degrees of the allowed window around 0° for the z (roll) angle.
    pub max_angle_z: f64,
    pub mode: LocalizationMode,
    pub send_gps: bool,
    pub endpoint: String,
    pub api_path: String,
    /// Zero disables the timeout.
    pub request_timeout: Duration,
    /// Period of the readiness / angle / pause checks.
    pub poll_period: Duration,
    /// Image sent to the server in texture mode.
    pub texture: TextureRequirement,
}

impl Settings {
    pub fn new(location_ids: Vec<String>) -> Self {
        Self {
            location_ids,
            localization_interval: Duration::from_secs(1),
            calibration_interval: Duration::from_millis(2500),
            fails_count_to_reset_session: 5,
            max_angle_x: 30.0,
            max_angle_z: 30.0,
            mode: LocalizationMode::Texture,
            send_gps: false,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_path: DEFAULT_API_PATH.to_string(),
            request_timeout: Duration::ZERO,
            poll_period: Duration::from_millis(16),
            texture: TextureRequirement::new(540, 960, PixelFormat::R8),
        }
    }

    /// Defaults overlaid with `VPS_*` environment variables.
    ///
    /// `VPS_LOCATION_IDS` is a comma-separated list.
    pub fn from_env() -> Result<Self> {
        let ids = read_env_string("VPS_LOCATION_IDS", "");
        let location_ids = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut settings = Settings::new(location_ids);
        settings.endpoint = read_env_string("VPS_URL", DEFAULT_ENDPOINT);
        settings.api_path = read_env_string("VPS_API_PATH", DEFAULT_API_PATH);
        settings.send_gps = read_env_bool("VPS_SEND_GPS", settings.send_gps);
        settings.fails_count_to_reset_session =
            read_env_u32("VPS_FAILS_TO_RESET", settings.fails_count_to_reset_session);
        settings.max_angle_x = read_env_f64("VPS_MAX_ANGLE_X", settings.max_angle_x);
        settings.max_angle_z = read_env_f64("VPS_MAX_ANGLE_Z", settings.max_angle_z);
        settings.localization_interval =
            read_env_secs("VPS_LOCALIZATION_INTERVAL_S", settings.localization_interval);
        settings.calibration_interval =
            read_env_secs("VPS_CALIBRATION_INTERVAL_S", settings.calibration_interval);
        settings.request_timeout = read_env_secs("VPS_TIMEOUT_S", settings.request_timeout);
        settings.poll_period = Duration::from_millis(u64::from(read_env_u32(
            "VPS_POLL_MS",
            settings.poll_period.as_millis() as u32,
        )));

        let mode = read_env_string("VPS_MODE", "texture");
        match LocalizationMode::parse(&mode) {
            Some(m) => settings.mode = m,
            None => log::warn!(
                "Unknown VPS_MODE='{}', using texture (supported: texture|features|both)",
                mode
            ),
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.location_ids.is_empty() {
            return Err(VpsError::Config(
                "location id list is empty, it must have at least one value".into(),
            ));
        }
        if self.fails_count_to_reset_session == 0 {
            return Err(VpsError::Config(
                "fails_count_to_reset_session must be at least 1".into(),
            ));
        }
        for (name, angle) in [("max_angle_x", self.max_angle_x), ("max_angle_z", self.max_angle_z)] {
            if !(angle > 0.0 && angle <= 180.0) {
                return Err(VpsError::Config(format!(
                    "{} must be in (0, 180], got {}",
                    name, angle
                )));
            }
        }
        if self.poll_period.is_zero() {
            return Err(VpsError::Config("poll_period must be positive".into()));
        }
        Ok(())
    }

    /// Full request URL: endpoint joined with the API path.
    pub fn request_url(&self) -> String {
        join_url(&self.endpoint, &self.api_path)
    }
}

/// Tuning of the anchor correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionOptions {
    /// Jumps longer than this (in meters) are applied without animation.
    pub max_interpolation_distance: f64,
    /// Interpolation progress per second.
    pub lerp_speed: f64,
    /// Keep pitch and roll from tracking; correct heading only.
    pub rotate_only_y: bool,
    /// Ignore the vertical component of the correction.
    pub freeze_y_pos: bool,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            max_interpolation_distance: 5.0,
            lerp_speed: 2.0,
            rotate_only_y: true,
            freeze_y_pos: false,
        }
    }
}

impl CorrectionOptions {
    pub fn from_env() -> Self {
        let defaults = CorrectionOptions::default();
        Self {
            max_interpolation_distance: read_env_f64(
                "VPS_MAX_INTERPOLATION_DISTANCE",
                defaults.max_interpolation_distance,
            ),
            lerp_speed: read_env_f64("VPS_LERP_SPEED", defaults.lerp_speed),
            rotate_only_y: read_env_bool("VPS_ROTATE_ONLY_Y", defaults.rotate_only_y),
            freeze_y_pos: read_env_bool("VPS_FREEZE_Y", defaults.freeze_y_pos),
        }
    }
}

pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    let base = endpoint.replace('\\', "/");
    let path = path.replace('\\', "/");
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base;
    }
    if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn read_env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
