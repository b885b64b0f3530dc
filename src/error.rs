use std::fmt;

/// Errors raised by the client itself (configuration, I/O, transport plumbing).
///
/// Localization failures reported by the server are not errors in this sense;
/// they travel as [`crate::ErrorInfo`] inside a [`crate::LocalizationResult`].
#[derive(Debug, thiserror::Error)]
pub enum VpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed HTTP response: {0}")]
    MalformedResponse(String),

    #[error("On-device model is not ready (progress {0:.2})")]
    NotReady(f32),

    #[error("Localization service is not running")]
    NotRunning,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &dyn fmt::Display) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
