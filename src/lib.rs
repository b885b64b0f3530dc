//! # vps-client - Visual positioning client for AR tracking
//!
//! Periodically localizes the device against a visual positioning server and
//! keeps the local tracking frame aligned with the server's absolute pose.
//! Provides:
//! - The localization loop: readiness and angle gating, capture, optional
//!   on-device inference, request dispatch and result routing
//! - Anchor correction with smooth interpolation towards each new pose
//! - The request/response codec and its error taxonomy
//! - Session bookkeeping that discards a session after repeated failures
//! - C FFI for engines that drive correction from their own frame loop
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use vps_client::sim::{StaticCamera, StaticTracking};
//! use vps_client::{LocalizationEvent, MemoryUserIdStore, Providers, Settings, VpsService};
//!
//! let providers = Providers {
//!     tracking: Some(Arc::new(StaticTracking::new())),
//!     camera: Some(Arc::new(StaticCamera::new())),
//!     ar_supported: true,
//!     ..Default::default()
//! };
//! let mut service = VpsService::new(providers, Box::new(MemoryUserIdStore::new()));
//! let events = service.events();
//!
//! let mut settings = Settings::new(vec!["my-location".into()]);
//! settings.endpoint = "http://127.0.0.1:8000/".into();
//! service.start(settings).unwrap();
//!
//! for event in events.iter().take(5) {
//!     match event {
//!         LocalizationEvent::Localized(loc) => println!("at {:?}", loc.vps_position),
//!         LocalizationEvent::Error(e) => println!("{}", e),
//!         LocalizationEvent::AngleChanged(ok) => println!("angle ok: {}", ok),
//!     }
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod providers;
pub mod protocol;
pub mod session;
pub mod correction;
pub mod inference;
pub mod metrics;
pub mod transport;
pub mod algorithm;
pub mod orchestrator;
pub mod service;
pub mod sim;
pub mod ffi;

pub use error::VpsError;
pub use types::*;
pub use config::{CorrectionOptions, Settings};
pub use providers::{
    AssetProvider, CameraProvider, FeatureExtractor, GeoProvider, PixelFormat, Providers,
    TextureRequirement, TrackingProvider,
};
pub use session::SessionInfo;
pub use correction::{Correction, PoseCorrector};
pub use inference::InferenceGate;
pub use metrics::Metrics;
pub use transport::{HttpTransport, Transport, TransportRequest, TransportResponse};
pub use algorithm::{EventHub, LocalizationAlgorithm, LocalizationEvent, SimulatedAlgorithm};
pub use orchestrator::{angle_ok, Orchestrator, Phase};
pub use service::{FileUserIdStore, MemoryUserIdStore, UserIdStore, VpsService};

/// Result type alias for vps-client operations.
pub type Result<T> = std::result::Result<T, VpsError>;
