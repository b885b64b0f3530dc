//! Owner of the running localization algorithm.
//!
//! [`VpsService`] keeps the long-lived pieces (providers, anchor corrector,
//! inference gate, event channel, user id) and swaps the algorithm in and
//! out: server localization normally, [`SimulatedAlgorithm`] in free flight.
//! Subscribers keep one event receiver across restarts and swaps.
//! Every receiver gets its own copy of each event; dropping a receiver
//! unsubscribes it.

use crate::algorithm::{EventHub, LocalizationAlgorithm, LocalizationEvent, SimulatedAlgorithm};
use crate::config::Settings;
use crate::correction::PoseCorrector;
use crate::inference::InferenceGate;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::providers::{AssetProvider, Providers};
use crate::session::SessionInfo;
use crate::transport::{HttpTransport, Transport};
use crate::types::{Capabilities, Localization, LocalizationResult, Pose};
use crate::{Result, VpsError};
use crossbeam_channel::Receiver;
use nalgebra::Vector3;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Builds the transport for a run.
pub type TransportFactory = Box<dyn Fn(&Settings) -> Box<dyn Transport> + Send>;

/// Source of the persistent user id sent with every request.
pub trait UserIdStore: Send {
    fn user_id(&self) -> Result<String>;
}

/// Id generated once per process.
#[derive(Debug, Clone)]
pub struct MemoryUserIdStore {
    id: String,
}

impl MemoryUserIdStore {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for MemoryUserIdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserIdStore for MemoryUserIdStore {
    fn user_id(&self) -> Result<String> {
        Ok(self.id.clone())
    }
}

/// Id generated on first use and kept in a file afterwards.
#[derive(Debug)]
pub struct FileUserIdStore {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileUserIdStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UserIdStore for FileUserIdStore {
    fn user_id(&self) -> Result<String> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let stored = match std::fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents.trim().to_string()).filter(|id| !id.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let id = match stored {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, &id)?;
                log::info!("Generated user id {} ({})", id, self.path.display());
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }
}

/// Entry point for applications: start, stop and query localization.
pub struct VpsService {
    providers: Providers,
    assets: Option<Arc<dyn AssetProvider>>,
    transport_factory: TransportFactory,
    /// True while requests go through the built-in [`HttpTransport`].
    http_transport: bool,
    user_ids: Box<dyn UserIdStore>,
    corrector: Arc<PoseCorrector>,
    gate: Arc<InferenceGate>,
    metrics: Metrics,
    events: EventHub,
    settings: Option<Settings>,
    algorithm: Option<Box<dyn LocalizationAlgorithm>>,
    free_flight: bool,
}

impl VpsService {
    /// Service sending over [`HttpTransport`].
    pub fn new(providers: Providers, user_ids: Box<dyn UserIdStore>) -> Self {
        Self {
            providers,
            assets: None,
            transport_factory: Box::new(|settings: &Settings| -> Box<dyn Transport> {
                Box::new(HttpTransport::new(settings.request_timeout))
            }),
            http_transport: true,
            user_ids,
            corrector: Arc::new(PoseCorrector::default()),
            gate: Arc::new(InferenceGate::new()),
            metrics: Metrics::new(),
            events: EventHub::new(),
            settings: None,
            algorithm: None,
            free_flight: false,
        }
    }

    pub fn with_transport(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self.http_transport = false;
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetProvider>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_corrector(mut self, corrector: Arc<PoseCorrector>) -> Self {
        self.corrector = corrector;
        self
    }

    /// Stop whatever runs and start localizing with `settings`.
    ///
    /// Modes that run on-device inference download the model first and
    /// refuse to start until it is complete. With the built-in transport an
    /// endpoint it cannot reach (such as `https://`) is rejected here.
    pub fn start(&mut self, settings: Settings) -> Result<()> {
        self.stop();
        settings.validate()?;

        if self.http_transport && !self.free_flight {
            HttpTransport::check_url(&settings.request_url())?;
        }

        if settings.send_gps && !self.providers.capabilities().contains(Capabilities::GEO) {
            log::warn!("GPS requested but there is no geo provider");
        }
        if let Some(geo) = &self.providers.geo {
            geo.set_enabled(settings.send_gps);
        }

        if settings.mode.needs_inference() {
            if let Some(assets) = &self.assets {
                if !assets.is_ready() {
                    assets.download()?;
                }
                let progress = assets.progress();
                if progress < 1.0 {
                    log::error!("Model assets are not ready ({:.0}%)", progress * 100.0);
                    return Err(VpsError::NotReady(progress));
                }
            }
        }

        let mut algorithm = self.build_algorithm(&settings)?;
        algorithm.run()?;
        self.algorithm = Some(algorithm);
        self.settings = Some(settings);
        Ok(())
    }

    fn build_algorithm(&self, settings: &Settings) -> Result<Box<dyn LocalizationAlgorithm>> {
        let events = self.events.clone();
        if self.free_flight {
            let tracking = self.providers.tracking.clone().ok_or_else(|| {
                VpsError::Config("free flight needs a tracking provider".into())
            })?;
            return Ok(Box::new(
                SimulatedAlgorithm::new(settings.clone(), tracking).with_events(events),
            ));
        }

        let user_id = self.user_ids.user_id()?;
        let transport = (self.transport_factory)(settings);
        Ok(Box::new(
            Orchestrator::new(settings.clone(), self.providers.clone(), transport, user_id)
                .with_corrector(self.corrector.clone())
                .with_inference_gate(self.gate.clone())
                .with_metrics(self.metrics.clone())
                .with_events(events),
        ))
    }

    pub fn stop(&mut self) {
        if let Some(mut algorithm) = self.algorithm.take() {
            algorithm.stop();
        }
    }

    pub fn pause(&self) {
        if let Some(algorithm) = &self.algorithm {
            algorithm.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(algorithm) = &self.algorithm {
            algorithm.resume();
        }
    }

    pub fn is_running(&self) -> bool {
        self.algorithm.as_ref().is_some_and(|a| a.is_running())
    }

    /// Latest attempt outcome, or None when nothing is running.
    pub fn latest_state(&self) -> Option<LocalizationResult> {
        self.algorithm.as_ref().map(|a| a.location_state())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.algorithm.as_ref().and_then(|a| a.session_info())
    }

    pub fn is_localized(&self) -> bool {
        self.providers
            .tracking
            .as_ref()
            .is_some_and(|tracking| tracking.is_localized())
    }

    /// Model download progress in [0, 1]; 1 without an asset provider.
    pub fn preparing_progress(&self) -> f32 {
        self.assets.as_ref().map_or(1.0, |assets| assets.progress())
    }

    /// Put the anchor back at the origin and forget the tracking localization.
    pub fn reset_tracking(&self) {
        self.corrector.reset();
        if let Some(tracking) = &self.providers.tracking {
            tracking.reset();
        }
        log::info!("Tracking reset");
    }

    /// Pretend the server answered with `position` / `rotation` (Euler degrees).
    ///
    /// Stops the running algorithm, applies the correction at once, localizes
    /// tracking in the first location of the last settings and emits a
    /// success event.
    pub fn mock_localize(&mut self, position: Vector3<f64>, rotation: Vector3<f64>) -> Result<()> {
        let location_id = self
            .settings
            .as_ref()
            .and_then(|s| s.location_ids.first().cloned())
            .ok_or(VpsError::NotRunning)?;
        let tracking = self
            .providers
            .tracking
            .clone()
            .ok_or_else(|| VpsError::Config("mock localization needs a tracking provider".into()))?;

        self.stop();

        let snapshot = tracking.local_pose();
        let localization = Localization {
            vps_position: position,
            vps_rotation: rotation,
            tracking_position: snapshot.position,
            tracking_rotation: snapshot.euler_deg(),
            location_id,
        };

        self.corrector
            .set_camera_local(Pose::new(snapshot.position, snapshot.rotation));
        self.corrector.apply(&localization, true);
        tracking.localize(&localization.location_id);

        log::info!("Mock localization in {}", localization.location_id);
        self.events.emit(LocalizationEvent::Localized(localization));
        Ok(())
    }

    /// Switch between server localization and free flight, restarting if running.
    ///
    /// Leaving free flight resets tracking so no simulated localization
    /// carries over into server mode.
    pub fn set_free_flight(&mut self, enabled: bool) -> Result<()> {
        if self.free_flight == enabled {
            return Ok(());
        }
        self.free_flight = enabled;
        log::info!("Free flight {}", if enabled { "on" } else { "off" });
        let restart = if self.is_running() { self.settings.clone() } else { None };
        self.stop();
        if !enabled {
            self.reset_tracking();
        }

        match restart {
            Some(settings) => self.start(settings),
            None => Ok(()),
        }
    }

    pub fn is_free_flight(&self) -> bool {
        self.free_flight
    }

    /// New subscription to the events of every algorithm this service runs.
    pub fn events(&self) -> Receiver<LocalizationEvent> {
        self.events.subscribe()
    }

    pub fn corrector(&self) -> &Arc<PoseCorrector> {
        &self.corrector
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Drop for VpsService {
    fn drop(&mut self) {
        self.stop();
    }
}
