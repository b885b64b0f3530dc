//! The localization loop against the server.
//!
//! One worker thread runs attempts back to back: wait for the camera, wait
//! for an acceptable device orientation, capture, optionally run on-device
//! inference, send, decode, then correct the anchor and report. Every wait
//! also listens on the stop channel, so [`Orchestrator::stop`] returns
//! promptly even with a request in flight.

use crate::algorithm::{sleep_or_stop, EventHub, LocalizationAlgorithm, LocalizationEvent, Worker};
use crate::config::Settings;
use crate::correction::PoseCorrector;
use crate::inference::InferenceGate;
use crate::metrics::{self, Metrics};
use crate::protocol::{self, SensorCapture};
use crate::providers::{CameraProvider, Providers, TextureRequirement, TrackingProvider};
use crate::session::{SessionInfo, SessionTracker};
use crate::transport::{Transport, TransportRequest};
use crate::types::{
    Capabilities, ErrorInfo, ErrorKind, LocalizationMode, LocalizationResult, Pose,
};
use crate::{Result, VpsError};
use crossbeam_channel::Receiver;
use nalgebra::Vector3;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// True when the device is held close enough to upright for a usable capture.
///
/// `euler` is the tracking orientation in degrees, each axis in [0, 360).
pub fn angle_ok(euler: &Vector3<f64>, max_angle_x: f64, max_angle_z: f64) -> bool {
    let within = |angle: f64, max: f64| angle < max || angle > 360.0 - max;
    within(euler.x, max_angle_x) && within(euler.z, max_angle_z)
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WaitingReadiness,
    WaitingAngle,
    Capturing,
    AwaitingResponse,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct LoopState {
    phase: Phase,
    result: LocalizationResult,
    tracker: SessionTracker,
}

impl LoopState {
    fn new(fails_count_to_reset: u32) -> Self {
        Self {
            phase: Phase::Idle,
            result: LocalizationResult::NotLocalized,
            tracker: SessionTracker::new(fails_count_to_reset),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LoopState>,
    paused: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Server-backed [`LocalizationAlgorithm`].
pub struct Orchestrator {
    settings: Settings,
    providers: Providers,
    transport: Arc<dyn Transport>,
    corrector: Arc<PoseCorrector>,
    gate: Arc<InferenceGate>,
    metrics: Metrics,
    user_id: String,
    shared: Arc<Shared>,
    events: EventHub,
    worker: Option<Worker>,
}

impl Orchestrator {
    /// Points `transport` at the settings' request URL.
    pub fn new(
        settings: Settings,
        providers: Providers,
        mut transport: Box<dyn Transport>,
        user_id: impl Into<String>,
    ) -> Self {
        transport.set_endpoint(&settings.request_url());
        let threshold = settings.fails_count_to_reset_session;
        Self {
            settings,
            providers,
            transport: Arc::from(transport),
            corrector: Arc::new(PoseCorrector::default()),
            gate: Arc::new(InferenceGate::new()),
            metrics: Metrics::new(),
            user_id: user_id.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::new(threshold)),
                paused: AtomicBool::new(false),
            }),
            events: EventHub::new(),
            worker: None,
        }
    }

    pub fn with_corrector(mut self, corrector: Arc<PoseCorrector>) -> Self {
        self.corrector = corrector;
        self
    }

    /// Share the inference pipeline with other users of the same model.
    pub fn with_inference_gate(mut self, gate: Arc<InferenceGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Emit to the caller's subscribers instead of a private set.
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn corrector(&self) -> &Arc<PoseCorrector> {
        &self.corrector
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn phase(&self) -> Phase {
        let phase = self.shared.lock().phase;
        match phase {
            Phase::Idle | Phase::Stopped => phase,
            _ if self.shared.paused.load(Ordering::Relaxed) => Phase::Paused,
            _ => phase,
        }
    }
}

impl LocalizationAlgorithm for Orchestrator {
    fn run(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(mut finished) = self.worker.take() {
            finished.stop();
        }

        self.settings.validate()?;
        if self.settings.mode.needs_inference()
            && !self.providers.capabilities().contains(Capabilities::INFERENCE)
        {
            return Err(VpsError::Config(format!(
                "{:?} mode needs a feature extractor",
                self.settings.mode
            )));
        }

        *self.shared.lock() = LoopState::new(self.settings.fails_count_to_reset_session);
        self.shared.paused.store(false, Ordering::Relaxed);

        let attempts = Attempts {
            settings: self.settings.clone(),
            providers: self.providers.clone(),
            transport: self.transport.clone(),
            corrector: self.corrector.clone(),
            gate: self.gate.clone(),
            metrics: self.metrics.clone(),
            user_id: self.user_id.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
        };

        log::info!(
            "Localization started: {:?} mode, locations {:?}",
            self.settings.mode,
            self.settings.location_ids
        );
        self.worker = Some(Worker::spawn("vps-localization", move |stop| {
            attempts.run(&stop)
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        if let (true, Some(extractor)) = (self.settings.mode.needs_inference(), &self.providers.extractor) {
            extractor.cancel();
        }
        worker.stop();
        self.shared.lock().phase = Phase::Stopped;
        log::info!("Localization stopped");
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        log::debug!("Localization paused");
    }

    fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        log::debug!("Localization resumed");
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    fn location_state(&self) -> LocalizationResult {
        self.shared.lock().result.clone()
    }

    fn session_info(&self) -> Option<SessionInfo> {
        Some(self.shared.lock().tracker.session().clone())
    }

    fn events(&self) -> Receiver<LocalizationEvent> {
        self.events.subscribe()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Inference {
    Done(Vec<u8>, Duration),
    Skipped,
    Stopped,
}

/// Worker-side half of the orchestrator.
struct Attempts {
    settings: Settings,
    providers: Providers,
    transport: Arc<dyn Transport>,
    corrector: Arc<PoseCorrector>,
    gate: Arc<InferenceGate>,
    metrics: Metrics,
    user_id: String,
    shared: Arc<Shared>,
    events: EventHub,
}

impl Attempts {
    fn run(self, stop: &Receiver<()>) {
        let Some((tracking, camera)) = self.start_checks() else {
            self.set_phase(Phase::Stopped);
            return;
        };

        self.metrics.start(metrics::FULL_LOCALIZATION);
        self.metrics.reset_attempts();

        let mut gate_open = true;
        while self.attempt(stop, tracking.as_ref(), camera.as_ref(), &mut gate_open) {}
        log::debug!("Localization loop exited");
    }

    fn set_phase(&self, phase: Phase) {
        self.shared.lock().phase = phase;
    }

    fn emit(&self, event: LocalizationEvent) {
        self.events.emit(event);
    }

    fn start_checks(&self) -> Option<(Arc<dyn TrackingProvider>, Arc<dyn CameraProvider>)> {
        let capabilities = self.providers.capabilities();
        log::debug!("Capabilities: {:?}", capabilities);
        if !capabilities.contains(Capabilities::AR_SUPPORTED) {
            self.fail_startup(ErrorKind::ArNotSupported, "AR is not supported on this device");
            return None;
        }
        if !capabilities.contains(Capabilities::CAMERA) {
            self.fail_startup(ErrorKind::NoCamera, "Camera is not available");
            return None;
        }
        let camera = self.providers.camera.clone()?;
        camera.init(&self.camera_requirements());

        if !capabilities.contains(Capabilities::TRACKING) {
            self.fail_startup(ErrorKind::TrackingNotAvailable, "Tracking is not available");
            return None;
        }
        let tracking = self.providers.tracking.clone()?;
        Some((tracking, camera))
    }

    fn fail_startup(&self, kind: ErrorKind, message: &str) {
        let error = ErrorInfo::new(kind, message);
        log::error!("Localization cannot start: {}", error);
        self.shared.lock().result = LocalizationResult::Failed(error.clone());
        self.emit(LocalizationEvent::Error(error));
    }

    fn camera_requirements(&self) -> Vec<TextureRequirement> {
        let mut requirements = Vec::with_capacity(3);
        if self.settings.mode.sends_image() {
            requirements.push(self.settings.texture);
        }
        if let (true, Some(extractor)) = (self.settings.mode.needs_inference(), &self.providers.extractor) {
            requirements.push(extractor.extractor_requirement());
            requirements.push(extractor.encoder_requirement());
        }
        requirements
    }

    /// One attempt. Returns false once stopped.
    fn attempt(
        &self,
        stop: &Receiver<()>,
        tracking: &dyn TrackingProvider,
        camera: &dyn CameraProvider,
        gate_open: &mut bool,
    ) -> bool {
        let poll = self.settings.poll_period;

        if self.shared.paused.load(Ordering::Relaxed) {
            self.set_phase(Phase::Paused);
            while self.shared.paused.load(Ordering::Relaxed) {
                if !sleep_or_stop(stop, poll) {
                    return false;
                }
            }
        }

        self.set_phase(Phase::WaitingReadiness);
        while !camera.is_ready() {
            if !sleep_or_stop(stop, poll) {
                return false;
            }
        }

        self.set_phase(Phase::WaitingAngle);
        self.metrics.start(metrics::TOTAL_WAITING);
        loop {
            let ok = angle_ok(
                &tracking.local_pose().euler_deg(),
                self.settings.max_angle_x,
                self.settings.max_angle_z,
            );
            if ok != *gate_open {
                *gate_open = ok;
                log::debug!("Angle gate {}", if ok { "open" } else { "closed" });
                self.emit(LocalizationEvent::AngleChanged(ok));
            }
            if ok {
                break;
            }
            if !sleep_or_stop(stop, poll) {
                return false;
            }
        }
        self.metrics.stop(metrics::TOTAL_WAITING);

        self.set_phase(Phase::Capturing);
        let Some(mut request) = self.capture(tracking, camera) else {
            return sleep_or_stop(stop, poll);
        };

        let mut inference_time = Duration::ZERO;
        if self.settings.mode.needs_inference() {
            match self.infer(stop, camera) {
                Inference::Done(embedding, elapsed) => {
                    request.embedding = Some(embedding);
                    inference_time = elapsed;
                }
                Inference::Skipped => return sleep_or_stop(stop, poll),
                Inference::Stopped => return false,
            }
        }

        self.set_phase(Phase::AwaitingResponse);
        let Some(result) = self.dispatch(stop, request) else {
            return false;
        };
        self.route(result, tracking);

        let interval = if self.shared.lock().tracker.is_establishing() {
            self.settings.localization_interval
        } else {
            self.settings.calibration_interval
        };
        self.set_phase(Phase::WaitingReadiness);
        sleep_or_stop(stop, interval.saturating_sub(inference_time))
    }

    /// Snapshot tracking and sensors and build the request. None skips the attempt.
    fn capture(
        &self,
        tracking: &dyn TrackingProvider,
        camera: &dyn CameraProvider,
    ) -> Option<TransportRequest> {
        let snapshot = tracking.local_pose();
        let timestamp = protocol::unix_timestamp();

        let image = if self.settings.mode.sends_image() {
            match camera.capture_frame(&self.settings.texture) {
                Some(frame) if !frame.is_empty() => Some(frame),
                _ => {
                    log::error!("Camera frame is not available");
                    return None;
                }
            }
        } else {
            None
        };

        let intrinsics_for = match (self.settings.mode, &self.providers.extractor) {
            (LocalizationMode::Features, Some(extractor)) => extractor.extractor_requirement(),
            _ => self.settings.texture,
        };
        let (gps, compass) = match &self.providers.geo {
            Some(geo) => (geo.gps(), geo.compass()),
            None => (None, None),
        };
        let capture = SensorCapture {
            tracking: snapshot,
            gps,
            compass,
            intrinsics: camera.intrinsics(&intrinsics_for),
            timestamp,
        };

        let session_id = self.shared.lock().tracker.session().id.clone();
        let request = protocol::build_request(
            &self.settings.location_ids,
            &session_id,
            &self.user_id,
            &capture,
        );
        let meta = match protocol::encode_request(&request) {
            Ok(meta) => meta,
            Err(e) => {
                log::error!("Failed to encode request: {}", e);
                return None;
            }
        };

        Some(TransportRequest {
            image,
            image_name: format!("{}.jpg", (timestamp * 1000.0) as u64),
            embedding: None,
            meta,
        })
    }

    fn infer(&self, stop: &Receiver<()>, camera: &dyn CameraProvider) -> Inference {
        let Some(extractor) = self.providers.extractor.clone() else {
            return Inference::Skipped;
        };
        let Some(permit) = self.gate.acquire(stop) else {
            return Inference::Stopped;
        };

        let extractor_input = camera.capture_buffer(&extractor.extractor_requirement());
        let encoder_input = camera.capture_buffer(&extractor.encoder_requirement());
        let (extractor_input, encoder_input) = match (extractor_input, encoder_input) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => (a, b),
            _ => {
                log::error!("Camera buffers for inference are not available");
                return Inference::Skipped;
            }
        };

        self.metrics.start(metrics::TOTAL_INFERENCE);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = std::thread::Builder::new()
            .name("vps-inference".into())
            .spawn(move || {
                let _ = tx.send(extractor.infer(&extractor_input, &encoder_input));
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn inference thread: {}", e);
            return Inference::Skipped;
        }

        let outcome = crossbeam_channel::select! {
            recv(rx) -> outcome => outcome,
            recv(stop) -> _ => return Inference::Stopped,
        };
        let elapsed = self.metrics.stop(metrics::TOTAL_INFERENCE);
        drop(permit);

        match outcome {
            Ok(Ok(embedding)) => Inference::Done(embedding, elapsed),
            Ok(Err(e)) => {
                log::warn!("{}", e);
                Inference::Skipped
            }
            Err(_) => {
                log::error!("Inference thread exited without a result");
                Inference::Skipped
            }
        }
    }

    /// Send on a helper thread. None when stopped before the response arrived.
    fn dispatch(&self, stop: &Receiver<()>, request: TransportRequest) -> Option<LocalizationResult> {
        let transport = self.transport.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);

        self.metrics.start(metrics::REQUEST);
        let spawned = std::thread::Builder::new()
            .name("vps-request".into())
            .spawn(move || {
                let _ = tx.send(transport.send(&request));
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn request thread: {}", e);
            return Some(protocol::network_failure());
        }

        let response = crossbeam_channel::select! {
            recv(rx) -> response => response,
            recv(stop) -> _ => return None,
        };
        self.metrics.stop(metrics::REQUEST);

        Some(match response {
            Ok(Ok(response)) => protocol::decode_response(response.status, &response.body),
            Ok(Err(e)) => {
                log::warn!("Request failed: {}", e);
                protocol::network_failure()
            }
            Err(_) => {
                log::error!("Request thread exited without a result");
                protocol::network_failure()
            }
        })
    }

    fn route(&self, result: LocalizationResult, tracking: &dyn TrackingProvider) {
        if self.shared.paused.load(Ordering::Relaxed) {
            log::debug!("Paused, dropping response");
            return;
        }

        let attempt = self.metrics.record_attempt();
        match result {
            LocalizationResult::Localized(localization) => {
                if !tracking.is_localized() {
                    let elapsed = self.metrics.stop(metrics::FULL_LOCALIZATION);
                    log::info!(
                        "First localization after {} attempt(s) in {:.2}s",
                        attempt,
                        elapsed.as_secs_f64()
                    );
                    self.metrics.reset_attempts();
                }

                let changed = tracking.localize(&localization.location_id);
                let instantly = {
                    let mut state = self.shared.lock();
                    let instantly = state.tracker.is_establishing();
                    state.tracker.record_success(changed);
                    state.result = LocalizationResult::Localized(localization.clone());
                    instantly
                };

                let current = tracking.local_pose();
                self.corrector
                    .set_camera_local(Pose::new(current.position, current.rotation));
                let correction = self.corrector.apply(&localization, instantly);
                log::info!(
                    "Localized in {}: correction {:?} / {:?}{}",
                    localization.location_id,
                    correction.position,
                    correction.rotation,
                    if correction.animated { " (animated)" } else { "" }
                );
                self.emit(LocalizationEvent::Localized(localization));
            }
            LocalizationResult::Failed(error) => {
                {
                    let mut state = self.shared.lock();
                    state.tracker.record_failure();
                    state.result = LocalizationResult::Failed(error.clone());
                }
                log::warn!("Localization failed: {}", error);
                self.emit(LocalizationEvent::Error(error));
            }
            LocalizationResult::NotLocalized => {}
        }
    }
}
