//! Localization strategies and the worker thread they run on.
//!
//! [`crate::Orchestrator`] talks to the server; [`SimulatedAlgorithm`]
//! (free flight) pretends every attempt succeeds at the current tracking
//! pose, for demos and content authoring without a server.

use crate::config::Settings;
use crate::orchestrator::angle_ok;
use crate::providers::TrackingProvider;
use crate::session::SessionInfo;
use crate::types::{ErrorInfo, Localization, LocalizationResult};
use crate::{Result, VpsError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Notification emitted by a running algorithm, in the order things happened.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalizationEvent {
    Localized(Localization),
    Error(ErrorInfo),
    /// The angle gate opened (true) or closed (false).
    AngleChanged(bool),
}

/// A way of keeping the tracking frame localized.
pub trait LocalizationAlgorithm: Send {
    /// Start the loop. No-op while already running.
    fn run(&mut self) -> Result<()>;

    /// Stop the loop and abandon in-flight work. Idempotent.
    fn stop(&mut self);

    fn pause(&self);

    fn resume(&self);

    fn is_running(&self) -> bool;

    /// Most recent attempt outcome, by copy.
    fn location_state(&self) -> LocalizationResult;

    /// Counters of the current session, if the algorithm keeps any.
    fn session_info(&self) -> Option<SessionInfo> {
        None
    }

    /// New subscription. It receives every event emitted after this call.
    fn events(&self) -> Receiver<LocalizationEvent>;
}

/// Fan-out of events to every live subscriber.
///
/// Clones share one subscriber list. A subscriber whose receiver was dropped
/// is pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<LocalizationEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<LocalizationEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: LocalizationEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<LocalizationEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background thread with a stop channel.
///
/// Stop is signalled by dropping the only sender, so every `select!` that
/// includes the receiver wakes up at once.
pub(crate) struct Worker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Worker>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(stop_rx))
            .map_err(|e| VpsError::Spawn(format!("{}: {}", name, e)))?;

        Ok(Worker {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub(crate) fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Localization worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `duration` unless stopped first. Returns false once stopped.
pub(crate) fn sleep_or_stop(stop: &Receiver<()>, duration: Duration) -> bool {
    crossbeam_channel::select! {
        recv(stop) -> _ => false,
        default(duration) => true,
    }
}

/// Free-flight mode: every attempt "succeeds" at the current tracking pose.
pub struct SimulatedAlgorithm {
    settings: Settings,
    tracking: Arc<dyn TrackingProvider>,
    paused: Arc<AtomicBool>,
    state: Arc<Mutex<LocalizationResult>>,
    events: EventHub,
    worker: Option<Worker>,
}

impl SimulatedAlgorithm {
    pub fn new(settings: Settings, tracking: Arc<dyn TrackingProvider>) -> Self {
        Self {
            settings,
            tracking,
            paused: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(LocalizationResult::NotLocalized)),
            events: EventHub::new(),
            worker: None,
        }
    }

    /// Emit to the caller's subscribers instead of a private set.
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }
}

impl LocalizationAlgorithm for SimulatedAlgorithm {
    fn run(&mut self) -> Result<()> {
        if self.worker.as_ref().is_some_and(Worker::is_running) {
            return Ok(());
        }
        self.stop();
        self.settings.validate()?;

        let settings = self.settings.clone();
        let tracking = self.tracking.clone();
        let paused = self.paused.clone();
        let state = self.state.clone();
        let events = self.events.clone();

        log::info!("Free flight started");
        self.worker = Some(Worker::spawn("vps-free-flight", move |stop| {
            free_flight_loop(&settings, tracking.as_ref(), &paused, &state, &events, &stop);
            log::info!("Free flight stopped");
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    fn location_state(&self) -> LocalizationResult {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn events(&self) -> Receiver<LocalizationEvent> {
        self.events.subscribe()
    }
}

impl Drop for SimulatedAlgorithm {
    fn drop(&mut self) {
        self.stop();
    }
}

fn free_flight_loop(
    settings: &Settings,
    tracking: &dyn TrackingProvider,
    paused: &AtomicBool,
    state: &Mutex<LocalizationResult>,
    events: &EventHub,
    stop: &Receiver<()>,
) {
    let mut gate_open = true;
    loop {
        while paused.load(Ordering::Relaxed) {
            if !sleep_or_stop(stop, settings.poll_period) {
                return;
            }
        }

        loop {
            let ok = angle_ok(
                &tracking.local_pose().euler_deg(),
                settings.max_angle_x,
                settings.max_angle_z,
            );
            if ok != gate_open {
                gate_open = ok;
                events.emit(LocalizationEvent::AngleChanged(ok));
            }
            if ok {
                break;
            }
            if !sleep_or_stop(stop, settings.poll_period) {
                return;
            }
        }

        if !sleep_or_stop(stop, settings.localization_interval) {
            return;
        }

        let pose = tracking.local_pose();
        let location_id = if pose.location_id.is_empty() {
            settings.location_ids.first().cloned().unwrap_or_default()
        } else {
            pose.location_id.clone()
        };
        let euler = pose.euler_deg();
        let localization = Localization {
            vps_position: pose.position,
            vps_rotation: euler,
            tracking_position: pose.position,
            tracking_rotation: euler,
            location_id,
        };

        tracking.localize(&localization.location_id);
        *state.lock().unwrap_or_else(PoisonError::into_inner) =
            LocalizationResult::Localized(localization.clone());
        log::debug!("Free flight localized in {}", localization.location_id);
        events.emit(LocalizationEvent::Localized(localization));
    }
}
