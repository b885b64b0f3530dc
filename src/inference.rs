//! Exclusive access to the on-device inference pipeline.

use crossbeam_channel::{Receiver, Sender};

/// Binary semaphore around the feature extractor and encoder.
///
/// Backed by a one-slot channel holding a single token. Share it with an
/// `Arc` between every loop that may run inference.
#[derive(Debug)]
pub struct InferenceGate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// Held while inference runs. Dropping it hands the token back.
#[derive(Debug)]
pub struct InferencePermit {
    tx: Sender<()>,
}

impl Drop for InferencePermit {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
        log::trace!("Inference permit released");
    }
}

impl InferenceGate {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.try_send(());
        Self { tx, rx }
    }

    pub fn is_free(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn try_acquire(&self) -> Option<InferencePermit> {
        self.rx.try_recv().ok().map(|_| self.permit())
    }

    /// Wait for the token. Returns None if `stop` fires first.
    pub fn acquire(&self, stop: &Receiver<()>) -> Option<InferencePermit> {
        crossbeam_channel::select! {
            recv(self.rx) -> token => token.ok().map(|_| self.permit()),
            recv(stop) -> _ => None,
        }
    }

    fn permit(&self) -> InferencePermit {
        log::trace!("Inference permit taken");
        InferencePermit {
            tx: self.tx.clone(),
        }
    }
}

impl Default for InferenceGate {
    fn default() -> Self {
        Self::new()
    }
}
