//! Signal detectors.
//!
//! Each detector runs as its own task, samples one capability at a fixed
//! cadence and posts [`MonitorEvent`]s to the owning session controller. A
//! detector never touches session state directly.

pub mod audio;
pub mod face;
pub mod focus;
pub mod fullscreen;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::CapabilityError;
use crate::metrics::SENSOR_OUTAGES_TOTAL;
use crate::models::violation::{DetectionSignal, SignalSource, ViolationKind};
use crate::services::session_controller::MonitorEvent;

pub use audio::{AudioDetector, NoiseGate};
pub use face::{classify_face, eye_aspect_ratio, FaceDetector};
pub use focus::FocusDetector;
pub use fullscreen::{ExitIntent, FullscreenDetector};

#[async_trait]
pub trait SignalDetector: Send + 'static {
    fn source(&self) -> SignalSource;

    fn cadence(&self) -> Duration;

    /// One sampling tick. `Ok(None)` means nothing to report.
    async fn sample(&mut self) -> Result<Option<DetectionSignal>, CapabilityError>;
}

/// Runs `detector` until the returned handle is aborted or the controller
/// queue closes.
pub fn spawn_detector<D>(mut detector: D, events: mpsc::Sender<MonitorEvent>) -> JoinHandle<()>
where
    D: SignalDetector,
{
    tokio::spawn(async move {
        let source = detector.source();
        let mut ticker = tokio::time::interval(detector.cadence());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut degraded = false;

        loop {
            ticker.tick().await;

            let event = match detector.sample().await {
                Ok(signal) => {
                    let restored = degraded.then_some(MonitorEvent::SensorRestored { source });
                    if degraded {
                        tracing::info!("Detector recovered: source={}", source);
                        degraded = false;
                    }
                    if let Some(restored) = restored {
                        if events.send(restored).await.is_err() {
                            break;
                        }
                    }
                    signal.map(MonitorEvent::Signal)
                }
                Err(e) if !degraded => {
                    tracing::warn!("Detector unavailable: source={}, error={}", source, e);
                    SENSOR_OUTAGES_TOTAL
                        .with_label_values(&[source.as_str()])
                        .inc();
                    degraded = true;
                    Some(MonitorEvent::SensorUnavailable {
                        source,
                        detail: e.to_string(),
                    })
                }
                Err(_) => None,
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }

        tracing::debug!("Detector stopped: source={}", source);
    })
}

/// Running detector tasks of one session.
#[derive(Debug, Default)]
pub struct DetectorSet {
    handles: Vec<(SignalSource, JoinHandle<()>)>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<D: SignalDetector>(&mut self, detector: D, events: mpsc::Sender<MonitorEvent>) {
        let source = detector.source();
        self.handles.push((source, spawn_detector(detector, events)));
    }

    pub fn sources(&self) -> Vec<SignalSource> {
        self.handles.iter().map(|(source, _)| *source).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Aborts every detector. Signals already queued stay in the controller queue.
    pub fn stop_all(&mut self) {
        for (_, handle) in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for DetectorSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Reports a condition once when it starts and again only after it changed.
#[derive(Debug, Default)]
pub struct EdgeTrigger {
    last: Option<ViolationKind>,
}

impl EdgeTrigger {
    pub fn update(&mut self, current: Option<ViolationKind>) -> Option<ViolationKind> {
        let fired = match current {
            Some(kind) if self.last != Some(kind) => Some(kind),
            _ => None,
        };
        self.last = current;
        fired
    }
}
