use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{EdgeTrigger, SignalDetector};
use crate::error::CapabilityError;
use crate::models::violation::{DetectionSignal, SignalSource, ViolationKind};
use crate::services::capabilities::FullscreenController;

/// Set by the controller before it leaves fullscreen itself, so the exit is
/// not reported as a violation.
#[derive(Debug, Clone, Default)]
pub struct ExitIntent(Arc<AtomicBool>);

impl ExitIntent {
    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FullscreenDetector {
    controller: Arc<dyn FullscreenController>,
    intent: ExitIntent,
    cadence: Duration,
    edge: EdgeTrigger,
}

impl FullscreenDetector {
    pub fn new(
        controller: Arc<dyn FullscreenController>,
        intent: ExitIntent,
        cadence: Duration,
    ) -> Self {
        Self {
            controller,
            intent,
            cadence,
            edge: EdgeTrigger::default(),
        }
    }
}

#[async_trait]
impl SignalDetector for FullscreenDetector {
    fn source(&self) -> SignalSource {
        SignalSource::Fullscreen
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn sample(&mut self) -> Result<Option<DetectionSignal>, CapabilityError> {
        let active = self.controller.is_fullscreen().await?;
        let exited = !active && !self.intent.is_marked();
        let condition = exited.then_some(ViolationKind::FullscreenExited);
        Ok(self.edge.update(condition).map(DetectionSignal::new))
    }
}
