use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{EdgeTrigger, SignalDetector};
use crate::error::CapabilityError;
use crate::models::telemetry::FocusState;
use crate::models::violation::{DetectionSignal, SignalSource, ViolationKind};
use crate::services::capabilities::FocusWatcher;

/// Hidden document wins over a plain blur.
pub fn classify_focus(state: FocusState) -> Option<ViolationKind> {
    if !state.visible {
        Some(ViolationKind::TabSwitched)
    } else if !state.focused {
        Some(ViolationKind::FocusLost)
    } else {
        None
    }
}

pub struct FocusDetector {
    watcher: Arc<dyn FocusWatcher>,
    cadence: Duration,
    edge: EdgeTrigger,
}

impl FocusDetector {
    pub fn new(watcher: Arc<dyn FocusWatcher>, cadence: Duration) -> Self {
        Self {
            watcher,
            cadence,
            edge: EdgeTrigger::default(),
        }
    }
}

#[async_trait]
impl SignalDetector for FocusDetector {
    fn source(&self) -> SignalSource {
        SignalSource::Focus
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn sample(&mut self) -> Result<Option<DetectionSignal>, CapabilityError> {
        let state = self.watcher.focus_state().await?;
        Ok(self.edge.update(classify_focus(state)).map(DetectionSignal::new))
    }
}
