use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::SignalDetector;
use crate::config::ProctoringSettings;
use crate::error::CapabilityError;
use crate::models::violation::{DetectionSignal, SignalSource, ViolationKind};
use crate::services::capabilities::MicLevelSource;

pub fn average_volume(bins: &[u8]) -> Option<f64> {
    if bins.is_empty() {
        return None;
    }
    let sum: u64 = bins.iter().map(|b| u64::from(*b)).sum();
    Some(sum as f64 / bins.len() as f64)
}

/// Debounces loud samples into background-noise incidents.
///
/// Fires after `required` consecutive samples above `threshold`; a quiet sample
/// resets the run. After firing the gate stays shut for `cooldown` and starts
/// counting from zero again.
#[derive(Debug)]
pub struct NoiseGate {
    threshold: f64,
    required: u32,
    cooldown: Duration,
    consecutive: u32,
    shut_until: Option<Instant>,
}

impl NoiseGate {
    pub fn new(threshold: f64, required: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            required: required.max(1),
            cooldown,
            consecutive: 0,
            shut_until: None,
        }
    }

    pub fn from_settings(settings: &ProctoringSettings) -> Self {
        Self::new(
            settings.noise_volume_threshold,
            settings.noise_consecutive_samples,
            settings.noise_cooldown(),
        )
    }

    /// Feeds one averaged sample. Returns true when an incident fires.
    pub fn observe(&mut self, volume: f64, now: Instant) -> bool {
        if let Some(until) = self.shut_until {
            if now < until {
                return false;
            }
            self.shut_until = None;
            self.consecutive = 0;
        }

        if volume <= self.threshold {
            self.consecutive = 0;
            return false;
        }

        self.consecutive += 1;
        if self.consecutive >= self.required {
            self.consecutive = 0;
            self.shut_until = Some(now + self.cooldown);
            return true;
        }
        false
    }
}

pub struct AudioDetector {
    microphone: Arc<dyn MicLevelSource>,
    gate: NoiseGate,
    cadence: Duration,
}

impl AudioDetector {
    pub fn new(microphone: Arc<dyn MicLevelSource>, gate: NoiseGate, cadence: Duration) -> Self {
        Self {
            microphone,
            gate,
            cadence,
        }
    }
}

#[async_trait]
impl SignalDetector for AudioDetector {
    fn source(&self) -> SignalSource {
        SignalSource::Audio
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn sample(&mut self) -> Result<Option<DetectionSignal>, CapabilityError> {
        let bins = self.microphone.frequency_data().await?;
        let Some(volume) = average_volume(&bins) else {
            return Ok(None);
        };

        if self.gate.observe(volume, Instant::now()) {
            tracing::debug!("Background noise detected: avg_volume={:.1}", volume);
            return Ok(Some(DetectionSignal::with_severity(
                ViolationKind::BackgroundNoise,
                volume,
            )));
        }
        Ok(None)
    }
}
