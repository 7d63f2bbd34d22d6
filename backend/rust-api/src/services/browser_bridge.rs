//! Capability implementations fed by the student's browser.
//!
//! The browser posts raw observations to the telemetry endpoints; the bridge
//! keeps the latest value of each in a `watch` channel and serves them to the
//! detectors through the capability traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CapabilityError;
use crate::models::telemetry::{FocusState, FrameSample, MediaGrants, PermissionReport};
use crate::services::capabilities::{
    CameraFrameSource, FocusWatcher, FullscreenController, MicLevelSource,
};

#[derive(Debug, Clone)]
struct Stamped<T> {
    received_at: Instant,
    value: T,
}

pub struct BrowserBridge {
    grants: watch::Sender<MediaGrants>,
    focus: watch::Sender<FocusState>,
    fullscreen: watch::Sender<bool>,
    frame: watch::Sender<Option<Stamped<FrameSample>>>,
    audio: watch::Sender<Option<Stamped<Vec<u8>>>>,
    camera_acquired: AtomicBool,
    microphone_acquired: AtomicBool,
    stale_after: Duration,
}

impl BrowserBridge {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            grants: watch::channel(MediaGrants::default()).0,
            focus: watch::channel(FocusState::default()).0,
            fullscreen: watch::channel(false).0,
            frame: watch::channel(None).0,
            audio: watch::channel(None).0,
            camera_acquired: AtomicBool::new(false),
            microphone_acquired: AtomicBool::new(false),
            stale_after,
        }
    }

    /// Merges a permission report. Fields left out keep their previous value.
    pub fn report_permissions(&self, report: PermissionReport) {
        self.grants.send_modify(|grants| {
            if report.fullscreen.is_some() {
                grants.fullscreen = report.fullscreen;
            }
            if report.camera.is_some() {
                grants.camera = report.camera;
            }
            if report.microphone.is_some() {
                grants.microphone = report.microphone;
            }
        });
    }

    pub fn report_focus(&self, state: FocusState) {
        self.focus.send_replace(state);
    }

    pub fn report_fullscreen(&self, active: bool) {
        self.fullscreen.send_replace(active);
    }

    pub fn report_frame(&self, frame: FrameSample) {
        self.frame.send_replace(Some(Stamped {
            received_at: Instant::now(),
            value: frame,
        }));
    }

    pub fn report_audio(&self, bins: Vec<u8>) {
        self.audio.send_replace(Some(Stamped {
            received_at: Instant::now(),
            value: bins,
        }));
    }

    pub fn grants(&self) -> MediaGrants {
        *self.grants.borrow()
    }

    /// Waits until the browser answered the permission prompt selected by `pick`.
    async fn await_grant<F>(&self, capability: &str, pick: F) -> Result<(), CapabilityError>
    where
        F: Fn(&MediaGrants) -> Option<bool>,
    {
        let mut rx = self.grants.subscribe();
        let answer = rx
            .wait_for(|grants| pick(grants).is_some())
            .await
            .map(|grants| pick(&grants))
            .map_err(|_| CapabilityError::Unavailable(format!("{} relay closed", capability)))?;

        match answer {
            Some(true) => Ok(()),
            _ => Err(CapabilityError::PermissionDenied(format!(
                "{} access was refused",
                capability
            ))),
        }
    }

    fn revoked(&self, pick: impl Fn(&MediaGrants) -> Option<bool>) -> bool {
        pick(&self.grants.borrow()) == Some(false)
    }

    fn fresh<T: Clone>(
        &self,
        slot: &watch::Sender<Option<Stamped<T>>>,
        what: &str,
    ) -> Result<T, CapabilityError> {
        let latest = slot.borrow();
        match latest.as_ref() {
            None => Err(CapabilityError::Unavailable(format!(
                "no {} sample received yet",
                what
            ))),
            Some(sample) if sample.received_at.elapsed() > self.stale_after => {
                Err(CapabilityError::Unavailable(format!(
                    "{} feed stale for {}s",
                    what,
                    sample.received_at.elapsed().as_secs()
                )))
            }
            Some(sample) => Ok(sample.value.clone()),
        }
    }
}

#[async_trait]
impl FocusWatcher for BrowserBridge {
    async fn focus_state(&self) -> Result<FocusState, CapabilityError> {
        Ok(*self.focus.borrow())
    }
}

#[async_trait]
impl FullscreenController for BrowserBridge {
    async fn request_fullscreen(&self) -> Result<(), CapabilityError> {
        self.await_grant("fullscreen", |g| g.fullscreen).await?;
        // The grant means the browser entered fullscreen.
        self.fullscreen.send_replace(true);
        Ok(())
    }

    async fn exit_fullscreen(&self) -> Result<(), CapabilityError> {
        self.fullscreen.send_replace(false);
        Ok(())
    }

    async fn is_fullscreen(&self) -> Result<bool, CapabilityError> {
        Ok(*self.fullscreen.borrow())
    }
}

#[async_trait]
impl CameraFrameSource for BrowserBridge {
    async fn acquire(&self) -> Result<(), CapabilityError> {
        self.await_grant("camera", |g| g.camera).await?;
        self.camera_acquired.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), CapabilityError> {
        self.camera_acquired.store(false, Ordering::SeqCst);
        self.frame.send_replace(None);
        Ok(())
    }

    async fn sample_frame(&self) -> Result<FrameSample, CapabilityError> {
        if !self.camera_acquired.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable("camera not acquired".to_string()));
        }
        if self.revoked(|g| g.camera) {
            return Err(CapabilityError::PermissionDenied(
                "camera access was revoked".to_string(),
            ));
        }
        self.fresh(&self.frame, "camera")
    }
}

#[async_trait]
impl MicLevelSource for BrowserBridge {
    async fn acquire(&self) -> Result<(), CapabilityError> {
        self.await_grant("microphone", |g| g.microphone).await?;
        self.microphone_acquired.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), CapabilityError> {
        self.microphone_acquired.store(false, Ordering::SeqCst);
        self.audio.send_replace(None);
        Ok(())
    }

    async fn frequency_data(&self) -> Result<Vec<u8>, CapabilityError> {
        if !self.microphone_acquired.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable(
                "microphone not acquired".to_string(),
            ));
        }
        if self.revoked(|g| g.microphone) {
            return Err(CapabilityError::PermissionDenied(
                "microphone access was revoked".to_string(),
            ));
        }
        self.fresh(&self.audio, "microphone")
    }
}
