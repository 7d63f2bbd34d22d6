//! Platform capabilities the proctoring core depends on.
//!
//! Detectors and the session controller only see these traits. The HTTP host
//! backs them with [`BrowserBridge`](super::browser_bridge::BrowserBridge);
//! tests back them with in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::models::telemetry::{FocusState, FrameSample};

#[async_trait]
pub trait FocusWatcher: Send + Sync {
    async fn focus_state(&self) -> Result<FocusState, CapabilityError>;
}

#[async_trait]
pub trait FullscreenController: Send + Sync {
    /// Resolves once the user granted fullscreen, or fails.
    async fn request_fullscreen(&self) -> Result<(), CapabilityError>;
    async fn exit_fullscreen(&self) -> Result<(), CapabilityError>;
    async fn is_fullscreen(&self) -> Result<bool, CapabilityError>;
}

#[async_trait]
pub trait CameraFrameSource: Send + Sync {
    async fn acquire(&self) -> Result<(), CapabilityError>;
    async fn release(&self) -> Result<(), CapabilityError>;
    async fn sample_frame(&self) -> Result<FrameSample, CapabilityError>;
}

#[async_trait]
pub trait MicLevelSource: Send + Sync {
    async fn acquire(&self) -> Result<(), CapabilityError>;
    async fn release(&self) -> Result<(), CapabilityError>;
    /// Byte frequency data of the latest analyser read.
    async fn frequency_data(&self) -> Result<Vec<u8>, CapabilityError>;
}

/// Capability set handed to one session controller.
#[derive(Clone)]
pub struct Capabilities {
    pub focus: Arc<dyn FocusWatcher>,
    pub fullscreen: Arc<dyn FullscreenController>,
    pub camera: Arc<dyn CameraFrameSource>,
    pub microphone: Arc<dyn MicLevelSource>,
}

impl Capabilities {
    /// Uses one object for all four capabilities.
    pub fn from_shared<T>(shared: Arc<T>) -> Self
    where
        T: FocusWatcher + FullscreenController + CameraFrameSource + MicLevelSource + 'static,
    {
        Self {
            focus: shared.clone(),
            fullscreen: shared.clone(),
            camera: shared.clone(),
            microphone: shared,
        }
    }
}
