use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{EdgeTrigger, SignalDetector};
use crate::config::ProctoringSettings;
use crate::error::CapabilityError;
use crate::models::telemetry::{FaceLandmarks, Point};
use crate::models::violation::{DetectionSignal, SignalSource, ViolationKind};
use crate::services::capabilities::CameraFrameSource;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceThresholds {
    /// Average eye aspect ratio below which the eyes count as closed.
    pub eye_openness: f64,
    /// Horizontal nose-to-chin offset in pixels above which the head counts as turned.
    pub head_turn_px: f64,
}

impl FaceThresholds {
    pub fn from_settings(settings: &ProctoringSettings) -> Self {
        Self {
            eye_openness: settings.eye_openness_threshold,
            head_turn_px: settings.head_turn_threshold_px,
        }
    }
}

impl Default for FaceThresholds {
    fn default() -> Self {
        Self {
            eye_openness: 0.15,
            head_turn_px: 60.0,
        }
    }
}

/// (|p1-p5| + |p2-p4|) / (2 |p0-p3|). `None` when the eye corners coincide.
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> Option<f64> {
    let vertical = eye[1].distance(&eye[5]) + eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal <= f64::EPSILON {
        return None;
    }
    Some(vertical / (2.0 * horizontal))
}

/// Classification of one frame, with the measurement that triggered it.
/// Checked in order: no face, closed eyes, turned head.
pub fn classify_face(
    face: Option<&FaceLandmarks>,
    thresholds: &FaceThresholds,
) -> Option<(ViolationKind, Option<f64>)> {
    let face = match face {
        Some(face) if face.is_finite() => face,
        _ => return Some((ViolationKind::FaceNotVisible, None)),
    };

    match (
        eye_aspect_ratio(&face.left_eye),
        eye_aspect_ratio(&face.right_eye),
    ) {
        (Some(left), Some(right)) => {
            let ear = (left + right) / 2.0;
            if ear < thresholds.eye_openness {
                return Some((ViolationKind::EyesClosed, Some(ear)));
            }
        }
        // Collapsed eye landmarks mean the detector did not really see a face.
        _ => return Some((ViolationKind::FaceNotVisible, None)),
    }

    let tilt = (face.nose_tip.x - face.chin.x).abs();
    if tilt > thresholds.head_turn_px {
        return Some((ViolationKind::LookingAway, Some(tilt)));
    }

    None
}

pub struct FaceDetector {
    camera: Arc<dyn CameraFrameSource>,
    thresholds: FaceThresholds,
    cadence: Duration,
    edge: EdgeTrigger,
}

impl FaceDetector {
    pub fn new(
        camera: Arc<dyn CameraFrameSource>,
        thresholds: FaceThresholds,
        cadence: Duration,
    ) -> Self {
        Self {
            camera,
            thresholds,
            cadence,
            edge: EdgeTrigger::default(),
        }
    }
}

#[async_trait]
impl SignalDetector for FaceDetector {
    fn source(&self) -> SignalSource {
        SignalSource::Face
    }

    fn cadence(&self) -> Duration {
        self.cadence
    }

    async fn sample(&mut self) -> Result<Option<DetectionSignal>, CapabilityError> {
        let frame = self.camera.sample_frame().await?;
        let classified = classify_face(frame.face.as_ref(), &self.thresholds);

        let fired = self.edge.update(classified.map(|(kind, _)| kind));
        Ok(fired.map(|kind| match classified.and_then(|(_, severity)| severity) {
            Some(severity) => DetectionSignal::with_severity(kind, severity),
            None => DetectionSignal::new(kind),
        }))
    }
}
