//! Raw observations relayed by the student's browser.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Landmark subset used by the face detector (68-point model indices):
/// six points per eye, the nose tip (nose[3]) and the chin (jaw[8]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: [Point; 6],
    pub right_eye: [Point; 6],
    pub nose_tip: Point,
    pub chin: Point,
}

impl FaceLandmarks {
    pub fn is_finite(&self) -> bool {
        self.left_eye
            .iter()
            .chain(self.right_eye.iter())
            .chain([&self.nose_tip, &self.chin])
            .all(|p| p.x.is_finite() && p.y.is_finite())
    }
}

/// One sampled camera frame after landmark extraction. `face` is `None` when no
/// face was found in the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    pub face: Option<FaceLandmarks>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusState {
    pub visible: bool,
    pub focused: bool,
}

impl Default for FocusState {
    fn default() -> Self {
        Self {
            visible: true,
            focused: true,
        }
    }
}

/// Permission outcomes reported by the browser. `None` means still pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaGrants {
    pub fullscreen: Option<bool>,
    pub camera: Option<bool>,
    pub microphone: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionReport {
    pub fullscreen: Option<bool>,
    pub camera: Option<bool>,
    pub microphone: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct FullscreenReport {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct FrameReport {
    pub face: Option<FaceLandmarks>,
}

/// Byte frequency data of one analyser read (fftSize 512 gives 256 bins).
#[derive(Debug, Deserialize, Validate)]
pub struct AudioReport {
    #[validate(length(min = 1, max = 4096, message = "frequency_bins must hold 1..=4096 values"))]
    pub frequency_bins: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_finite_landmarks() {
        let p = Point::new(1.0, 1.0);
        let mut face = FaceLandmarks {
            left_eye: [p; 6],
            right_eye: [p; 6],
            nose_tip: p,
            chin: p,
        };
        assert!(face.is_finite());

        face.chin = Point::new(f64::NAN, 0.0);
        assert!(!face.is_finite());
    }

    #[test]
    fn audio_report_requires_bins() {
        let report = AudioReport {
            frequency_bins: Vec::new(),
        };
        assert!(report.validate().is_err());
    }
}
