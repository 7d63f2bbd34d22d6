use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of proctoring violation reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitched,
    FocusLost,
    FullscreenExited,
    FaceNotVisible,
    EyesClosed,
    LookingAway,
    BackgroundNoise,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 7] = [
        ViolationKind::TabSwitched,
        ViolationKind::FocusLost,
        ViolationKind::FullscreenExited,
        ViolationKind::FaceNotVisible,
        ViolationKind::EyesClosed,
        ViolationKind::LookingAway,
        ViolationKind::BackgroundNoise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::TabSwitched => "tab_switched",
            ViolationKind::FocusLost => "focus_lost",
            ViolationKind::FullscreenExited => "fullscreen_exited",
            ViolationKind::FaceNotVisible => "face_not_visible",
            ViolationKind::EyesClosed => "eyes_closed",
            ViolationKind::LookingAway => "looking_away",
            ViolationKind::BackgroundNoise => "background_noise",
        }
    }

    /// Human readable text shown in warnings.
    pub fn description(&self) -> &'static str {
        match self {
            ViolationKind::TabSwitched => "Tab switched",
            ViolationKind::FocusLost => "Focus lost",
            ViolationKind::FullscreenExited => "Fullscreen exited",
            ViolationKind::FaceNotVisible => "Face not visible",
            ViolationKind::EyesClosed => "Eyes closed",
            ViolationKind::LookingAway => "Looking away",
            ViolationKind::BackgroundNoise => "Background noise detected",
        }
    }

    pub fn source(&self) -> SignalSource {
        match self {
            ViolationKind::TabSwitched | ViolationKind::FocusLost => SignalSource::Focus,
            ViolationKind::FullscreenExited => SignalSource::Fullscreen,
            ViolationKind::FaceNotVisible | ViolationKind::EyesClosed | ViolationKind::LookingAway => {
                SignalSource::Face
            }
            ViolationKind::BackgroundNoise => SignalSource::Audio,
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The detector that produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Focus,
    Fullscreen,
    Face,
    Audio,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Focus => "focus",
            SignalSource::Fullscreen => "fullscreen",
            SignalSource::Face => "face",
            SignalSource::Audio => "audio",
        }
    }
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient observation produced by one sampling tick of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSignal {
    pub kind: ViolationKind,
    pub severity: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl DetectionSignal {
    pub fn new(kind: ViolationKind) -> Self {
        Self {
            kind,
            severity: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_severity(kind: ViolationKind, severity: f64) -> Self {
        Self {
            kind,
            severity: Some(severity),
            observed_at: Utc::now(),
        }
    }

    pub fn source(&self) -> SignalSource {
        self.kind.source()
    }
}

/// Accepted violation; immutable once appended to the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub sequence: u64,
    pub reason: ViolationKind,
    pub timestamp: DateTime<Utc>,
}

/// Persisted representation of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationLogEntry {
    pub reason: ViolationKind,
    pub timestamp: DateTime<Utc>,
}

impl From<&ViolationEvent> for ViolationLogEntry {
    fn from(event: &ViolationEvent) -> Self {
        Self {
            reason: event.reason,
            timestamp: event.timestamp,
        }
    }
}
