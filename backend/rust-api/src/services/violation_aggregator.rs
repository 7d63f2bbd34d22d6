//! Normalizes detector signals into the session's violation log.
//!
//! The aggregator is the only writer of the log. It merges repeats of the same
//! reason inside the dedup cooldown into one incident and decides whether the
//! student should see a warning for an accepted violation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ProctoringSettings;
use crate::metrics::record_violation_signal;
use crate::models::violation::{DetectionSignal, ViolationEvent, ViolationKind, ViolationLogEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub dedup_cooldown: Duration,
    /// Highest total for which a warning is still shown.
    pub warning_ceiling: u32,
    pub warning_cooldown: Duration,
}

impl AggregatorSettings {
    pub fn from_proctoring(settings: &ProctoringSettings, threshold: u32) -> Self {
        Self {
            dedup_cooldown: settings.dedup_cooldown(),
            warning_ceiling: threshold,
            warning_cooldown: settings.warning_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    /// Same reason seen within the dedup cooldown.
    Deduplicated,
    /// Log is sealed; the session is terminating or closed.
    Sealed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accepted => "accepted",
            Disposition::Deduplicated => "deduplicated",
            Disposition::Sealed => "sealed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub disposition: Disposition,
    pub new_total: u32,
    pub should_warn: bool,
    pub event: Option<ViolationEvent>,
}

impl RecordOutcome {
    pub fn is_accepted(&self) -> bool {
        self.disposition == Disposition::Accepted
    }
}

#[derive(Debug)]
pub struct ViolationAggregator {
    settings: AggregatorSettings,
    last_seen: HashMap<ViolationKind, Instant>,
    log: Vec<ViolationEvent>,
    next_sequence: u64,
    warnings_muted_until: Option<Instant>,
    sealed: bool,
}

impl ViolationAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            last_seen: HashMap::new(),
            log: Vec::new(),
            next_sequence: 1,
            warnings_muted_until: None,
            sealed: false,
        }
    }

    pub fn record(&mut self, signal: &DetectionSignal, now: Instant) -> RecordOutcome {
        let kind = signal.kind;

        if self.sealed {
            tracing::debug!("Violation log sealed, dropping signal: reason={}", kind);
            record_violation_signal(kind.as_str(), Disposition::Sealed.as_str());
            return self.rejected(Disposition::Sealed);
        }

        // The timestamp is refreshed even when the signal is dropped, so a
        // continuous condition stays one incident.
        let previous = self.last_seen.insert(kind, now);
        if let Some(previous) = previous {
            if now.saturating_duration_since(previous) < self.settings.dedup_cooldown {
                tracing::debug!(
                    "Duplicate violation within cooldown: reason={}, since_last={}ms",
                    kind,
                    now.saturating_duration_since(previous).as_millis()
                );
                record_violation_signal(kind.as_str(), Disposition::Deduplicated.as_str());
                return self.rejected(Disposition::Deduplicated);
            }
        }

        let event = ViolationEvent {
            sequence: self.next_sequence,
            reason: kind,
            timestamp: signal.observed_at,
        };
        self.next_sequence += 1;
        self.log.push(event.clone());
        record_violation_signal(kind.as_str(), Disposition::Accepted.as_str());

        let new_total = self.total();
        let muted = self.warnings_muted_until.is_some_and(|until| now < until);
        let should_warn = new_total <= self.settings.warning_ceiling && !muted;
        if should_warn {
            self.warnings_muted_until = Some(now + self.settings.warning_cooldown);
        }

        RecordOutcome {
            disposition: Disposition::Accepted,
            new_total,
            should_warn,
            event: Some(event),
        }
    }

    fn rejected(&self, disposition: Disposition) -> RecordOutcome {
        RecordOutcome {
            disposition,
            new_total: self.total(),
            should_warn: false,
            event: None,
        }
    }

    /// Stops accepting signals. Irreversible.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn total(&self) -> u32 {
        self.log.len() as u32
    }

    pub fn events(&self) -> &[ViolationEvent] {
        &self.log
    }

    pub fn persisted_log(&self) -> Vec<ViolationLogEntry> {
        self.log.iter().map(ViolationLogEntry::from).collect()
    }
}
