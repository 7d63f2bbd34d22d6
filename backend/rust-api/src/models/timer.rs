use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events published by the session clock.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClockEvent {
    TimerTick(TimerTick),
    TimeExpired(TimeExpired),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimerTick {
    pub session_id: String,
    pub remaining_seconds: u32,
    pub elapsed_seconds: u32,
    pub total_seconds: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimeExpired {
    pub session_id: String,
    pub total_seconds: u32,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ClockEvent {
    pub fn is_expiry(&self) -> bool {
        matches!(self, ClockEvent::TimeExpired(_))
    }

    pub fn remaining_seconds(&self) -> u32 {
        match self {
            ClockEvent::TimerTick(tick) => tick.remaining_seconds,
            ClockEvent::TimeExpired(_) => 0,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ClockEvent::TimerTick(_) => "timer-tick",
            ClockEvent::TimeExpired(_) => "time-expired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_serializes_with_kebab_tag() {
        let event = ClockEvent::TimerTick(TimerTick {
            session_id: "s-1".to_string(),
            remaining_seconds: 59,
            elapsed_seconds: 1,
            total_seconds: 60,
            timestamp: Utc::now(),
        });

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timer-tick");
        assert_eq!(json["remaining_seconds"], 59);
        assert_eq!(event.event_name(), "timer-tick");
        assert!(!event.is_expiry());
    }
}
