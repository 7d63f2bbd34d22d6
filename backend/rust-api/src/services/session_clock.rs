//! Countdown for one exam session.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::timer::{ClockEvent, TimeExpired, TimerTick};
use crate::services::session_controller::MonitorEvent;

/// Pure countdown state. Each call to [`Countdown::tick`] is one elapsed second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    total: u32,
    remaining: u32,
    expired: bool,
}

impl Countdown {
    pub fn new(total_seconds: u32) -> Self {
        Self {
            total: total_seconds,
            remaining: total_seconds,
            expired: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Returns `TimeExpired` exactly once, on the tick that reaches zero, and
    /// `None` for every tick after it.
    pub fn tick(&mut self, session_id: &str) -> Option<ClockEvent> {
        if self.expired {
            return None;
        }

        self.remaining = self.remaining.saturating_sub(1);
        let timestamp = Utc::now();

        if self.remaining == 0 {
            self.expired = true;
            return Some(ClockEvent::TimeExpired(TimeExpired {
                session_id: session_id.to_string(),
                total_seconds: self.total,
                timestamp,
                message: "Time is up. Your exam is being submitted.".to_string(),
            }));
        }

        Some(ClockEvent::TimerTick(TimerTick {
            session_id: session_id.to_string(),
            remaining_seconds: self.remaining,
            elapsed_seconds: self.total - self.remaining,
            total_seconds: self.total,
            timestamp,
        }))
    }
}

pub struct SessionClock;

impl SessionClock {
    /// Spawns the countdown task. `tick` is one second in production.
    pub fn start(
        session_id: String,
        total_seconds: u32,
        tick: Duration,
        events: mpsc::Sender<MonitorEvent>,
    ) -> ClockHandle {
        let task = tokio::spawn(async move {
            let mut countdown = Countdown::new(total_seconds);
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            loop {
                ticker.tick().await;
                let Some(event) = countdown.tick(&session_id) else {
                    break;
                };
                let expired = event.is_expiry();
                if events.send(MonitorEvent::Clock(event)).await.is_err() {
                    break;
                }
                if expired {
                    tracing::info!("Session clock expired: session_id={}", session_id);
                    break;
                }
            }
        });

        ClockHandle { task: Some(task) }
    }
}

/// Owner of the countdown task. Dropping it cancels the clock.
#[derive(Debug)]
pub struct ClockHandle {
    task: Option<JoinHandle<()>>,
}

impl ClockHandle {
    /// Stops the countdown. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_is_monotonic_and_expires_once() {
        let mut countdown = Countdown::new(3);
        let mut remaining = Vec::new();
        let mut expiries = 0;

        for _ in 0..10 {
            match countdown.tick("s-1") {
                Some(ClockEvent::TimerTick(tick)) => remaining.push(tick.remaining_seconds),
                Some(ClockEvent::TimeExpired(_)) => expiries += 1,
                None => {}
            }
        }

        assert_eq!(remaining, vec![2, 1]);
        assert_eq!(expiries, 1);
        assert!(countdown.is_expired());
        assert_eq!(countdown.remaining(), 0);
    }

    #[test]
    fn zero_duration_expires_on_first_tick() {
        let mut countdown = Countdown::new(0);
        assert!(matches!(
            countdown.tick("s-1"),
            Some(ClockEvent::TimeExpired(_))
        ));
        assert_eq!(countdown.tick("s-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_task_emits_ticks_then_expiry() {
        let (tx, mut rx) = mpsc::channel(16);
        let _clock = SessionClock::start("s-1".to_string(), 2, Duration::from_secs(1), tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert!(matches!(
            first,
            MonitorEvent::Clock(ClockEvent::TimerTick(ref tick)) if tick.remaining_seconds == 1
        ));
        assert!(matches!(
            second,
            MonitorEvent::Clock(ClockEvent::TimeExpired(_))
        ));
        // Task exits after expiry and drops its sender.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_clock_never_fires() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut clock = SessionClock::start("s-1".to_string(), 5, Duration::from_secs(1), tx);
        clock.cancel();
        clock.cancel();

        assert!(rx.recv().await.is_none());
        assert!(!clock.is_running());
    }
}
