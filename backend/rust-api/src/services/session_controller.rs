//! Session controller: the state machine that owns one proctored exam session.
//!
//! `Pending -> Active -> Terminating -> Closed`. Detectors and the clock post
//! [`MonitorEvent`]s to a single queue; the controller drains it in batches so
//! that events arriving together are evaluated together. Within one batch a
//! violation-limit termination wins over a clock expiry, which wins over a
//! manual submit.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::{ProctoringSettings, SubmissionSettings};
use crate::error::{CapabilityError, GatewayError, ProctorError};
use crate::metrics::{record_session_outcome, PROCTORED_SESSIONS_ACTIVE, SUBMISSION_ATTEMPTS_TOTAL};
use crate::models::attempt::{AttemptSubmission, SubmissionReceipt};
use crate::models::timer::ClockEvent;
use crate::models::violation::{DetectionSignal, SignalSource, ViolationLogEntry};
use crate::models::{ExamSession, SessionNotice, SessionSnapshot, SessionState, TerminationReason};
use crate::services::capabilities::Capabilities;
use crate::services::detectors::audio::{AudioDetector, NoiseGate};
use crate::services::detectors::face::{FaceDetector, FaceThresholds};
use crate::services::detectors::focus::FocusDetector;
use crate::services::detectors::fullscreen::{ExitIntent, FullscreenDetector};
use crate::services::detectors::DetectorSet;
use crate::services::session_clock::{ClockHandle, SessionClock};
use crate::services::submission_gateway::SubmissionGateway;
use crate::services::violation_aggregator::{AggregatorSettings, ViolationAggregator};
use crate::utils::retry::retry_when;

const EVENT_QUEUE_CAPACITY: usize = 256;
const NOTICE_CAPACITY: usize = 64;

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum MonitorEvent {
    Signal(DetectionSignal),
    Clock(ClockEvent),
    SensorUnavailable {
        source: SignalSource,
        detail: String,
    },
    SensorRestored {
        source: SignalSource,
    },
    AnswerSelected {
        question: usize,
        option: Option<usize>,
        reply: oneshot::Sender<Result<(), ProctorError>>,
    },
    SubmitRequested,
    RetrySubmission,
}

pub struct SessionController {
    session: ExamSession,
    settings: ProctoringSettings,
    submission: SubmissionSettings,
    capabilities: Capabilities,
    gateway: Arc<dyn SubmissionGateway>,
    aggregator: ViolationAggregator,
    clock: Option<ClockHandle>,
    detectors: DetectorSet,
    exit_intent: ExitIntent,
    events_tx: mpsc::Sender<MonitorEvent>,
    events_rx: mpsc::Receiver<MonitorEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    remaining_seconds: u32,
    degraded: BTreeSet<SignalSource>,
    final_submission: Option<AttemptSubmission>,
    submission_due: bool,
    submission_attempts: u32,
    receipt: Option<SubmissionReceipt>,
    last_error: Option<String>,
}

impl SessionController {
    pub fn new(
        session: ExamSession,
        settings: ProctoringSettings,
        submission: SubmissionSettings,
        capabilities: Capabilities,
        gateway: Arc<dyn SubmissionGateway>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let aggregator = ViolationAggregator::new(AggregatorSettings::from_proctoring(
            &settings,
            session.violation_threshold,
        ));
        let remaining_seconds = session.duration_seconds;
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::pending(&session));

        Self {
            session,
            settings,
            submission,
            capabilities,
            gateway,
            aggregator,
            clock: None,
            detectors: DetectorSet::new(),
            exit_intent: ExitIntent::default(),
            events_tx,
            events_rx,
            snapshot_tx,
            notices,
            remaining_seconds,
            degraded: BTreeSet::new(),
            final_submission: None,
            submission_due: false,
            submission_attempts: 0,
            receipt: None,
            last_error: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.session.id.clone(),
            events: self.events_tx.clone(),
            snapshot: self.snapshot_tx.subscribe(),
            notices: self.notices.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &ExamSession {
        &self.session
    }

    pub fn violation_log(&self) -> Vec<ViolationLogEntry> {
        self.aggregator.persisted_log()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Acquires fullscreen and media, then enters `Active`.
    ///
    /// A refused or unanswered permission leaves the session `Pending`, so the
    /// student can try again.
    pub async fn start(&mut self) -> Result<(), ProctorError> {
        if self.session.state != SessionState::Pending {
            return Err(ProctorError::InvalidState {
                actual: self.session.state,
            });
        }

        if let Err(e) = self.acquire_devices().await {
            tracing::warn!(
                "Session start refused: session_id={}, error={}",
                self.session.id,
                e
            );
            record_session_outcome("permission_denied");
            return Err(e);
        }

        let started_at = Utc::now();
        self.session.state = SessionState::Active;
        self.session.started_at = Some(started_at);
        self.remaining_seconds = self.session.duration_seconds;

        self.clock = Some(SessionClock::start(
            self.session.id.clone(),
            self.session.duration_seconds,
            self.settings.clock_tick(),
            self.events_tx.clone(),
        ));
        self.spawn_detectors();

        PROCTORED_SESSIONS_ACTIVE.inc();
        record_session_outcome("started");
        tracing::info!(
            "Session started: session_id={}, exam_id={}, student_id={}, duration={}s, threshold={}, detectors={:?}",
            self.session.id,
            self.session.exam_id,
            self.session.student_id,
            self.session.duration_seconds,
            self.session.violation_threshold,
            self.detectors.sources()
        );

        self.notify(SessionNotice::Started {
            session_id: self.session.id.clone(),
            started_at,
            duration_seconds: self.session.duration_seconds,
        });
        self.publish();
        Ok(())
    }

    async fn acquire_devices(&self) -> Result<(), ProctorError> {
        let limit = self.settings.permission_timeout();
        let caps = self.capabilities.clone();

        acquire("fullscreen", limit, caps.fullscreen.request_fullscreen()).await?;

        if self.session.require_camera_mic {
            if let Err(e) = acquire("camera", limit, caps.camera.acquire()).await {
                release_quietly("fullscreen", caps.fullscreen.exit_fullscreen()).await;
                return Err(e);
            }
            if let Err(e) = acquire("microphone", limit, caps.microphone.acquire()).await {
                release_quietly("camera", caps.camera.release()).await;
                release_quietly("fullscreen", caps.fullscreen.exit_fullscreen()).await;
                return Err(e);
            }
        }
        Ok(())
    }

    fn spawn_detectors(&mut self) {
        let tx = self.events_tx.clone();
        let caps = self.capabilities.clone();

        if !self.session.allow_tab_switching {
            self.detectors.spawn(
                FocusDetector::new(caps.focus.clone(), self.settings.focus_poll()),
                tx.clone(),
            );
        }
        self.detectors.spawn(
            FullscreenDetector::new(
                caps.fullscreen.clone(),
                self.exit_intent.clone(),
                self.settings.fullscreen_poll(),
            ),
            tx.clone(),
        );
        if self.session.require_camera_mic {
            self.detectors.spawn(
                FaceDetector::new(
                    caps.camera.clone(),
                    FaceThresholds::from_settings(&self.settings),
                    self.settings.face_sample(),
                ),
                tx.clone(),
            );
            self.detectors.spawn(
                AudioDetector::new(
                    caps.microphone.clone(),
                    NoiseGate::from_settings(&self.settings),
                    self.settings.audio_sample(),
                ),
                tx,
            );
        }
    }

    /// Applies one batch of queued events. Returns the termination reason if
    /// this batch moved the session to `Terminating`.
    ///
    /// Events are applied in arrival order, but the termination decision is
    /// taken once for the whole batch. Answers queued behind an expiry, a
    /// submit or the violation that reached the limit are refused.
    pub fn process(&mut self, batch: Vec<MonitorEvent>) -> Option<TerminationReason> {
        let now = Instant::now();
        let mut limit_reached = false;
        let mut expired = false;
        let mut submit_requested = false;

        for event in batch {
            match event {
                MonitorEvent::Signal(signal) => {
                    if !limit_reached {
                        limit_reached = self.on_signal(&signal, now);
                    }
                }
                MonitorEvent::Clock(event) => {
                    expired |= event.is_expiry();
                    self.on_clock(event);
                }
                MonitorEvent::SensorUnavailable { source, detail } => {
                    self.on_sensor_unavailable(source, detail)
                }
                MonitorEvent::SensorRestored { source } => self.on_sensor_restored(source),
                MonitorEvent::AnswerSelected {
                    question,
                    option,
                    reply,
                } => {
                    let closing = self.session.state == SessionState::Active
                        && (limit_reached || expired || submit_requested);
                    let result = if closing {
                        tracing::debug!(
                            "Answer refused after submission trigger: session_id={}, question={}",
                            self.session.id,
                            question
                        );
                        Err(ProctorError::InvalidState {
                            actual: SessionState::Terminating,
                        })
                    } else {
                        self.select_answer(question, option)
                    };
                    let _ = reply.send(result);
                }
                MonitorEvent::SubmitRequested => submit_requested = true,
                MonitorEvent::RetrySubmission => self.on_retry_requested(),
            }
        }

        let mut triggered = None;
        if limit_reached && self.begin_termination(TerminationReason::ViolationLimit) {
            triggered = Some(TerminationReason::ViolationLimit);
        }

        if expired && self.begin_termination(TerminationReason::Timeout) {
            triggered = Some(TerminationReason::Timeout);
        }

        if submit_requested {
            if self.session.state == SessionState::Pending {
                tracing::debug!(
                    "Submit ignored before start: session_id={}",
                    self.session.id
                );
            } else if self.begin_termination(TerminationReason::Manual) {
                triggered = Some(TerminationReason::Manual);
            }
        }

        self.publish();
        triggered
    }

    /// Returns true when the accepted violation reached the threshold.
    fn on_signal(&mut self, signal: &DetectionSignal, now: Instant) -> bool {
        if self.session.state != SessionState::Active {
            tracing::debug!(
                "Signal dropped outside active state: session_id={}, state={}, reason={}",
                self.session.id,
                self.session.state,
                signal.kind
            );
            return false;
        }

        let outcome = self.aggregator.record(signal, now);
        let Some(event) = outcome.event else {
            return false;
        };

        let threshold = self.session.violation_threshold;
        tracing::warn!(
            "Violation recorded: session_id={}, student_id={}, reason={}, sequence={}, count={}/{}",
            self.session.id,
            self.session.student_id,
            event.reason,
            event.sequence,
            outcome.new_total,
            threshold
        );

        if outcome.new_total >= threshold {
            return true;
        }

        if outcome.should_warn {
            self.notify(SessionNotice::ViolationWarning {
                reason: event.reason,
                count: outcome.new_total,
                threshold,
                message: format!(
                    "Warning {}/{}: {}. The exam is submitted automatically after {} violations.",
                    outcome.new_total,
                    threshold,
                    event.reason.description(),
                    threshold
                ),
            });
        }
        false
    }

    fn on_clock(&mut self, event: ClockEvent) {
        if self.session.state != SessionState::Active {
            return;
        }
        self.remaining_seconds = self.remaining_seconds.min(event.remaining_seconds());
        self.notify(SessionNotice::from(event));
    }

    fn on_sensor_unavailable(&mut self, source: SignalSource, detail: String) {
        if self.session.state != SessionState::Active {
            return;
        }
        tracing::info!(
            "Continuing without sensor: session_id={}, source={}, detail={}",
            self.session.id,
            source,
            detail
        );
        self.degraded.insert(source);
        self.notify(SessionNotice::SensorDegraded { source, detail });
    }

    fn on_sensor_restored(&mut self, source: SignalSource) {
        if self.session.state != SessionState::Active {
            return;
        }
        if self.degraded.remove(&source) {
            tracing::info!(
                "Sensor restored: session_id={}, source={}",
                self.session.id,
                source
            );
            self.notify(SessionNotice::SensorRestored { source });
        }
    }

    fn on_retry_requested(&mut self) {
        if self.session.state == SessionState::Terminating
            && !self.submission_due
            && !self.session.is_submitted()
        {
            tracing::info!(
                "Manual submission retry: session_id={}",
                self.session.id
            );
            self.submission_due = true;
        }
    }

    pub fn select_answer(
        &mut self,
        question: usize,
        option: Option<usize>,
    ) -> Result<(), ProctorError> {
        if self.session.state != SessionState::Active {
            return Err(ProctorError::InvalidState {
                actual: self.session.state,
            });
        }
        let slot = self
            .session
            .answers
            .get_mut(question)
            .ok_or(ProctorError::InvalidAnswer { question })?;
        *slot = option;
        Ok(())
    }

    /// Single entry point to submission. Returns false when the session is not
    /// `Active`, so racing triggers collapse into the first one.
    pub fn begin_termination(&mut self, reason: TerminationReason) -> bool {
        if self.session.state != SessionState::Active {
            tracing::debug!(
                "Termination trigger ignored: session_id={}, state={}, reason={}",
                self.session.id,
                self.session.state,
                reason
            );
            return false;
        }

        if let Some(mut clock) = self.clock.take() {
            clock.cancel();
        }
        self.detectors.stop_all();
        self.aggregator.seal();

        self.session.state = SessionState::Terminating;
        self.session.termination_reason = Some(reason);
        PROCTORED_SESSIONS_ACTIVE.dec();

        let violation_count = self.aggregator.total();
        self.final_submission = Some(AttemptSubmission {
            exam_id: self.session.exam_id.clone(),
            student_id: self.session.student_id.clone(),
            answers: self.session.answers.clone(),
            termination_reason: reason,
            violation_log: self.aggregator.persisted_log(),
            started_at: self.session.started_at,
        });
        self.submission_due = true;

        if reason.is_automatic() {
            tracing::warn!(
                "Session auto-submitting: session_id={}, reason={}, violations={}",
                self.session.id,
                reason,
                violation_count
            );
        } else {
            tracing::info!(
                "Session submitting: session_id={}, violations={}",
                self.session.id,
                violation_count
            );
        }

        self.notify(SessionNotice::Terminating {
            reason,
            violation_count,
        });
        self.publish();
        true
    }

    /// Sends the frozen final state to the gateway, retrying transient
    /// failures. On success the session is `Closed`; on failure it stays
    /// `Terminating` with answers and log intact.
    pub async fn finalize(&mut self) -> Result<SubmissionReceipt, ProctorError> {
        self.submission_due = false;

        if let Some(receipt) = &self.receipt {
            return Ok(receipt.clone());
        }
        let Some(submission) = self.final_submission.clone() else {
            return Err(ProctorError::InvalidState {
                actual: self.session.state,
            });
        };

        let timeout = self.submission.attempt_timeout();
        let gateway = self.gateway.clone();
        let mut attempts_made = 0u32;

        let result = retry_when(
            self.submission.retry_config(),
            GatewayError::is_retryable,
            |attempt| {
                attempts_made = attempt;
                let gateway = gateway.clone();
                let submission = submission.clone();
                async move { submit_once(gateway.as_ref(), &submission, timeout).await }
            },
        )
        .await;

        self.submission_attempts += attempts_made;

        match result {
            Ok(receipt) => {
                self.close(&receipt).await;
                Ok(receipt)
            }
            Err(failure) => {
                let message = format!(
                    "Your exam could not be submitted ({}). Your answers are kept, please retry.",
                    failure.error
                );
                tracing::error!(
                    "Submission failed: session_id={}, attempts={}, error={}",
                    self.session.id,
                    failure.attempts,
                    failure.error
                );
                record_session_outcome("submission_failed");
                self.last_error = Some(failure.error.to_string());
                self.notify(SessionNotice::SubmissionFailed {
                    attempts: failure.attempts,
                    message,
                    retryable: true,
                });
                self.publish();
                Err(ProctorError::SubmissionFailed {
                    attempts: failure.attempts,
                    source: failure.error,
                })
            }
        }
    }

    async fn close(&mut self, receipt: &SubmissionReceipt) {
        if !self.session.mark_submitted() {
            return;
        }
        let reason = self
            .session
            .termination_reason
            .unwrap_or(TerminationReason::Manual);

        self.session.state = SessionState::Closed;
        self.receipt = Some(receipt.clone());
        self.last_error = None;

        if let Some(mut clock) = self.clock.take() {
            clock.cancel();
        }
        self.detectors.stop_all();

        self.exit_intent.mark();
        let caps = self.capabilities.clone();
        release_quietly("fullscreen", caps.fullscreen.exit_fullscreen()).await;
        if self.session.require_camera_mic {
            release_quietly("camera", caps.camera.release()).await;
            release_quietly("microphone", caps.microphone.release()).await;
        }

        record_session_outcome(reason.as_str());
        tracing::info!(
            "Session closed: session_id={}, reason={}, score={}, attempt_id={}",
            self.session.id,
            reason,
            receipt.score,
            receipt.attempt_id
        );

        let message = match reason {
            TerminationReason::Manual => "Exam submitted successfully.".to_string(),
            TerminationReason::ViolationLimit => format!(
                "You have violated the rules {} times. Your exam was submitted automatically.",
                self.aggregator.total()
            ),
            TerminationReason::Timeout => {
                "Time is up. Your exam was submitted automatically.".to_string()
            }
        };
        self.notify(SessionNotice::Submitted {
            reason,
            score: receipt.score,
            message,
        });
        self.publish();
    }

    /// Drives the session until it is `Closed`. Returns the final snapshot.
    pub async fn run(mut self) -> SessionSnapshot {
        loop {
            if self.session.state == SessionState::Closed {
                break;
            }

            if self.submission_due {
                let _ = self.finalize().await;
                continue;
            }

            let Some(first) = self.events_rx.recv().await else {
                break;
            };
            let mut batch = vec![first];
            while let Ok(event) = self.events_rx.try_recv() {
                batch.push(event);
            }
            self.process(batch);
        }

        self.snapshot()
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&mut self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            session_id: self.session.id.clone(),
            exam_id: self.session.exam_id.clone(),
            student_id: self.session.student_id.clone(),
            state: self.session.state,
            started_at: self.session.started_at,
            duration_seconds: self.session.duration_seconds,
            remaining_seconds: self.remaining_seconds,
            violation_count: self.aggregator.total(),
            violation_threshold: self.session.violation_threshold,
            answers: self.session.answers.clone(),
            termination_reason: self.session.termination_reason,
            score: self.receipt.as_ref().map(|r| r.score),
            submission_attempts: self.submission_attempts,
            last_error: self.last_error.clone(),
            degraded_sensors: self.degraded.iter().copied().collect(),
        });
    }
}

async fn acquire<F>(capability: &'static str, limit: Duration, fut: F) -> Result<(), ProctorError>
where
    F: Future<Output = Result<(), CapabilityError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ProctorError::PermissionDenied { capability, source }),
        Err(_) => Err(ProctorError::PermissionDenied {
            capability,
            source: CapabilityError::Timeout(format!("{} permission", capability)),
        }),
    }
}

async fn release_quietly<F>(capability: &'static str, fut: F)
where
    F: Future<Output = Result<(), CapabilityError>>,
{
    if let Err(e) = fut.await {
        tracing::warn!("Failed to release {}: {}", capability, e);
    }
}

async fn submit_once(
    gateway: &dyn SubmissionGateway,
    submission: &AttemptSubmission,
    timeout: Duration,
) -> Result<SubmissionReceipt, GatewayError> {
    let result = match tokio::time::timeout(timeout, gateway.submit(submission)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout.as_millis() as u64)),
    };

    let status = match &result {
        Ok(_) => "success",
        Err(GatewayError::Timeout(_)) => "timeout",
        Err(GatewayError::Transient(_)) => "transient_error",
        Err(GatewayError::Rejected(_)) => "rejected",
    };
    SUBMISSION_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();

    if let Err(e) = &result {
        tracing::warn!(
            "Submission attempt failed: exam_id={}, student_id={}, error={}",
            submission.exam_id,
            submission.student_id,
            e
        );
    }
    result
}

/// Cloneable front of a running controller.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    events: mpsc::Sender<MonitorEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn select_answer(
        &self,
        question: usize,
        option: Option<usize>,
    ) -> Result<(), ProctorError> {
        // A pending controller is not draining its queue yet.
        let state = self.snapshot.borrow().state;
        if state == SessionState::Pending {
            return Err(ProctorError::InvalidState { actual: state });
        }

        let (reply, response) = oneshot::channel();
        self.events
            .send(MonitorEvent::AnswerSelected {
                question,
                option,
                reply,
            })
            .await
            .map_err(|_| ProctorError::SessionGone)?;
        response.await.map_err(|_| ProctorError::SessionGone)?
    }

    pub async fn submit(&self) -> Result<(), ProctorError> {
        let state = self.snapshot.borrow().state;
        if state == SessionState::Pending {
            return Err(ProctorError::InvalidState { actual: state });
        }
        self.send(MonitorEvent::SubmitRequested).await
    }

    pub async fn retry_submission(&self) -> Result<(), ProctorError> {
        let state = self.snapshot.borrow().state;
        if state != SessionState::Terminating {
            return Err(ProctorError::InvalidState { actual: state });
        }
        self.send(MonitorEvent::RetrySubmission).await
    }

    /// Injects an event as if a detector or the clock had produced it.
    pub async fn send(&self, event: MonitorEvent) -> Result<(), ProctorError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProctorError::SessionGone)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Waits until the session is `Closed` or its controller is gone.
    pub async fn wait_closed(&self) -> SessionSnapshot {
        let mut rx = self.snapshot.clone();
        let closed = rx
            .wait_for(|s| s.state == SessionState::Closed)
            .await
            .map(|s| s.clone());
        closed.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Waits until the snapshot satisfies `f` or the controller is gone.
    pub async fn wait_for<F>(&self, f: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let found = rx.wait_for(f).await.map(|s| s.clone());
        found.unwrap_or_else(|_| rx.borrow().clone())
    }
}
