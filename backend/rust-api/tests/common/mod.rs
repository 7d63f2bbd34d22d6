#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use examguard_api::config::{ProctoringSettings, SubmissionSettings};
use examguard_api::error::GatewayError;
use examguard_api::models::attempt::{AttemptSubmission, SubmissionReceipt};
use examguard_api::models::telemetry::PermissionReport;
use examguard_api::models::{ExamDefinition, ExamSession, Question, StudentIdentity};
use examguard_api::services::browser_bridge::BrowserBridge;
use examguard_api::services::capabilities::Capabilities;
use examguard_api::services::session_controller::SessionController;
use examguard_api::services::submission_gateway::SubmissionGateway;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn student() -> StudentIdentity {
    StudentIdentity {
        student_id: "student-1".to_string(),
        org_id: "org-1".to_string(),
    }
}

pub fn exam(question_count: usize) -> ExamDefinition {
    ExamDefinition {
        id: "665f1c2e8b3e4a0012345678".to_string(),
        org_id: "org-1".to_string(),
        title: "Integration Exam".to_string(),
        description: None,
        start_time: Utc::now(),
        duration_minutes: 30,
        allow_tab_switching: false,
        require_camera_mic: false,
        max_violations: None,
        questions: (0..question_count)
            .map(|i| Question {
                question: format!("Question {}", i + 1),
                options: vec!["A".to_string(), "B".to_string(), "C".to_string()],
                correct_option: Some(0),
            })
            .collect(),
    }
}

pub fn proctoring() -> ProctoringSettings {
    ProctoringSettings {
        permission_timeout_ms: 500,
        ..ProctoringSettings::default()
    }
}

pub fn submission() -> SubmissionSettings {
    SubmissionSettings {
        max_attempts: 3,
        attempt_timeout_ms: 1_000,
        base_backoff_ms: 100,
        max_backoff_ms: 400,
        gateway_url: None,
        service_token: None,
    }
}

pub fn grant_all() -> PermissionReport {
    PermissionReport {
        fullscreen: Some(true),
        camera: Some(true),
        microphone: Some(true),
    }
}

/// Session under test together with the fakes behind it.
pub struct Harness {
    pub controller: SessionController,
    pub bridge: Arc<BrowserBridge>,
    pub gateway: Arc<StubGateway>,
}

pub fn harness(session: ExamSession, gateway: Arc<StubGateway>) -> Harness {
    let settings = proctoring();
    let bridge = Arc::new(BrowserBridge::new(settings.sensor_stale_after()));
    let controller = SessionController::new(
        session,
        settings,
        submission(),
        Capabilities::from_shared(bridge.clone()),
        gateway.clone(),
    );
    Harness {
        controller,
        bridge,
        gateway,
    }
}

/// Session for [`exam`] with the given threshold and duration.
pub fn session(threshold: u32, duration_seconds: u32) -> ExamSession {
    let mut session = ExamSession::new(&exam(3), &student(), threshold);
    session.violation_threshold = threshold;
    session.duration_seconds = duration_seconds;
    session
}

/// Harness whose controller is already `Active`.
pub async fn started(session: ExamSession, gateway: Arc<StubGateway>) -> Harness {
    let mut harness = harness(session, gateway);
    harness.bridge.report_permissions(grant_all());
    harness
        .controller
        .start()
        .await
        .expect("session should start once permissions are granted");
    harness
}

/// Gateway that records every call and fails the first `failures` of them.
pub struct StubGateway {
    calls: AtomicU32,
    failures_left: AtomicU32,
    failure: GatewayError,
    submissions: Mutex<Vec<AttemptSubmission>>,
}

impl StubGateway {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0, GatewayError::Transient("unused".to_string()))
    }

    pub fn failing(failures: u32, failure: GatewayError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(failures),
            failure,
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<AttemptSubmission> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubmissionGateway for StubGateway {
    async fn submit(
        &self,
        submission: &AttemptSubmission,
    ) -> Result<SubmissionReceipt, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.submissions.lock().unwrap().push(submission.clone());

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.failure.clone());
        }

        Ok(SubmissionReceipt {
            attempt_id: format!("attempt-{}", call),
            score: submission.answers.iter().filter(|a| a.is_some()).count() as u32,
            submitted_at: Utc::now(),
        })
    }
}
