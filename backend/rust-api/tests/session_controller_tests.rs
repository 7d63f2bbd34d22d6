mod common;

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use examguard_api::error::{CapabilityError, GatewayError, ProctorError};
use examguard_api::models::telemetry::{FrameSample, PermissionReport};
use examguard_api::models::timer::{ClockEvent, TimeExpired};
use examguard_api::models::{
    DetectionSignal, SessionNotice, SessionState, SignalSource, TerminationReason, ViolationKind,
};
use examguard_api::services::capabilities::FullscreenController;
use examguard_api::services::session_controller::MonitorEvent;

use common::StubGateway;

fn signal(kind: ViolationKind) -> MonitorEvent {
    MonitorEvent::Signal(DetectionSignal::new(kind))
}

fn expiry(session_id: &str) -> MonitorEvent {
    MonitorEvent::Clock(ClockEvent::TimeExpired(TimeExpired {
        session_id: session_id.to_string(),
        total_seconds: 60,
        timestamp: Utc::now(),
        message: "Time is up".to_string(),
    }))
}

fn answer(
    question: usize,
    option: Option<usize>,
) -> (MonitorEvent, oneshot::Receiver<Result<(), ProctorError>>) {
    let (reply, response) = oneshot::channel();
    (
        MonitorEvent::AnswerSelected {
            question,
            option,
            reply,
        },
        response,
    )
}

fn drain_warnings(rx: &mut broadcast::Receiver<SessionNotice>) -> Vec<u32> {
    let mut counts = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        if let SessionNotice::ViolationWarning { count, .. } = notice {
            counts.push(count);
        }
    }
    counts
}

#[tokio::test(start_paused = true)]
async fn test_refused_fullscreen_keeps_session_pending() {
    common::init_tracing();
    let mut h = common::harness(common::session(3, 60), StubGateway::succeeding());
    h.bridge.report_permissions(PermissionReport {
        fullscreen: Some(false),
        camera: None,
        microphone: None,
    });

    let err = h.controller.start().await.unwrap_err();

    match err {
        ProctorError::PermissionDenied { capability, source } => {
            assert_eq!(capability, "fullscreen");
            assert!(matches!(source, CapabilityError::PermissionDenied(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.controller.state(), SessionState::Pending);
    assert_eq!(h.controller.snapshot().state, SessionState::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_permission_prompt_times_out() {
    let mut h = common::harness(common::session(3, 60), StubGateway::succeeding());

    let err = h.controller.start().await.unwrap_err();

    assert!(matches!(
        err,
        ProctorError::PermissionDenied {
            source: CapabilityError::Timeout(_),
            ..
        }
    ));
    assert_eq!(h.controller.state(), SessionState::Pending);

    // A later grant lets the same session start.
    h.bridge.report_permissions(common::grant_all());
    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_camera_refusal_releases_fullscreen() {
    let mut session = common::session(3, 60);
    session.require_camera_mic = true;
    let mut h = common::harness(session, StubGateway::succeeding());
    h.bridge.report_permissions(PermissionReport {
        fullscreen: Some(true),
        camera: Some(false),
        microphone: Some(true),
    });

    let err = h.controller.start().await.unwrap_err();

    assert!(matches!(
        err,
        ProctorError::PermissionDenied {
            capability: "camera",
            ..
        }
    ));
    assert!(!h.bridge.is_fullscreen().await.unwrap());
    assert_eq!(h.controller.state(), SessionState::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let mut h = common::started(common::session(3, 60), StubGateway::succeeding()).await;

    let err = h.controller.start().await.unwrap_err();

    assert!(matches!(
        err,
        ProctorError::InvalidState {
            actual: SessionState::Active
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_signal_within_cooldown_counts_once() {
    let mut h = common::started(common::session(5, 600), StubGateway::succeeding()).await;

    h.controller.process(vec![
        signal(ViolationKind::TabSwitched),
        signal(ViolationKind::TabSwitched),
    ]);
    assert_eq!(h.controller.snapshot().violation_count, 1);

    tokio::time::advance(Duration::from_millis(1_500)).await;
    h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    assert_eq!(h.controller.snapshot().violation_count, 1);

    // The dropped repeat above restarted the cooldown.
    tokio::time::advance(Duration::from_millis(1_500)).await;
    h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    assert_eq!(h.controller.snapshot().violation_count, 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    assert_eq!(h.controller.snapshot().violation_count, 2);

    let log = h.controller.violation_log();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.reason == ViolationKind::TabSwitched));
}

#[tokio::test(start_paused = true)]
async fn test_warnings_are_rate_limited() {
    let mut h = common::started(common::session(5, 600), StubGateway::succeeding()).await;
    let mut notices = h.controller.handle().subscribe();

    h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    h.controller.process(vec![signal(ViolationKind::FullscreenExited)]);
    assert_eq!(drain_warnings(&mut notices), vec![1]);

    tokio::time::advance(Duration::from_secs(4)).await;
    h.controller.process(vec![signal(ViolationKind::LookingAway)]);
    assert_eq!(drain_warnings(&mut notices), vec![3]);
    assert_eq!(h.controller.snapshot().violation_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_third_violation_auto_submits() {
    let gateway = StubGateway::succeeding();
    let mut h = common::started(common::session(3, 600), gateway.clone()).await;
    h.controller.select_answer(1, Some(2)).unwrap();

    let first = h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    let second = h.controller.process(vec![signal(ViolationKind::FullscreenExited)]);
    let third = h.controller.process(vec![signal(ViolationKind::FaceNotVisible)]);

    assert_eq!(first, None);
    assert_eq!(second, None);
    assert_eq!(third, Some(TerminationReason::ViolationLimit));
    assert_eq!(h.controller.state(), SessionState::Terminating);

    let receipt = h.controller.finalize().await.unwrap();
    assert_eq!(receipt.score, 1);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(gateway.calls(), 1);

    let submitted = &gateway.submissions()[0];
    assert_eq!(submitted.termination_reason, TerminationReason::ViolationLimit);
    assert!(submitted.is_auto_submitted());
    assert_eq!(submitted.answers, vec![None, Some(2), None]);
    assert_eq!(submitted.violation_log.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_log_is_frozen_once_terminating() {
    let gateway = StubGateway::succeeding();
    let mut h = common::started(common::session(3, 600), gateway.clone()).await;

    h.controller.process(vec![signal(ViolationKind::TabSwitched)]);
    h.controller.process(vec![MonitorEvent::SubmitRequested]);
    assert_eq!(h.controller.state(), SessionState::Terminating);
    let frozen = h.controller.violation_log();

    h.controller.process(vec![
        signal(ViolationKind::EyesClosed),
        signal(ViolationKind::BackgroundNoise),
    ]);
    assert_eq!(h.controller.violation_log(), frozen);

    h.controller.finalize().await.unwrap();
    h.controller.process(vec![signal(ViolationKind::LookingAway)]);

    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.controller.violation_log(), frozen);
    assert_eq!(gateway.submissions()[0].violation_log, frozen);
    assert!(matches!(
        h.controller.select_answer(0, Some(0)),
        Err(ProctorError::InvalidState {
            actual: SessionState::Closed
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_violation_limit_wins_over_timeout_in_one_batch() {
    let mut h = common::started(common::session(1, 600), StubGateway::succeeding()).await;
    let id = h.controller.session_id().to_string();

    let reason = h.controller.process(vec![
        MonitorEvent::SubmitRequested,
        expiry(&id),
        signal(ViolationKind::TabSwitched),
    ]);

    assert_eq!(reason, Some(TerminationReason::ViolationLimit));
    assert_eq!(
        h.controller.snapshot().termination_reason,
        Some(TerminationReason::ViolationLimit)
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_wins_over_manual_submit_in_one_batch() {
    let mut h = common::started(common::session(3, 600), StubGateway::succeeding()).await;
    let id = h.controller.session_id().to_string();

    let reason = h
        .controller
        .process(vec![MonitorEvent::SubmitRequested, expiry(&id)]);

    assert_eq!(reason, Some(TerminationReason::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_answer_queued_after_expiry_is_refused() {
    let gateway = StubGateway::succeeding();
    let mut h = common::started(common::session(3, 600), gateway.clone()).await;
    let id = h.controller.session_id().to_string();
    let (early, early_reply) = answer(1, Some(1));
    let (late, late_reply) = answer(0, Some(2));

    let reason = h.controller.process(vec![early, expiry(&id), late]);

    assert_eq!(reason, Some(TerminationReason::Timeout));
    assert!(early_reply.await.unwrap().is_ok());
    assert!(matches!(
        late_reply.await.unwrap(),
        Err(ProctorError::InvalidState {
            actual: SessionState::Terminating
        })
    ));

    h.controller.finalize().await.unwrap();
    assert_eq!(gateway.submissions()[0].answers, vec![None, Some(1), None]);
}

#[tokio::test(start_paused = true)]
async fn test_answer_queued_after_submit_or_limit_is_refused() {
    let gateway = StubGateway::succeeding();
    let mut h = common::started(common::session(1, 600), gateway.clone()).await;
    let (after_submit, submit_reply) = answer(0, Some(1));
    let (after_limit, limit_reply) = answer(2, Some(1));

    let reason = h.controller.process(vec![
        signal(ViolationKind::TabSwitched),
        after_limit,
        MonitorEvent::SubmitRequested,
        after_submit,
    ]);

    assert_eq!(reason, Some(TerminationReason::ViolationLimit));
    assert!(limit_reply.await.unwrap().is_err());
    assert!(submit_reply.await.unwrap().is_err());
    assert_eq!(h.controller.session().answers, vec![None, None, None]);
}

#[tokio::test(start_paused = true)]
async fn test_begin_termination_is_idempotent() {
    let mut h = common::started(common::session(3, 600), StubGateway::succeeding()).await;

    assert!(h.controller.begin_termination(TerminationReason::Manual));
    assert!(!h.controller.begin_termination(TerminationReason::Timeout));
    assert!(!h.controller.begin_termination(TerminationReason::ViolationLimit));

    assert_eq!(
        h.controller.session().termination_reason,
        Some(TerminationReason::Manual)
    );
}

#[tokio::test(start_paused = true)]
async fn test_clock_expiry_closes_session() {
    let gateway = StubGateway::succeeding();
    let h = common::started(common::session(3, 1), gateway.clone()).await;
    let handle = h.controller.handle();

    let run = tokio::spawn(h.controller.run());
    let closed = handle.wait_closed().await;

    assert_eq!(closed.state, SessionState::Closed);
    assert_eq!(closed.termination_reason, Some(TerminationReason::Timeout));
    assert_eq!(closed.remaining_seconds, 0);
    assert_eq!(gateway.calls(), 1);

    let last = run.await.unwrap();
    assert_eq!(last.state, SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_double_submit_calls_gateway_once() {
    let gateway = StubGateway::succeeding();
    let h = common::started(common::session(3, 600), gateway.clone()).await;
    let handle = h.controller.handle();
    let run = tokio::spawn(h.controller.run());

    handle.select_answer(0, Some(0)).await.unwrap();
    handle.submit().await.unwrap();
    let _ = handle.submit().await;

    let closed = handle.wait_closed().await;
    run.await.unwrap();

    assert_eq!(closed.termination_reason, Some(TerminationReason::Manual));
    assert_eq!(closed.score, Some(1));
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_wait_for_manual_retry() {
    let gateway = StubGateway::failing(3, GatewayError::Transient("503".to_string()));
    let h = common::started(common::session(3, 600), gateway.clone()).await;
    let handle = h.controller.handle();
    let mut notices = handle.subscribe();
    let run = tokio::spawn(h.controller.run());

    handle.select_answer(2, Some(1)).await.unwrap();
    handle.submit().await.unwrap();

    let failed = handle.wait_for(|s| s.last_error.is_some()).await;
    assert_eq!(failed.state, SessionState::Terminating);
    assert_eq!(failed.submission_attempts, 3);
    assert_eq!(failed.answers, vec![None, None, Some(1)]);
    assert_eq!(gateway.calls(), 3);

    let mut saw_failure = false;
    while let Ok(notice) = notices.try_recv() {
        if let SessionNotice::SubmissionFailed { attempts, retryable, .. } = notice {
            assert_eq!(attempts, 3);
            assert!(retryable);
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    handle.retry_submission().await.unwrap();
    let closed = handle.wait_closed().await;
    run.await.unwrap();

    assert_eq!(closed.state, SessionState::Closed);
    assert_eq!(closed.last_error, None);
    assert_eq!(gateway.calls(), 4);
    assert_eq!(
        gateway.submissions()[0].answers,
        gateway.submissions()[3].answers
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submission_is_not_retried() {
    let gateway = StubGateway::failing(1, GatewayError::Rejected("already attempted".to_string()));
    let mut h = common::started(common::session(3, 600), gateway.clone()).await;

    h.controller.begin_termination(TerminationReason::Manual);
    let err = h.controller.finalize().await.unwrap_err();

    assert!(matches!(
        err,
        ProctorError::SubmissionFailed { attempts: 1, .. }
    ));
    assert_eq!(gateway.calls(), 1);
    assert_eq!(h.controller.state(), SessionState::Terminating);
}

#[tokio::test(start_paused = true)]
async fn test_sensor_outage_is_not_a_violation() {
    let mut session = common::session(3, 600);
    session.require_camera_mic = true;
    let h = common::started(session, StubGateway::succeeding()).await;
    let handle = h.controller.handle();
    let bridge = h.bridge.clone();
    let _run = tokio::spawn(h.controller.run());

    // No frames or audio were ever relayed.
    let degraded = handle
        .wait_for(|s| {
            s.degraded_sensors.contains(&SignalSource::Face)
                && s.degraded_sensors.contains(&SignalSource::Audio)
        })
        .await;
    assert_eq!(degraded.state, SessionState::Active);
    assert_eq!(degraded.violation_count, 0);

    bridge.report_frame(FrameSample { face: None });
    let flagged = handle.wait_for(|s| s.violation_count == 1).await;

    assert!(!flagged.degraded_sensors.contains(&SignalSource::Face));
    assert_eq!(flagged.state, SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_handle_rejects_commands_before_start() {
    let h = common::harness(common::session(3, 60), StubGateway::succeeding());
    let handle = h.controller.handle();

    assert!(matches!(
        handle.select_answer(0, Some(1)).await,
        Err(ProctorError::InvalidState {
            actual: SessionState::Pending
        })
    ));
    assert!(matches!(
        handle.submit().await,
        Err(ProctorError::InvalidState { .. })
    ));
    assert!(matches!(
        handle.retry_submission().await,
        Err(ProctorError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_answer_is_rejected() {
    let mut h = common::started(common::session(3, 60), StubGateway::succeeding()).await;

    assert!(matches!(
        h.controller.select_answer(7, Some(0)),
        Err(ProctorError::InvalidAnswer { question: 7 })
    ));
    h.controller.select_answer(0, Some(1)).unwrap();
    h.controller.select_answer(0, None).unwrap();
    assert_eq!(h.controller.session().answers, vec![None, None, None]);
}
