mod common;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use examguard_api::models::SessionState;
use examguard_api::services::browser_bridge::BrowserBridge;
use examguard_api::services::session_registry::{RegistryError, SessionRegistry};

use common::StubGateway;

struct Registered {
    bridge: Arc<BrowserBridge>,
    gateway: Arc<StubGateway>,
}

async fn registered(registry: &SessionRegistry) -> (String, Registered) {
    registered_until(registry, Utc::now() + chrono::Duration::hours(1)).await
}

async fn registered_until(
    registry: &SessionRegistry,
    closes_at: DateTime<Utc>,
) -> (String, Registered) {
    let h = common::harness(common::session(3, 600), StubGateway::succeeding());
    let session_id = registry
        .insert(h.controller, common::exam(3).paper(), h.bridge.clone(), closes_at)
        .await;
    (
        session_id,
        Registered {
            bridge: h.bridge,
            gateway: h.gateway,
        },
    )
}

#[tokio::test]
async fn test_sessions_are_scoped_to_their_student() {
    let registry = SessionRegistry::new();
    let (session_id, _h) = registered(&registry).await;

    assert!(registry.handle(&session_id, "student-1").await.is_ok());
    assert_eq!(
        registry.handle(&session_id, "student-2").await.err(),
        Some(RegistryError::NotOwner)
    );
    assert_eq!(
        registry.bridge("missing", "student-1").await.err(),
        Some(RegistryError::NotFound)
    );
    assert_eq!(
        registry.paper(&session_id, "student-1").await.unwrap().questions.len(),
        3
    );
}

#[tokio::test]
async fn test_open_session_is_found_for_resume() {
    let registry = SessionRegistry::new();
    let (session_id, _h) = registered(&registry).await;
    let exam_id = common::exam(3).id;

    assert_eq!(
        registry.open_session_for("student-1", &exam_id).await,
        Some(session_id)
    );
    assert_eq!(registry.open_session_for("student-2", &exam_id).await, None);
    assert_eq!(registry.open_session_for("student-1", "other-exam").await, None);
}

#[tokio::test]
async fn test_pending_controller_can_only_be_taken_once() {
    let registry = SessionRegistry::new();
    let (session_id, _h) = registered(&registry).await;

    assert_eq!(
        registry.take_pending(&session_id, "student-2").await.err(),
        Some(RegistryError::NotOwner)
    );

    let controller = registry.take_pending(&session_id, "student-1").await.unwrap();
    assert_eq!(
        registry.take_pending(&session_id, "student-1").await.err(),
        Some(RegistryError::AlreadyStarted)
    );

    registry.restore(controller).await;
    assert!(registry.take_pending(&session_id, "student-1").await.is_ok());
}

#[tokio::test]
async fn test_removing_pending_session_drops_it() {
    let registry = SessionRegistry::new();
    let (session_id, _h) = registered(&registry).await;
    assert_eq!(registry.len().await, 1);

    assert!(registry.remove(&session_id).await);
    assert!(!registry.remove(&session_id).await);
    assert!(registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_launched_session_leaves_registry_when_closed() {
    let registry = SessionRegistry::new();
    let (session_id, h) = registered(&registry).await;
    h.bridge.report_permissions(common::grant_all());

    let mut controller = registry.take_pending(&session_id, "student-1").await.unwrap();
    controller.start().await.unwrap();
    registry.launch(controller).await;

    let handle = registry.handle(&session_id, "student-1").await.unwrap();
    assert_eq!(handle.snapshot().state, SessionState::Active);
    handle.submit().await.unwrap();

    let closed = handle.wait_closed().await;
    assert_eq!(closed.state, SessionState::Closed);

    for _ in 0..50 {
        if registry.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_empty().await);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_start_can_be_retried() {
    let registry = SessionRegistry::new();
    let (session_id, h) = registered(&registry).await;

    let waiting = {
        let registry = registry.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { registry.start(&session_id, "student-1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    waiting.abort();
    assert!(waiting.await.is_err());

    // The permission prompt times out on its own and the controller goes back.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        registry.open_session_for("student-1", &common::exam(3).id).await,
        Some(session_id.clone())
    );

    h.bridge.report_permissions(common::grant_all());
    let snapshot = registry.start(&session_id, "student-1").await.unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_start_completes_after_caller_leaves() {
    let registry = SessionRegistry::new();
    let (session_id, h) = registered(&registry).await;

    let waiting = {
        let registry = registry.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { registry.start(&session_id, "student-1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    waiting.abort();
    let _ = waiting.await;

    h.bridge.report_permissions(common::grant_all());
    let handle = registry.handle(&session_id, "student-1").await.unwrap();
    let active = tokio::time::timeout(
        Duration::from_secs(1),
        handle.wait_for(|s| s.state == SessionState::Active),
    )
    .await
    .unwrap();
    assert_eq!(active.state, SessionState::Active);
    assert_eq!(
        registry.start(&session_id, "student-1").await.err().map(|e| e.to_string()),
        Some(RegistryError::AlreadyStarted.to_string())
    );
}

#[tokio::test]
async fn test_sweep_drops_only_expired_pending_sessions() {
    let registry = SessionRegistry::new();
    let (expired, _old) = registered_until(&registry, Utc::now() - chrono::Duration::minutes(1)).await;
    let (current, _new) = registered(&registry).await;

    assert_eq!(registry.sweep_abandoned(Utc::now()).await, 1);
    assert_eq!(
        registry.handle(&expired, "student-1").await.err(),
        Some(RegistryError::NotFound)
    );
    assert!(registry.handle(&current, "student-1").await.is_ok());
    assert_eq!(registry.sweep_abandoned(Utc::now()).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_keeps_started_sessions() {
    let registry = SessionRegistry::new();
    let (session_id, h) =
        registered_until(&registry, Utc::now() - chrono::Duration::minutes(1)).await;
    h.bridge.report_permissions(common::grant_all());
    registry.start(&session_id, "student-1").await.unwrap();

    assert_eq!(registry.sweep_abandoned(Utc::now()).await, 0);
    assert!(registry.handle(&session_id, "student-1").await.is_ok());
}
