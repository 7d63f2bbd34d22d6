//! In-memory index of live proctored sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::ProctorError;
use crate::metrics::PROCTORED_SESSIONS_TOTAL;
use crate::models::{ExamPaper, SessionSnapshot, SessionState};
use crate::services::browser_bridge::BrowserBridge;
use crate::services::session_controller::{SessionController, SessionHandle};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session not found")]
    NotFound,
    #[error("Session belongs to another student")]
    NotOwner,
    #[error("Session already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Proctor(#[from] ProctorError),
}

enum Phase {
    Pending(Box<SessionController>),
    /// Controller taken out while permissions are awaited.
    Starting,
    Running,
}

struct SessionEntry {
    student_id: String,
    exam_id: String,
    paper: ExamPaper,
    bridge: Arc<BrowserBridge>,
    handle: SessionHandle,
    /// End of the exam window; a session still pending then is abandoned.
    closes_at: DateTime<Utc>,
    phase: Phase,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a pending controller and returns its session id.
    pub async fn insert(
        &self,
        controller: SessionController,
        paper: ExamPaper,
        bridge: Arc<BrowserBridge>,
        closes_at: DateTime<Utc>,
    ) -> String {
        let session_id = controller.session_id().to_string();
        let entry = SessionEntry {
            student_id: controller.session().student_id.clone(),
            exam_id: controller.session().exam_id.clone(),
            paper,
            bridge,
            handle: controller.handle(),
            closes_at,
            phase: Phase::Pending(Box::new(controller)),
        };
        self.inner.write().await.insert(session_id.clone(), entry);
        session_id
    }

    /// Id of a session the student still has open for this exam.
    pub async fn open_session_for(&self, student_id: &str, exam_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .iter()
            .find(|(_, entry)| {
                entry.student_id == student_id
                    && entry.exam_id == exam_id
                    && entry.handle.snapshot().state != SessionState::Closed
            })
            .map(|(id, _)| id.clone())
    }

    /// Starts a pending session.
    ///
    /// The permission wait runs on its own task, which either launches the
    /// controller or puts it back. A caller that stops waiting (a dropped HTTP
    /// request) therefore never strands the session in `Starting`.
    pub async fn start(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<SessionSnapshot, StartError> {
        let mut controller = self.take_pending(session_id, student_id).await?;

        let registry = self.clone();
        let task = tokio::spawn(async move {
            match controller.start().await {
                Ok(()) => {
                    let snapshot = controller.snapshot();
                    registry.launch(controller).await;
                    Ok(snapshot)
                }
                Err(e) => {
                    registry.restore(controller).await;
                    Err(e)
                }
            }
        });

        match task.await {
            Ok(result) => result.map_err(StartError::from),
            Err(e) => {
                tracing::error!("Session start task failed: session_id={}, error={}", session_id, e);
                self.remove(session_id).await;
                Err(ProctorError::SessionGone.into())
            }
        }
    }

    /// Takes the pending controller out so it can be started without holding
    /// the registry lock. Pair with [`restore`](Self::restore) or
    /// [`launch`](Self::launch).
    pub async fn take_pending(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Box<SessionController>, RegistryError> {
        let mut sessions = self.inner.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or(RegistryError::NotFound)?;
        if entry.student_id != student_id {
            return Err(RegistryError::NotOwner);
        }

        match std::mem::replace(&mut entry.phase, Phase::Starting) {
            Phase::Pending(controller) => Ok(controller),
            other => {
                entry.phase = other;
                Err(RegistryError::AlreadyStarted)
            }
        }
    }

    /// Puts back a controller whose start failed.
    pub async fn restore(&self, controller: Box<SessionController>) {
        let session_id = controller.session_id().to_string();
        if let Some(entry) = self.inner.write().await.get_mut(&session_id) {
            entry.phase = Phase::Pending(controller);
        }
    }

    /// Runs a started controller to completion and drops the entry afterwards.
    pub async fn launch(&self, controller: Box<SessionController>) {
        let session_id = controller.session_id().to_string();
        if let Some(entry) = self.inner.write().await.get_mut(&session_id) {
            entry.phase = Phase::Running;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let last = (*controller).run().await;
            tracing::info!(
                "Session finished: session_id={}, state={}, score={:?}",
                last.session_id,
                last.state,
                last.score
            );
            registry.remove(&last.session_id).await;
        });
    }

    pub async fn handle(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<SessionHandle, RegistryError> {
        let sessions = self.inner.read().await;
        let entry = owned_entry(&sessions, session_id, student_id)?;
        Ok(entry.handle.clone())
    }

    pub async fn bridge(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Arc<BrowserBridge>, RegistryError> {
        let sessions = self.inner.read().await;
        let entry = owned_entry(&sessions, session_id, student_id)?;
        Ok(entry.bridge.clone())
    }

    pub async fn paper(&self, session_id: &str, student_id: &str) -> Result<ExamPaper, RegistryError> {
        let sessions = self.inner.read().await;
        let entry = owned_entry(&sessions, session_id, student_id)?;
        Ok(entry.paper.clone())
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.inner.write().await.remove(session_id).is_some()
    }

    /// Drops sessions that were never started and whose exam window has
    /// closed. Returns how many were dropped.
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.inner.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            !(matches!(entry.phase, Phase::Pending(_)) && entry.closes_at <= now)
        });
        let swept = before - sessions.len();

        if swept > 0 {
            PROCTORED_SESSIONS_TOTAL
                .with_label_values(&["abandoned"])
                .inc_by(swept as u64);
            tracing::info!("Swept {} abandoned session(s)", swept);
        }
        swept
    }

    /// Runs [`sweep_abandoned`](Self::sweep_abandoned) every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep_abandoned(Utc::now()).await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

fn owned_entry<'a>(
    sessions: &'a HashMap<String, SessionEntry>,
    session_id: &str,
    student_id: &str,
) -> Result<&'a SessionEntry, RegistryError> {
    let entry = sessions.get(session_id).ok_or(RegistryError::NotFound)?;
    if entry.student_id != student_id {
        return Err(RegistryError::NotOwner);
    }
    Ok(entry)
}
