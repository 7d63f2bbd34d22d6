use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

use attempt_service::AttemptService;
use exam_service::ExamService;
use session_registry::SessionRegistry;
use submission_gateway::{HttpSubmissionGateway, LocalSubmissionGateway, SubmissionGateway};

pub mod attempt_service;
pub mod browser_bridge;
pub mod capabilities;
pub mod detectors;
pub mod exam_service;
pub mod session_clock;
pub mod session_controller;
pub mod session_registry;
pub mod submission_gateway;
pub mod violation_aggregator;

const ABANDONED_SWEEP_PERIOD: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: Config,
    pub mongo: Database,
    pub redis: ConnectionManager,
    pub sessions: SessionRegistry,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let http_client = reqwest::Client::builder()
            .timeout(config.submission.attempt_timeout())
            .build()?;

        let sessions = SessionRegistry::new();
        sessions.spawn_sweeper(ABANDONED_SWEEP_PERIOD);

        Ok(Self {
            config,
            mongo,
            redis,
            sessions,
            http_client,
        })
    }

    pub fn exam_service(&self) -> ExamService {
        ExamService::new(self.mongo.clone())
    }

    pub fn attempt_service(&self) -> AttemptService {
        AttemptService::new(self.mongo.clone(), self.redis.clone())
    }

    /// Gateway used by a session of `org_id`. Remote when a gateway URL and
    /// service token are configured, otherwise in-process.
    pub fn submission_gateway(&self, org_id: &str) -> Arc<dyn SubmissionGateway> {
        let submission = &self.config.submission;
        match (&submission.gateway_url, &submission.service_token) {
            (Some(url), Some(token)) => Arc::new(HttpSubmissionGateway::new(
                self.http_client.clone(),
                url.clone(),
                token.clone(),
                org_id,
            )),
            _ => Arc::new(LocalSubmissionGateway::new(
                self.exam_service(),
                self.attempt_service(),
                org_id.to_string(),
            )),
        }
    }
}
