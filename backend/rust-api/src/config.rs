use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::utils::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub proctoring: ProctoringSettings,
    pub submission: SubmissionSettings,
}

/// Tunables of the integrity monitor. Every field has a default so a partial
/// `[proctoring]` table is enough.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProctoringSettings {
    pub violation_threshold: u32,
    pub dedup_cooldown_ms: u64,
    pub warning_cooldown_ms: u64,
    pub clock_tick_ms: u64,
    pub focus_poll_ms: u64,
    pub fullscreen_poll_ms: u64,
    pub face_sample_ms: u64,
    pub audio_sample_ms: u64,
    pub eye_openness_threshold: f64,
    pub head_turn_threshold_px: f64,
    pub noise_volume_threshold: f64,
    pub noise_consecutive_samples: u32,
    pub noise_cooldown_ms: u64,
    pub permission_timeout_ms: u64,
    pub sensor_stale_ms: u64,
}

impl Default for ProctoringSettings {
    fn default() -> Self {
        Self {
            violation_threshold: 3,
            dedup_cooldown_ms: 2_000,
            warning_cooldown_ms: 3_000,
            clock_tick_ms: 1_000,
            focus_poll_ms: 250,
            fullscreen_poll_ms: 250,
            face_sample_ms: 2_000,
            audio_sample_ms: 100,
            eye_openness_threshold: 0.15,
            head_turn_threshold_px: 60.0,
            noise_volume_threshold: 90.0,
            noise_consecutive_samples: 3,
            noise_cooldown_ms: 10_000,
            permission_timeout_ms: 30_000,
            sensor_stale_ms: 6_000,
        }
    }
}

impl ProctoringSettings {
    pub fn dedup_cooldown(&self) -> Duration {
        Duration::from_millis(self.dedup_cooldown_ms)
    }

    pub fn warning_cooldown(&self) -> Duration {
        Duration::from_millis(self.warning_cooldown_ms)
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_millis(self.clock_tick_ms.max(1))
    }

    pub fn focus_poll(&self) -> Duration {
        Duration::from_millis(self.focus_poll_ms.max(1))
    }

    pub fn fullscreen_poll(&self) -> Duration {
        Duration::from_millis(self.fullscreen_poll_ms.max(1))
    }

    pub fn face_sample(&self) -> Duration {
        Duration::from_millis(self.face_sample_ms.max(1))
    }

    pub fn audio_sample(&self) -> Duration {
        Duration::from_millis(self.audio_sample_ms.max(1))
    }

    pub fn noise_cooldown(&self) -> Duration {
        Duration::from_millis(self.noise_cooldown_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    pub fn sensor_stale_after(&self) -> Duration {
        Duration::from_millis(self.sensor_stale_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubmissionSettings {
    pub max_attempts: usize,
    pub attempt_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Remote attempts endpoint; the in-process gateway is used when unset.
    pub gateway_url: Option<String>,
    /// Shared secret between gateways and the attempts endpoint. The endpoint
    /// refuses every request while this is unset.
    pub service_token: Option<String>,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 10_000,
            base_backoff_ms: 500,
            max_backoff_ms: 4_000,
            gateway_url: None,
            service_token: None,
        }
    }
}

impl SubmissionSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
            jitter_max: Some(Duration::from_millis(self.base_backoff_ms / 4)),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__* overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/examguard".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "examguard".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let proctoring = optional_section::<ProctoringSettings>(&settings, "proctoring")?;
        let mut submission = optional_section::<SubmissionSettings>(&settings, "submission")?;
        if submission.gateway_url.is_none() {
            submission.gateway_url = env::var("SUBMISSION_GATEWAY_URL").ok();
        }
        if submission.service_token.is_none() {
            submission.service_token = env::var("SUBMISSION_SERVICE_TOKEN").ok();
        }
        if submission.gateway_url.is_some() && submission.service_token.is_none() {
            return Err(config::ConfigError::Message(
                "SUBMISSION_SERVICE_TOKEN must be set when a submission gateway URL is configured"
                    .to_string(),
            ));
        }

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            proctoring,
            submission,
        })
    }
}

fn optional_section<T>(settings: &config::Config, key: &str) -> Result<T, config::ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match settings.get::<T>(key) {
        Ok(section) => Ok(section),
        Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}
