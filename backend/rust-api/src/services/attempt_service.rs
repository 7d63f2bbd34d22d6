use anyhow::{Context, Result};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::metrics::ATTEMPTS_RECORDED_TOTAL;
use crate::models::attempt::{AttemptRecord, AttemptSubmission, SubmissionReceipt};
use crate::models::{ExamDefinition, Question};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

const ATTEMPTS_COLLECTION: &str = "attempts";
const RECEIPT_TTL_SECS: u64 = 86400;
const CLAIM_TTL_SECS: u64 = 60;

/// Returns the current holder of the claim, or takes it and returns nil.
const CLAIM_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder then
    return holder
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return false
"#;

/// One point per question whose selected option equals the correct one.
/// Unanswered questions and questions without a correct option never score.
pub fn score_answers(questions: &[Question], answers: &[Option<usize>]) -> u32 {
    questions
        .iter()
        .zip(answers.iter())
        .filter(|(question, answer)| {
            matches!((question.correct_option, answer), (Some(correct), Some(given)) if correct == *given)
        })
        .count() as u32
}

pub struct AttemptService {
    mongo: Database,
    redis: ConnectionManager,
}

impl AttemptService {
    pub fn new(mongo: Database, redis: ConnectionManager) -> Self {
        Self { mongo, redis }
    }

    fn collection(&self) -> Collection<AttemptRecord> {
        self.mongo.collection(ATTEMPTS_COLLECTION)
    }

    /// Scores and stores the attempt. Repeated calls for the same exam and
    /// student return the receipt of the first stored attempt.
    pub async fn record_attempt(
        &self,
        exam: &ExamDefinition,
        submission: &AttemptSubmission,
    ) -> Result<SubmissionReceipt> {
        let student_id = submission.student_id.as_str();
        tracing::info!(
            "Recording attempt: exam_id={}, student_id={}, reason={}, violations={}",
            exam.id,
            student_id,
            submission.termination_reason,
            submission.violation_log.len()
        );

        let retry_cfg = RetryConfig::default();

        if let Some(receipt) = retry_async_with_config(retry_cfg.clone(), || async {
            self.cached_receipt(&exam.id, student_id).await
        })
        .await?
        {
            tracing::info!(
                "Returning cached receipt: exam_id={}, student_id={}",
                exam.id,
                student_id
            );
            return Ok(receipt);
        }

        if let Some(existing) = self.find_attempt(&exam.id, student_id).await? {
            tracing::info!(
                "Attempt already stored: attempt_id={}, exam_id={}, student_id={}",
                existing.id,
                exam.id,
                student_id
            );
            let receipt = existing.receipt();
            self.cache_receipt(&exam.id, student_id, &receipt).await?;
            return Ok(receipt);
        }

        let claim_token = Uuid::new_v4().to_string();
        if let Some(holder) = self.claim(&exam.id, student_id, &claim_token).await? {
            anyhow::bail!(
                "Attempt for exam {} is already being recorded (claim {})",
                exam.id,
                holder
            );
        }

        let record = AttemptRecord {
            id: Uuid::new_v4().to_string(),
            exam_id: exam.id.clone(),
            org_id: exam.org_id.clone(),
            student_id: student_id.to_string(),
            answers: submission.answers.clone(),
            score: score_answers(&exam.questions, &submission.answers),
            started_at: submission.started_at,
            submitted_at: Utc::now(),
            is_auto_submitted: submission.is_auto_submitted(),
            termination_reason: submission.termination_reason,
            violation_log: submission.violation_log.clone(),
        };

        let collection = self.collection();
        let inserted: Result<_, mongodb::error::Error> =
            retry_async_with_config(RetryConfig::aggressive(), || async {
                collection.insert_one(&record).await.map(|_| ())
            })
            .await;
        if let Err(e) = inserted {
            self.release_claim(&exam.id, student_id).await;
            return Err(anyhow::anyhow!(e).context("Failed to insert attempt"));
        }

        ATTEMPTS_RECORDED_TOTAL
            .with_label_values(&[submission.termination_reason.as_str()])
            .inc();

        let receipt = record.receipt();
        if let Err(e) = self.cache_receipt(&exam.id, student_id, &receipt).await {
            tracing::warn!("Failed to cache attempt receipt: {:#}", e);
        }
        self.release_claim(&exam.id, student_id).await;

        tracing::info!(
            "Attempt saved: attempt_id={}, exam_id={}, student_id={}, score={}/{}",
            record.id,
            exam.id,
            student_id,
            record.score,
            exam.questions.len()
        );
        Ok(receipt)
    }

    pub async fn find_attempt(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<AttemptRecord>> {
        self.collection()
            .find_one(doc! { "exam_id": exam_id, "student_id": student_id })
            .await
            .context("Failed to query attempts collection")
    }

    pub async fn has_attempt(&self, exam_id: &str, student_id: &str) -> Result<bool> {
        Ok(self.find_attempt(exam_id, student_id).await?.is_some())
    }

    /// Attempts of one student, newest submission first.
    pub async fn list_attempts(&self, student_id: &str) -> Result<Vec<AttemptRecord>> {
        let cursor = self
            .collection()
            .find(doc! { "student_id": student_id })
            .await
            .context("Failed to query attempts collection")?;
        let mut attempts: Vec<AttemptRecord> = cursor
            .try_collect()
            .await
            .context("Failed to read attempts")?;

        attempts.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(attempts)
    }

    fn receipt_key(exam_id: &str, student_id: &str) -> String {
        format!("attempt:receipt:{}:{}", exam_id, student_id)
    }

    fn claim_key(exam_id: &str, student_id: &str) -> String {
        format!("attempt:claim:{}:{}", exam_id, student_id)
    }

    async fn cached_receipt(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<SubmissionReceipt>> {
        let mut conn = self.redis.clone();
        let cached: Option<String> = redis::cmd("GET")
            .arg(Self::receipt_key(exam_id, student_id))
            .query_async(&mut conn)
            .await
            .context("Failed to read receipt cache")?;

        cached
            .map(|json| serde_json::from_str(&json).context("Failed to deserialize cached receipt"))
            .transpose()
    }

    async fn cache_receipt(
        &self,
        exam_id: &str,
        student_id: &str,
        receipt: &SubmissionReceipt,
    ) -> Result<()> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(receipt).context("Failed to serialize receipt")?;

        redis::cmd("SETEX")
            .arg(Self::receipt_key(exam_id, student_id))
            .arg(RECEIPT_TTL_SECS)
            .arg(&json)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to cache receipt")?;
        Ok(())
    }

    /// `None` when the claim was taken, otherwise the token of the current holder.
    async fn claim(&self, exam_id: &str, student_id: &str, token: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        redis::Script::new(CLAIM_SCRIPT)
            .key(Self::claim_key(exam_id, student_id))
            .arg(token)
            .arg(CLAIM_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .context("Failed to claim attempt slot")
    }

    async fn release_claim(&self, exam_id: &str, student_id: &str) {
        let mut conn = self.redis.clone();
        let released: redis::RedisResult<()> = redis::cmd("DEL")
            .arg(Self::claim_key(exam_id, student_id))
            .query_async(&mut conn)
            .await;
        if let Err(e) = released {
            tracing::warn!("Failed to release attempt claim: {}", e);
        }
    }
}
