use anyhow::{Context, Result};
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::{Collection, Database};

use crate::models::{ExamDefinition, ExamDocument};

const EXAMS_COLLECTION: &str = "exams";

/// Read access to authored exams. Authoring itself happens elsewhere.
#[derive(Clone)]
pub struct ExamService {
    mongo: Database,
}

impl ExamService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    /// Loads the full exam, correct options included. `None` when the id is
    /// malformed, unknown or owned by another organization.
    pub async fn get_exam(&self, exam_id: &str, org_id: &str) -> Result<Option<ExamDefinition>> {
        let Ok(oid) = ObjectId::parse_str(exam_id) else {
            tracing::debug!("Rejecting malformed exam id: {}", exam_id);
            return Ok(None);
        };

        let collection: Collection<ExamDocument> = self.mongo.collection(EXAMS_COLLECTION);
        let exam = collection
            .find_one(doc! { "_id": oid, "org_id": org_id })
            .await
            .with_context(|| format!("Failed to load exam {}", exam_id))?;

        Ok(exam.map(ExamDefinition::from))
    }
}
