//! Iteration versioning, promotion and rollback.
//!
//! [`IterationManager`] is the only writer of iteration status. Every
//! status-changing operation runs under one async lock, and promotion is a
//! single storage transaction, so there is never a moment with zero or two
//! Active iterations.

use chrono::{DateTime, Utc};
use promptloop_db::{Database, IterationRecord, IterationStatus, Promotion, ValidationRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{IterationError, ValidationResult};

/// SHA-256 of a prompt, hex encoded
pub fn prompt_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A versioned prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotIteration {
    /// Version number; strictly increasing with creation order
    pub id: i64,
    pub prompt_text: String,
    pub prompt_hash: String,
    pub parent_id: Option<i64>,
    pub status: IterationStatus,
    pub status_reason: Option<String>,
    pub aggregate_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub validation: Option<ValidationResult>,
}

impl BotIteration {
    fn from_record(
        record: IterationRecord,
        validation: Option<ValidationRecord>,
    ) -> Result<Self, serde_json::Error> {
        let validation = validation
            .map(|v| serde_json::from_str(&v.result))
            .transpose()?;

        Ok(Self {
            id: record.id,
            prompt_text: record.prompt_text,
            prompt_hash: record.prompt_hash,
            parent_id: record.parent_id,
            status: record.status,
            status_reason: record.status_reason,
            aggregate_score: record.aggregate_score,
            created_at: record.created_at,
            validation,
        })
    }
}

/// Result of comparing a validated candidate against the Active iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub candidate_id: i64,
    pub promoted: bool,
    pub candidate_score: f64,
    /// The iteration that was Active when the decision was made
    pub active_id: i64,
    pub active_score: f64,
    pub delta: f64,
}

pub struct IterationManager {
    db: Arc<Database>,
    tolerance: f64,
    lock: Mutex<()>,
}

impl IterationManager {
    pub fn new(db: Arc<Database>, tolerance: f64) -> Self {
        Self {
            db,
            tolerance: tolerance.max(0.0),
            lock: Mutex::new(()),
        }
    }

    /// Create the operator-authored baseline directly as Active.
    pub async fn seed(&self, prompt: &str) -> Result<BotIteration, IterationError> {
        let _guard = self.lock.lock().await;

        let id = self
            .db
            .iterations()
            .insert_seed(prompt, &prompt_hash(prompt), Utc::now())?
            .ok_or(IterationError::AlreadySeeded)?;

        info!(iteration_id = id, "Seeded baseline iteration");
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<BotIteration, IterationError> {
        let record = self
            .db
            .iterations()
            .get(id)?
            .ok_or(IterationError::NotFound(id))?;
        let validation = self.db.validations().get(id)?;
        Ok(BotIteration::from_record(record, validation)?)
    }

    /// The single Active iteration.
    ///
    /// Any other number of Active rows is reported, never repaired.
    pub fn active(&self) -> Result<BotIteration, IterationError> {
        let mut active = self.db.iterations().active()?;
        match active.len() {
            0 if self.db.iterations().count()? == 0 => Err(IterationError::NoActiveIteration),
            1 => {
                let record = active.remove(0);
                let validation = self.db.validations().get(record.id)?;
                Ok(BotIteration::from_record(record, validation)?)
            }
            n => {
                let detail = format!("{} iterations are Active", n);
                error!(active_count = n, "{}", detail);
                Err(IterationError::InvariantViolation(detail))
            }
        }
    }

    /// Confirm exactly one Active iteration and return its id.
    pub fn check_invariant(&self) -> Result<i64, IterationError> {
        self.active().map(|a| a.id)
    }

    /// Wrap an improver proposal as a new Candidate.
    pub fn create_candidate(
        &self,
        prompt: &str,
        parent_id: i64,
    ) -> Result<BotIteration, IterationError> {
        let id = self.db.iterations().insert(
            prompt,
            &prompt_hash(prompt),
            Some(parent_id),
            IterationStatus::Candidate,
            Utc::now(),
        )?;
        self.get(id)
    }

    /// Attach a validation result and move the Candidate to Validated, or
    /// straight to RolledBack when a check failed.
    pub async fn record_validation(
        &self,
        id: i64,
        result: &ValidationResult,
    ) -> Result<IterationStatus, IterationError> {
        let _guard = self.lock.lock().await;

        let (to, reason) = if result.passed {
            (IterationStatus::Validated, None)
        } else {
            (
                IterationStatus::RolledBack,
                Some(format!(
                    "validation failed: {}",
                    result.violated_checks().join(", ")
                )),
            )
        };

        let record = ValidationRecord {
            iteration_id: id,
            passed: result.passed,
            result: serde_json::to_string(result)?,
            created_at: Utc::now(),
        };
        let applied = self.db.iterations().record_validation(
            IterationStatus::Candidate,
            to,
            reason.as_deref(),
            &record,
        )?;
        if !applied {
            return Err(self.invalid_transition(id, to));
        }

        if !result.passed {
            warn!(iteration_id = id, reason = ?reason, "Candidate rolled back");
        }
        Ok(to)
    }

    /// Record the evaluated score of an iteration (used for the baseline).
    ///
    /// The first score wins. When the iteration was already scored, the
    /// stored score is returned and `score` is discarded.
    pub async fn set_score(&self, id: i64, score: f64) -> Result<Option<f64>, IterationError> {
        let _guard = self.lock.lock().await;
        if self.db.iterations().set_score_if_unscored(id, score)? {
            return Ok(None);
        }

        let stored = self
            .db
            .iterations()
            .get(id)?
            .ok_or(IterationError::NotFound(id))?;
        stored
            .aggregate_score
            .map(Some)
            .ok_or(IterationError::NotFound(id))
    }

    /// Promote a Validated candidate if it is no worse than the Active
    /// iteration (minus the tolerance), otherwise roll it back.
    ///
    /// The Active score is read inside the lock, so a candidate racing
    /// another promotion is compared against the newest Active iteration.
    pub async fn decide_promotion(
        &self,
        candidate_id: i64,
        candidate_score: f64,
    ) -> Result<PromotionDecision, IterationError> {
        let _guard = self.lock.lock().await;

        let candidate = self
            .db
            .iterations()
            .get(candidate_id)?
            .ok_or(IterationError::NotFound(candidate_id))?;
        if candidate.status != IterationStatus::Validated {
            return Err(IterationError::InvalidTransition {
                id: candidate_id,
                from: candidate.status,
                to: IterationStatus::Active,
            });
        }

        let active = self.active()?;
        let active_score = active
            .aggregate_score
            .ok_or(IterationError::Unscored(active.id))?;
        let delta = candidate_score - active_score;

        self.db.iterations().set_score(candidate_id, candidate_score)?;

        let promoted = candidate_score >= active_score - self.tolerance;
        if promoted {
            let promotion = self.db.iterations().promote(candidate_id)?;
            match promotion {
                Promotion::Promoted { superseded_id } => {
                    info!(
                        candidate_id,
                        superseded_id,
                        delta = format!("{:+.2}", delta),
                        "Candidate promoted"
                    );
                }
                Promotion::NotValidated => {
                    return Err(IterationError::InvalidTransition {
                        id: candidate_id,
                        from: candidate.status,
                        to: IterationStatus::Active,
                    });
                }
                Promotion::ActiveCount(n) => {
                    let detail = format!("{} iterations were Active during promotion", n);
                    error!(active_count = n, candidate_id, "{}", detail);
                    return Err(IterationError::InvariantViolation(detail));
                }
            }
        } else {
            let reason = format!(
                "regression: {:.2} vs active {:.2} ({:+.2})",
                candidate_score, active_score, delta
            );
            self.transition(
                candidate_id,
                IterationStatus::Validated,
                IterationStatus::RolledBack,
                Some(&reason),
            )?;
            warn!(candidate_id, reason = %reason, "Candidate rolled back");
        }

        Ok(PromotionDecision {
            candidate_id,
            promoted,
            candidate_score,
            active_id: active.id,
            active_score,
            delta,
        })
    }

    /// Every iteration, oldest first.
    pub fn history(&self) -> Result<Vec<BotIteration>, IterationError> {
        let records = self.db.iterations().list()?;
        let mut iterations = Vec::with_capacity(records.len());
        for record in records {
            let validation = self.db.validations().get(record.id)?;
            iterations.push(BotIteration::from_record(record, validation)?);
        }
        Ok(iterations)
    }

    fn transition(
        &self,
        id: i64,
        from: IterationStatus,
        to: IterationStatus,
        reason: Option<&str>,
    ) -> Result<(), IterationError> {
        if self.db.iterations().transition(id, from, to, reason)? {
            return Ok(());
        }
        Err(self.invalid_transition(id, to))
    }

    fn invalid_transition(&self, id: i64, to: IterationStatus) -> IterationError {
        match self.db.iterations().get(id) {
            Ok(Some(current)) => IterationError::InvalidTransition {
                id,
                from: current.status,
                to,
            },
            Ok(None) => IterationError::NotFound(id),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PromptValidator, ValidatorConfig, DEFAULT_BASELINE_PROMPT};

    fn manager() -> IterationManager {
        IterationManager::new(Arc::new(Database::open_in_memory().unwrap()), 0.0)
    }

    fn passing() -> ValidationResult {
        ValidationResult {
            passed: true,
            violations: vec![],
            warnings: vec![],
            changes: vec![],
        }
    }

    async fn validated(manager: &IterationManager, parent: i64, text: &str) -> i64 {
        let candidate = manager.create_candidate(text, parent).unwrap();
        manager
            .record_validation(candidate.id, &passing())
            .await
            .unwrap();
        candidate.id
    }

    #[test]
    fn test_prompt_hash() {
        assert_eq!(prompt_hash("abc").len(), 64);
        assert_eq!(prompt_hash("abc"), prompt_hash("abc"));
        assert_ne!(prompt_hash("abc"), prompt_hash("abd"));
    }

    #[tokio::test]
    async fn test_seed_once() {
        let manager = manager();
        assert!(matches!(
            manager.active(),
            Err(IterationError::NoActiveIteration)
        ));

        let seed = manager.seed("baseline").await.unwrap();
        assert_eq!(seed.status, IterationStatus::Active);
        assert_eq!(seed.parent_id, None);
        assert!(matches!(
            manager.seed("again").await,
            Err(IterationError::AlreadySeeded)
        ));
        assert_eq!(manager.check_invariant().unwrap(), seed.id);
    }

    #[tokio::test]
    async fn test_promotion_supersedes_active() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();
        manager.set_score(seed.id, 7.2).await.unwrap();

        let candidate = validated(&manager, seed.id, "better").await;
        let decision = manager.decide_promotion(candidate, 7.5).await.unwrap();

        assert!(decision.promoted);
        assert_eq!(decision.active_id, seed.id);
        assert!((decision.delta - 0.3).abs() < 1e-9);
        assert_eq!(manager.active().unwrap().id, candidate);
        assert_eq!(
            manager.get(seed.id).unwrap().status,
            IterationStatus::Superseded
        );
    }

    #[tokio::test]
    async fn test_later_candidate_compared_against_new_active() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();
        manager.set_score(seed.id, 7.2).await.unwrap();

        // Both candidates were proposed and validated against the seed
        let x = validated(&manager, seed.id, "candidate x").await;
        let y = validated(&manager, seed.id, "candidate y").await;

        assert!(manager.decide_promotion(x, 7.5).await.unwrap().promoted);

        // 7.4 beats the seed's 7.2 but not the 7.5 that is now Active
        let decision = manager.decide_promotion(y, 7.4).await.unwrap();
        assert!(!decision.promoted);
        assert_eq!(decision.active_id, x);
        assert!((decision.active_score - 7.5).abs() < 1e-9);
        assert!((decision.delta + 0.1).abs() < 1e-9);

        assert_eq!(manager.get(y).unwrap().status, IterationStatus::RolledBack);
        assert_eq!(manager.active().unwrap().id, x);
        assert_eq!(
            manager.get(seed.id).unwrap().status,
            IterationStatus::Superseded
        );
    }

    #[tokio::test]
    async fn test_first_baseline_score_wins() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();

        assert_eq!(manager.set_score(seed.id, 7.0).await.unwrap(), None);
        assert_eq!(manager.set_score(seed.id, 9.0).await.unwrap(), Some(7.0));
        assert_eq!(manager.active().unwrap().aggregate_score, Some(7.0));

        assert!(matches!(
            manager.set_score(42, 7.0).await,
            Err(IterationError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_regression_rolls_back() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();
        manager.set_score(seed.id, 7.2).await.unwrap();

        let candidate = validated(&manager, seed.id, "worse").await;
        let decision = manager.decide_promotion(candidate, 6.0).await.unwrap();

        assert!(!decision.promoted);
        let stored = manager.get(candidate).unwrap();
        assert_eq!(stored.status, IterationStatus::RolledBack);
        assert_eq!(stored.aggregate_score, Some(6.0));
        assert!(stored.status_reason.unwrap().starts_with("regression"));
        assert_eq!(manager.active().unwrap().id, seed.id);
    }

    #[tokio::test]
    async fn test_tolerance_allows_small_drop() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let manager = IterationManager::new(db, 0.5);
        let seed = manager.seed("baseline").await.unwrap();
        manager.set_score(seed.id, 7.2).await.unwrap();

        let candidate = validated(&manager, seed.id, "about the same").await;
        assert!(manager.decide_promotion(candidate, 6.8).await.unwrap().promoted);
    }

    #[tokio::test]
    async fn test_failed_validation_rolls_back_immediately() {
        let manager = manager();
        let seed = manager.seed(DEFAULT_BASELINE_PROMPT).await.unwrap();

        let candidate = manager.create_candidate("too short.", seed.id).unwrap();
        let result = PromptValidator::new(ValidatorConfig::default())
            .validate("too short.", DEFAULT_BASELINE_PROMPT);
        let status = manager
            .record_validation(candidate.id, &result)
            .await
            .unwrap();
        assert_eq!(status, IterationStatus::RolledBack);

        let stored = manager.get(candidate.id).unwrap();
        assert!(!stored.validation.unwrap().passed);

        // Validation is recorded once; a second attempt changes nothing
        let again = manager.record_validation(candidate.id, &passing()).await;
        assert!(matches!(again, Err(IterationError::InvalidTransition { .. })));
        assert!(!manager.get(candidate.id).unwrap().validation.unwrap().passed);

        // A rolled back candidate can never be promoted
        let err = manager.decide_promotion(candidate.id, 9.9).await.unwrap_err();
        assert!(matches!(err, IterationError::InvalidTransition { .. }));
        assert_eq!(manager.active().unwrap().id, seed.id);
    }

    #[tokio::test]
    async fn test_unscored_active_is_an_error() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();
        let candidate = validated(&manager, seed.id, "candidate").await;

        let err = manager.decide_promotion(candidate, 8.0).await.unwrap_err();
        assert!(matches!(err, IterationError::Unscored(id) if id == seed.id));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let manager = manager();
        let seed = manager.seed("baseline").await.unwrap();
        let a = manager.create_candidate("a", seed.id).unwrap();
        let b = manager.create_candidate("b", seed.id).unwrap();
        assert!(seed.id < a.id && a.id < b.id);

        let ids: Vec<i64> = manager.history().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![seed.id, a.id, b.id]);
    }
}
