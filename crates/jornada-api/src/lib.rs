use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jornada_core::{
    score_quiz, ActivityClaim, AnswerKey, AwardSummary, AwardedBadge, BadgeDefinition,
    CreditedActivity, Level, Profile, ProgressionError, ProgressionRules, QuizAnswers, QuizScore,
    ReadingStreak, UserId,
};
use jornada_store_sqlite::{LeaderboardEntry, PointAdjustment, SchemaStatus, SqliteStore, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_MAX_SUBMIT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage",
        }
    }

    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

impl From<ProgressionError> for ApiError {
    fn from(value: ProgressionError) -> Self {
        Self::Invalid(value.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Invalid(err) => err.into(),
            conflict @ StoreError::Conflict { .. } => Self::Conflict(conflict.to_string()),
            StoreError::Storage(err) => Self::Storage(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NextLevel {
    pub level: Level,
    pub title: String,
    pub threshold: u64,
    pub points_needed: u64,
}

/// Read model of a profile. Users without a stored profile see the zero state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileView {
    pub user_id: UserId,
    pub points: u64,
    pub level: Level,
    pub level_title: String,
    pub next_level: Option<NextLevel>,
    pub badges: Vec<AwardedBadge>,
    pub credited_count: usize,
    pub streak: ReadingStreak,
    /// Streak length as of the read; zero once a day was missed.
    pub active_streak_days: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity_at: Option<OffsetDateTime>,
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjustPointsRequest {
    pub delta: i64,
    pub writer: String,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterQuizRequest {
    pub quiz_ref: String,
    pub answer_key: AnswerKey,
    pub writer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterQuizResult {
    pub quiz_ref: String,
    pub total_questions: usize,
}

/// Scoring without crediting. A registered key for `quiz_ref` wins over the
/// inline `answer_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreQuizRequest {
    pub answers: QuizAnswers,
    #[serde(default)]
    pub answer_key: Option<AnswerKey>,
    #[serde(default)]
    pub quiz_ref: Option<String>,
}

/// Load progression rules from a YAML file, or the built-in defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or the rules are invalid.
pub fn load_rules(path: Option<&Path>) -> anyhow::Result<ProgressionRules> {
    let Some(path) = path else {
        return Ok(ProgressionRules::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    ProgressionRules::from_yaml_str(&raw)
        .with_context(|| format!("invalid rules file {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct ProgressionApi {
    db_path: PathBuf,
    rules: Arc<ProgressionRules>,
    max_submit_attempts: u32,
    busy_timeout: Option<Duration>,
}

impl ProgressionApi {
    #[must_use]
    pub fn new(db_path: PathBuf, rules: ProgressionRules) -> Self {
        Self {
            db_path,
            rules: Arc::new(rules),
            max_submit_attempts: DEFAULT_MAX_SUBMIT_ATTEMPTS,
            busy_timeout: None,
        }
    }

    /// Total attempts per submission, first try included. Zero is read as one.
    #[must_use]
    pub fn with_max_submit_attempts(mut self, attempts: u32) -> Self {
        self.max_submit_attempts = attempts.max(1);
        self
    }

    /// How long each attempt waits on another writer before it counts as a conflict.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_submit_attempts(&self) -> u32 {
        self.max_submit_attempts
    }

    #[must_use]
    pub fn rules(&self) -> &ProgressionRules {
        &self.rules
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let store = SqliteStore::open(&self.db_path)?;
        if let Some(timeout) = self.busy_timeout {
            store.set_busy_timeout(timeout)?;
        }
        Ok(store)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ApiError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Credit one activity claim for `user_id` at the current time.
    ///
    /// # Errors
    /// See [`ProgressionApi::submit_activity_at`].
    pub fn submit_activity(
        &self,
        user_id: &UserId,
        claim: &ActivityClaim,
    ) -> Result<AwardSummary, ApiError> {
        self.submit_activity_at(user_id, claim, OffsetDateTime::now_utc())
    }

    /// Credit one activity claim, retrying write conflicts up to the configured
    /// attempt budget. Every attempt re-runs the idempotency check, so a retry
    /// after a concurrent credit of the same key yields a zero award.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] for malformed claims and
    /// [`ApiError::Conflict`] naming the attempt count once the budget is
    /// exhausted.
    pub fn submit_activity_at(
        &self,
        user_id: &UserId,
        claim: &ActivityClaim,
        at: OffsetDateTime,
    ) -> Result<AwardSummary, ApiError> {
        claim.validate()?;
        let mut store = self.open_migrated_store()?;

        let mut attempt = 1;
        loop {
            match store.submit_activity(user_id, claim, &self.rules, at) {
                Ok(summary) => return Ok(summary),
                Err(err @ StoreError::Conflict { .. }) if attempt < self.max_submit_attempts => {
                    tracing::warn!(
                        user_id = %user_id,
                        attempt,
                        max_attempts = self.max_submit_attempts,
                        error = %err,
                        "retrying conflicted activity submission"
                    );
                    attempt += 1;
                }
                Err(err @ StoreError::Conflict { .. }) => {
                    tracing::warn!(user_id = %user_id, attempt, "submission retries exhausted");
                    return Err(ApiError::Conflict(format!(
                        "{err}; gave up after {attempt} attempts"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Profile read model; absent profiles yield the zero state without persisting it.
    ///
    /// # Errors
    /// Returns an error when the profile cannot be read.
    pub fn get_profile(&self, user_id: &UserId) -> Result<ProfileView, ApiError> {
        let store = self.open_migrated_store()?;
        let profile = store.get_profile(user_id)?.unwrap_or_else(|| Profile::new(user_id.clone()));
        Ok(self.profile_view(profile, OffsetDateTime::now_utc()))
    }

    fn profile_view(&self, profile: Profile, now: OffsetDateTime) -> ProfileView {
        let level = self.rules.level_for(profile.points);
        let next_level = self.rules.next_tier(level).map(|tier| NextLevel {
            level: tier.level,
            title: tier.level.title().to_string(),
            threshold: tier.threshold,
            points_needed: tier.threshold.saturating_sub(profile.points),
        });
        let badges = profile
            .badges
            .iter()
            .map(|id| {
                self.rules.badge(id).map_or_else(
                    || AwardedBadge { id: id.clone(), name: id.to_string(), description: String::new() },
                    AwardedBadge::from,
                )
            })
            .collect();

        ProfileView {
            active_streak_days: profile.streak.active_days(now.date()),
            user_id: profile.user_id,
            points: profile.points,
            level,
            level_title: level.title().to_string(),
            next_level,
            badges,
            credited_count: profile.credited.len(),
            streak: profile.streak,
            last_activity_at: profile.last_activity_at,
            revision: profile.revision,
        }
    }

    /// Credited activity ledger, newest first.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn list_activities(&self, user_id: &UserId) -> Result<Vec<CreditedActivity>, ApiError> {
        let store = self.open_migrated_store()?;
        Ok(store.list_activities(user_id)?)
    }

    #[must_use]
    pub fn list_badges(&self) -> Vec<BadgeDefinition> {
        self.rules.badges.clone()
    }

    /// Top profiles by points. `limit` defaults to 10 and is capped at 100.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] for a zero limit.
    pub fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>, ApiError> {
        let limit = limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
        if limit == 0 {
            return Err(ApiError::Invalid("limit MUST be at least 1".into()));
        }
        let store = self.open_migrated_store()?;
        Ok(store.leaderboard(limit.min(MAX_LEADERBOARD_LIMIT))?)
    }

    /// Apply an administrative point correction.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] when accountability fields are missing.
    pub fn adjust_points(
        &self,
        user_id: &UserId,
        input: &AdjustPointsRequest,
    ) -> Result<PointAdjustment, ApiError> {
        let mut store = self.open_migrated_store()?;
        Ok(store.adjust_points(
            user_id,
            input.delta,
            &input.writer,
            &input.justification,
            &self.rules,
            OffsetDateTime::now_utc(),
        )?)
    }

    /// Register or replace the answer key of a quiz.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] when the reference, key, or writer is empty.
    pub fn register_quiz(&self, input: &RegisterQuizRequest) -> Result<RegisterQuizResult, ApiError> {
        let quiz_ref = input.quiz_ref.trim();
        if quiz_ref.is_empty() {
            return Err(ApiError::Invalid("quiz_ref MUST be non-empty".into()));
        }
        if input.answer_key.is_empty() {
            return Err(ApiError::Invalid("answer_key MUST contain at least one question".into()));
        }
        if input.writer.trim().is_empty() {
            return Err(ApiError::Invalid("writer MUST be provided".into()));
        }

        let mut store = self.open_migrated_store()?;
        store.register_quiz_key(quiz_ref, &input.answer_key, &input.writer, OffsetDateTime::now_utc())?;
        tracing::info!(quiz_ref, questions = input.answer_key.len(), "quiz answer key registered");
        Ok(RegisterQuizResult {
            quiz_ref: quiz_ref.to_string(),
            total_questions: input.answer_key.len(),
        })
    }

    /// Score answers without crediting anything.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] when no answer key is available.
    pub fn score_quiz(&self, input: &ScoreQuizRequest) -> Result<QuizScore, ApiError> {
        let registered = match input.quiz_ref.as_deref() {
            Some(quiz_ref) => self.open_migrated_store()?.get_quiz_key(quiz_ref)?,
            None => None,
        };
        let Some(answer_key) = registered.as_ref().or(input.answer_key.as_ref()) else {
            return Err(ApiError::Invalid("no answer key available for scoring".into()));
        };
        Ok(score_quiz(&input.answers, answer_key))
    }
}
