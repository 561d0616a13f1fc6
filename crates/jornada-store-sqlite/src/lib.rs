use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jornada_core::{
    apply_activity, apply_adjustment, ActivityClaim, ActivityId, ActivityPayload, ActivityType,
    AnswerKey, AwardSummary, BadgeId, CreditKey, CreditedActivity, Level, Profile,
    ProgressionError, ProgressionRules, ReadingStreak, UserId,
};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS profiles (
  user_id TEXT PRIMARY KEY,
  points INTEGER NOT NULL CHECK (points >= 0),
  level TEXT NOT NULL CHECK (level IN ('aprendiz','discipulo','servo','obreiro','lider','mestre')),
  streak_current_days INTEGER NOT NULL DEFAULT 0 CHECK (streak_current_days >= 0),
  streak_longest_days INTEGER NOT NULL DEFAULT 0 CHECK (streak_longest_days >= 0),
  last_reading_date TEXT,
  last_activity_at TEXT,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credited_activities (
  activity_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  activity_type TEXT NOT NULL CHECK (activity_type IN ('chapter_read','quiz_completed','course_completed','donation_completed')),
  activity_ref TEXT NOT NULL,
  points_awarded INTEGER NOT NULL CHECK (points_awarded >= 0),
  credited_at TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  PRIMARY KEY (user_id, activity_ref),
  FOREIGN KEY (user_id) REFERENCES profiles(user_id)
);

CREATE TABLE IF NOT EXISTS badge_awards (
  user_id TEXT NOT NULL,
  badge_id TEXT NOT NULL,
  activity_id TEXT NOT NULL,
  awarded_at TEXT NOT NULL,
  PRIMARY KEY (user_id, badge_id),
  FOREIGN KEY (user_id) REFERENCES profiles(user_id),
  FOREIGN KEY (activity_id) REFERENCES credited_activities(activity_id)
);

CREATE TABLE IF NOT EXISTS point_adjustments (
  adjustment_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  delta INTEGER NOT NULL,
  points_before INTEGER NOT NULL CHECK (points_before >= 0),
  points_after INTEGER NOT NULL CHECK (points_after >= 0),
  level_before TEXT NOT NULL,
  level_after TEXT NOT NULL,
  writer TEXT NOT NULL,
  justification TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES profiles(user_id)
);

CREATE INDEX IF NOT EXISTS idx_credited_activities_user ON credited_activities(user_id, credited_at);
CREATE INDEX IF NOT EXISTS idx_point_adjustments_user ON point_adjustments(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_profiles_points ON profiles(points DESC, user_id ASC);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS quiz_keys (
  quiz_ref TEXT PRIMARY KEY,
  answer_key_json TEXT NOT NULL,
  writer TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const PROFILES_FILE: &str = "profiles.ndjson";
const ACTIVITIES_FILE: &str = "credited_activities.ndjson";
const ADJUSTMENTS_FILE: &str = "point_adjustments.ndjson";

/// Errors surfaced by write paths that callers must tell apart.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] ProgressionError),
    #[error("write conflict for user {user_id}: {reason}")]
    Conflict { user_id: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Storage(_))
    }

    fn conflict(user_id: &UserId, reason: impl Into<String>) -> Self {
        Self::Conflict { user_id: user_id.to_string(), reason: reason.into() }
    }

    fn from_sqlite(err: rusqlite::Error, user_id: &UserId, action: &str) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::conflict(user_id, format!("database busy while {action}"))
            }
            Some(ErrorCode::ConstraintViolation) => {
                Self::conflict(user_id, format!("concurrent write detected while {action}: {err}"))
            }
            _ => Self::Storage(anyhow!(err).context(format!("failed while {action}"))),
        }
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointAdjustment {
    pub adjustment_id: Ulid,
    pub user_id: UserId,
    pub delta: i64,
    pub points_before: u64,
    pub points_after: u64,
    pub level_before: Level,
    pub level_after: Level,
    pub writer: String,
    pub justification: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    pub points: u64,
    pub level: Level,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A profile whose stored total disagrees with its award and adjustment ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMismatch {
    pub user_id: String,
    pub stored_points: i64,
    pub ledger_points: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub ledger_mismatches: Vec<LedgerMismatch>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed profile store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Replace the busy timeout applied while waiting for another writer.
    ///
    /// # Errors
    /// Returns an error when the timeout cannot be applied to the connection.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout).context("failed to set sqlite busy timeout")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        ensure_schema_migrations_table(&self.conn)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        ensure_schema_migrations_table(&self.conn)?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            tracing::info!(version = target, "applied schema migration");
            version = target;
        }

        Ok(())
    }

    /// Credit one activity claim for `user_id` in a single write transaction.
    ///
    /// The profile is created lazily, the idempotency check runs inside the
    /// transaction, and the profile row is updated with a compare-and-set on
    /// its revision. Duplicate claims return a zero award and write nothing.
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] for malformed claims, [`StoreError::Conflict`]
    /// when a concurrent writer interfered, and [`StoreError::Storage`] otherwise.
    pub fn submit_activity(
        &mut self,
        user_id: &UserId,
        claim: &ActivityClaim,
        rules: &ProgressionRules,
        at: OffsetDateTime,
    ) -> Result<AwardSummary, StoreError> {
        claim.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, user_id, "starting award transaction"))?;

        let (mut profile, revision) = match load_profile(&tx, user_id)? {
            Some(profile) => {
                let revision = profile.revision;
                (profile, revision)
            }
            None => (Profile::new(user_id.clone()), 0),
        };
        profile.level = rules.level_for(profile.points);

        let claim = resolve_quiz_key(&tx, claim)?;
        let outcome = apply_activity(&profile, &claim, rules, at)?;

        let Some(credited) = outcome.credited else {
            tracing::debug!(
                user_id = %user_id,
                credit_key = %claim.credit_key(),
                "activity already credited"
            );
            return Ok(outcome.summary);
        };

        persist_profile(&tx, &outcome.profile, revision, at)?;
        insert_credited(&tx, &credited)?;
        for badge in &outcome.summary.badges_awarded {
            tx.execute(
                "INSERT INTO badge_awards(user_id, badge_id, activity_id, awarded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id.as_str(),
                    badge.id.as_str(),
                    credited.activity_id.to_string(),
                    rfc3339(at)?
                ],
            )
            .map_err(|err| StoreError::from_sqlite(err, user_id, "recording badge award"))?;
        }

        tx.commit().map_err(|err| StoreError::from_sqlite(err, user_id, "committing award"))?;

        let summary = outcome.summary;
        tracing::info!(
            user_id = %user_id,
            activity_type = summary.activity_type.as_str(),
            activity_ref = %summary.activity_ref,
            points_awarded = summary.points_awarded,
            new_total = summary.new_total,
            badges = summary.badges_awarded.len(),
            "activity credited"
        );
        if summary.leveled_up {
            tracing::info!(
                user_id = %user_id,
                from = summary.previous_level.as_str(),
                to = summary.new_level.as_str(),
                "profile leveled up"
            );
        }

        Ok(summary)
    }

    /// Apply an administrative point correction and record it in the adjustment ledger.
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] when accountability fields are empty or the
    /// delta is zero, [`StoreError::Conflict`] on concurrent writes, and
    /// [`StoreError::Storage`] otherwise.
    pub fn adjust_points(
        &mut self,
        user_id: &UserId,
        delta: i64,
        writer: &str,
        justification: &str,
        rules: &ProgressionRules,
        at: OffsetDateTime,
    ) -> Result<PointAdjustment, StoreError> {
        if delta == 0 {
            return Err(ProgressionError::Validation("delta MUST be non-zero".into()).into());
        }
        if writer.trim().is_empty() {
            return Err(ProgressionError::Validation(
                "writer MUST be provided for every adjustment".into(),
            )
            .into());
        }
        if justification.trim().is_empty() {
            return Err(ProgressionError::Validation(
                "justification MUST be provided for every adjustment".into(),
            )
            .into());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::from_sqlite(err, user_id, "starting adjustment"))?;

        let (mut profile, revision) = match load_profile(&tx, user_id)? {
            Some(profile) => {
                let revision = profile.revision;
                (profile, revision)
            }
            None => (Profile::new(user_id.clone()), 0),
        };
        profile.level = rules.level_for(profile.points);
        let adjusted = apply_adjustment(&profile, delta, rules);

        persist_profile(&tx, &adjusted, revision, at)?;

        let adjustment = PointAdjustment {
            adjustment_id: Ulid::new(),
            user_id: user_id.clone(),
            delta,
            points_before: profile.points,
            points_after: adjusted.points,
            level_before: profile.level,
            level_after: adjusted.level,
            writer: writer.trim().to_string(),
            justification: justification.trim().to_string(),
            created_at: at,
        };
        tx.execute(
            "INSERT INTO point_adjustments(
                adjustment_id, user_id, delta, points_before, points_after,
                level_before, level_after, writer, justification, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                adjustment.adjustment_id.to_string(),
                user_id.as_str(),
                delta,
                to_sql_int(adjustment.points_before)?,
                to_sql_int(adjustment.points_after)?,
                adjustment.level_before.as_str(),
                adjustment.level_after.as_str(),
                adjustment.writer,
                adjustment.justification,
                rfc3339(at)?,
            ],
        )
        .map_err(|err| StoreError::from_sqlite(err, user_id, "recording adjustment"))?;

        tx.commit()
            .map_err(|err| StoreError::from_sqlite(err, user_id, "committing adjustment"))?;

        tracing::info!(
            user_id = %user_id,
            delta,
            points_after = adjustment.points_after,
            writer = %adjustment.writer,
            "points adjusted"
        );
        Ok(adjustment)
    }

    /// Load one profile with its credited refs and badges.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>> {
        load_profile(&self.conn, user_id).map_err(|err| anyhow!(err))
    }

    /// Credited activity ledger for one user, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_activities(&self, user_id: &UserId) -> Result<Vec<CreditedActivity>> {
        let mut stmt = self.conn.prepare(
            "SELECT activity_id, activity_type, activity_ref, points_awarded, credited_at, payload_json
             FROM credited_activities
             WHERE user_id = ?1
             ORDER BY credited_at DESC, activity_id DESC",
        )?;
        let mut rows = stmt.query(params![user_id.as_str()])?;
        let mut activities = Vec::new();

        while let Some(row) = rows.next()? {
            activities.push(decode_credited(user_id.clone(), row)?);
        }

        Ok(activities)
    }

    /// Point adjustments recorded for one user, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_adjustments(&self, user_id: &UserId) -> Result<Vec<PointAdjustment>> {
        let mut stmt = self.conn.prepare(
            "SELECT adjustment_id, delta, points_before, points_after,
                    level_before, level_after, writer, justification, created_at
             FROM point_adjustments
             WHERE user_id = ?1
             ORDER BY created_at ASC, adjustment_id ASC",
        )?;
        let mut rows = stmt.query(params![user_id.as_str()])?;
        let mut adjustments = Vec::new();

        while let Some(row) = rows.next()? {
            let adjustment_id_raw: String = row.get(0)?;
            let points_before = from_sql_int(row.get(2)?)?;
            let points_after = from_sql_int(row.get(3)?)?;
            adjustments.push(PointAdjustment {
                adjustment_id: Ulid::from_string(&adjustment_id_raw)
                    .with_context(|| format!("invalid ULID: {adjustment_id_raw}"))?,
                user_id: user_id.clone(),
                delta: row.get(1)?,
                points_before,
                points_after,
                level_before: decode_level(&row.get::<_, String>(4)?)?,
                level_after: decode_level(&row.get::<_, String>(5)?)?,
                writer: row.get(6)?,
                justification: row.get(7)?,
                created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
            });
        }

        Ok(adjustments)
    }

    /// Top profiles by points; ties resolve by user id ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, points, level FROM profiles
             ORDER BY points DESC, user_id ASC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let user_id_raw: String = row.get(0)?;
            let points = from_sql_int(row.get(1)?)?;
            let level_raw: String = row.get(2)?;
            entries.push(LeaderboardEntry {
                rank: entries.len() + 1,
                user_id: UserId::parse(&user_id_raw)
                    .map_err(|err| anyhow!("stored user_id is invalid: {err}"))?,
                points,
                level: decode_level(&level_raw)?,
            });
        }

        Ok(entries)
    }

    /// Register or replace the answer key of a quiz.
    ///
    /// # Errors
    /// Returns an error when the key or writer is empty, or persistence fails.
    pub fn register_quiz_key(
        &mut self,
        quiz_ref: &str,
        answer_key: &AnswerKey,
        writer: &str,
        at: OffsetDateTime,
    ) -> Result<()> {
        if quiz_ref.trim().is_empty() {
            return Err(anyhow!("quiz_ref MUST be non-empty"));
        }
        if answer_key.is_empty() {
            return Err(anyhow!("answer_key MUST contain at least one question"));
        }
        if writer.trim().is_empty() {
            return Err(anyhow!("writer MUST be provided for every quiz key write"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO quiz_keys(quiz_ref, answer_key_json, writer, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(quiz_ref) DO UPDATE SET
               answer_key_json = excluded.answer_key_json,
               writer = excluded.writer,
               updated_at = excluded.updated_at",
            params![
                quiz_ref.trim(),
                serde_json::to_string(answer_key).context("failed to serialize answer key")?,
                writer.trim(),
                rfc3339(at)?
            ],
        )
        .context("failed to persist quiz key")?;
        tx.commit().context("failed to commit quiz key transaction")?;
        Ok(())
    }

    /// Registered answer key for a quiz, if any.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON decoding fails.
    pub fn get_quiz_key(&self, quiz_ref: &str) -> Result<Option<AnswerKey>> {
        load_quiz_key(&self.conn, quiz_ref.trim())
    }

    /// Export profiles, credited activities and adjustments as deterministic
    /// NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut profiles = Vec::new();
        let mut activities = Vec::new();
        let mut adjustments = Vec::new();
        for user_id in self.list_user_ids()? {
            if let Some(profile) = self.get_profile(&user_id)? {
                profiles.push(profile);
            }
            let mut user_activities = self.list_activities(&user_id)?;
            user_activities.reverse();
            activities.extend(user_activities);
            adjustments.extend(self.list_adjustments(&user_id)?);
        }

        let profiles_digest = write_ndjson_file(&out_dir.join(PROFILES_FILE), &profiles)?;
        let activities_digest = write_ndjson_file(&out_dir.join(ACTIVITIES_FILE), &activities)?;
        let adjustments_digest = write_ndjson_file(&out_dir.join(ADJUSTMENTS_FILE), &adjustments)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: PROFILES_FILE.to_string(),
                    sha256: profiles_digest.0,
                    records: profiles_digest.1,
                },
                ExportFileDigest {
                    path: ACTIVITIES_FILE.to_string(),
                    sha256: activities_digest.0,
                    records: activities_digest.1,
                },
                ExportFileDigest {
                    path: ADJUSTMENTS_FILE.to_string(),
                    sha256: adjustments_digest.0,
                    records: adjustments_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, ledger reconciliation and schema probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let ledger_mismatches = self.ledger_mismatches()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            ledger_mismatches,
            schema_status,
        })
    }

    fn ledger_mismatches(&self) -> Result<Vec<LedgerMismatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.user_id, p.points,
                    COALESCE((SELECT SUM(c.points_awarded) FROM credited_activities c
                              WHERE c.user_id = p.user_id), 0)
                  + COALESCE((SELECT SUM(a.points_after - a.points_before) FROM point_adjustments a
                              WHERE a.user_id = p.user_id), 0)
             FROM profiles p
             ORDER BY p.user_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LedgerMismatch {
                user_id: row.get(0)?,
                stored_points: row.get(1)?,
                ledger_points: row.get(2)?,
            })
        })?;

        let mut mismatches = Vec::new();
        for row in rows {
            let row = row?;
            if row.stored_points != row.ledger_points {
                mismatches.push(row);
            }
        }
        Ok(mismatches)
    }

    fn list_user_ids(&self) -> Result<Vec<UserId>> {
        let mut stmt = self.conn.prepare("SELECT user_id FROM profiles ORDER BY user_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut user_ids = Vec::new();
        for row in rows {
            let raw = row?;
            user_ids.push(
                UserId::parse(&raw).map_err(|err| anyhow!("stored user_id is invalid: {err}"))?,
            );
        }
        Ok(user_ids)
    }
}

#[derive(Debug)]
struct ProfileRow {
    points: i64,
    level: String,
    streak_current_days: i64,
    streak_longest_days: i64,
    last_reading_date: Option<String>,
    last_activity_at: Option<String>,
    revision: i64,
}

fn load_profile(conn: &Connection, user_id: &UserId) -> Result<Option<Profile>, StoreError> {
    let row = conn
        .query_row(
            "SELECT points, level, streak_current_days, streak_longest_days,
                    last_reading_date, last_activity_at, revision
             FROM profiles WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| {
                Ok(ProfileRow {
                    points: row.get(0)?,
                    level: row.get(1)?,
                    streak_current_days: row.get(2)?,
                    streak_longest_days: row.get(3)?,
                    last_reading_date: row.get(4)?,
                    last_activity_at: row.get(5)?,
                    revision: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|err| StoreError::from_sqlite(err, user_id, "loading profile"))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut profile = Profile::new(user_id.clone());
    profile.points = from_sql_int(row.points)?;
    profile.revision = from_sql_int(row.revision)?;
    profile.level = Level::parse(&row.level).unwrap_or_else(|| {
        tracing::warn!(user_id = %user_id, level = %row.level, "unknown stored level; using aprendiz");
        Level::Aprendiz
    });
    profile.streak = ReadingStreak {
        current_days: u32::try_from(row.streak_current_days).unwrap_or_default(),
        longest_days: u32::try_from(row.streak_longest_days).unwrap_or_default(),
        last_reading_date: row.last_reading_date.as_deref().and_then(|raw| {
            parse_date(raw)
                .inspect_err(|err| {
                    tracing::warn!(user_id = %user_id, error = %err, "ignoring stored reading date");
                })
                .ok()
        }),
    };
    profile.last_activity_at = row.last_activity_at.as_deref().and_then(|raw| {
        parse_rfc3339(raw)
            .inspect_err(|err| {
                tracing::warn!(user_id = %user_id, error = %err, "ignoring stored activity time");
            })
            .ok()
    });

    {
        let mut stmt = conn
            .prepare(
                "SELECT activity_type, activity_ref FROM credited_activities WHERE user_id = ?1",
            )
            .map_err(|err| StoreError::from_sqlite(err, user_id, "loading credited refs"))?;
        let rows = stmt
            .query_map(params![user_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| StoreError::from_sqlite(err, user_id, "loading credited refs"))?;
        for row in rows {
            let (activity_type_raw, activity_ref) =
                row.map_err(|err| StoreError::from_sqlite(err, user_id, "loading credited refs"))?;
            let activity_type = ActivityType::parse(&activity_type_raw)
                .ok_or_else(|| anyhow!("unknown activity_type: {activity_type_raw}"))?;
            profile.credited.insert(activity_ref, activity_type);
        }
    }

    {
        let mut stmt = conn
            .prepare("SELECT badge_id FROM badge_awards WHERE user_id = ?1")
            .map_err(|err| StoreError::from_sqlite(err, user_id, "loading badges"))?;
        let rows = stmt
            .query_map(params![user_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(|err| StoreError::from_sqlite(err, user_id, "loading badges"))?;
        for row in rows {
            let badge_id =
                row.map_err(|err| StoreError::from_sqlite(err, user_id, "loading badges"))?;
            profile.badges.insert(BadgeId::new(badge_id));
        }
    }

    Ok(Some(profile))
}

/// Write the profile row, inserting it on first contact or updating it only
/// while the stored revision still equals `expected_revision`.
fn persist_profile(
    conn: &Connection,
    profile: &Profile,
    expected_revision: u64,
    at: OffsetDateTime,
) -> Result<(), StoreError> {
    let user_id = &profile.user_id;
    let now = rfc3339(at)?;
    let last_reading_date = profile.streak.last_reading_date.map(format_date).transpose()?;
    let last_activity_at = profile.last_activity_at.map(rfc3339).transpose()?;

    if expected_revision == 0 {
        conn.execute(
            "INSERT INTO profiles(
                user_id, points, level, streak_current_days, streak_longest_days,
                last_reading_date, last_activity_at, revision, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                user_id.as_str(),
                to_sql_int(profile.points)?,
                profile.level.as_str(),
                profile.streak.current_days,
                profile.streak.longest_days,
                last_reading_date,
                last_activity_at,
                now,
            ],
        )
        .map_err(|err| StoreError::from_sqlite(err, user_id, "creating profile"))?;
        return Ok(());
    }

    let changed = conn
        .execute(
            "UPDATE profiles SET
                points = ?2, level = ?3, streak_current_days = ?4, streak_longest_days = ?5,
                last_reading_date = ?6, last_activity_at = ?7,
                revision = revision + 1, updated_at = ?8
             WHERE user_id = ?1 AND revision = ?9",
            params![
                user_id.as_str(),
                to_sql_int(profile.points)?,
                profile.level.as_str(),
                profile.streak.current_days,
                profile.streak.longest_days,
                last_reading_date,
                last_activity_at,
                now,
                to_sql_int(expected_revision)?,
            ],
        )
        .map_err(|err| StoreError::from_sqlite(err, user_id, "updating profile"))?;

    if changed != 1 {
        return Err(StoreError::conflict(
            user_id,
            format!("profile revision {expected_revision} is no longer current"),
        ));
    }
    Ok(())
}

fn insert_credited(conn: &Connection, credited: &CreditedActivity) -> Result<(), StoreError> {
    let user_id = &credited.user_id;
    conn.execute(
        "INSERT INTO credited_activities(
            activity_id, user_id, activity_type, activity_ref, points_awarded, credited_at, payload_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            credited.activity_id.to_string(),
            user_id.as_str(),
            credited.key.activity_type.as_str(),
            credited.key.activity_ref,
            to_sql_int(credited.points_awarded)?,
            rfc3339(credited.credited_at)?,
            serde_json::to_string(&credited.payload).context("failed to serialize payload")?,
        ],
    )
    .map_err(|err| StoreError::from_sqlite(err, user_id, "recording credited activity"))?;
    Ok(())
}

fn decode_credited(user_id: UserId, row: &rusqlite::Row<'_>) -> Result<CreditedActivity> {
    let activity_id_raw: String = row.get(0)?;
    let activity_type_raw: String = row.get(1)?;
    let payload_json: String = row.get(5)?;
    let activity_type = ActivityType::parse(&activity_type_raw)
        .ok_or_else(|| anyhow!("unknown activity_type: {activity_type_raw}"))?;
    let payload: ActivityPayload =
        serde_json::from_str(&payload_json).context("failed to deserialize activity payload")?;

    Ok(CreditedActivity {
        activity_id: ActivityId(
            Ulid::from_string(&activity_id_raw)
                .with_context(|| format!("invalid ULID: {activity_id_raw}"))?,
        ),
        user_id,
        key: CreditKey { activity_type, activity_ref: row.get(2)? },
        points_awarded: from_sql_int(row.get(3)?)?,
        credited_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        payload,
    })
}

/// Swap in the registered answer key for quiz claims when one exists.
fn resolve_quiz_key<'a>(
    conn: &Connection,
    claim: &'a ActivityClaim,
) -> Result<std::borrow::Cow<'a, ActivityClaim>> {
    let ActivityPayload::QuizCompleted(quiz) = &claim.activity else {
        return Ok(std::borrow::Cow::Borrowed(claim));
    };
    let Some(registered) = load_quiz_key(conn, claim.activity_ref.trim())? else {
        return Ok(std::borrow::Cow::Borrowed(claim));
    };

    let mut quiz = quiz.clone();
    quiz.answer_key = Some(registered);
    Ok(std::borrow::Cow::Owned(ActivityClaim {
        activity_ref: claim.activity_ref.clone(),
        activity: ActivityPayload::QuizCompleted(quiz),
    }))
}

fn load_quiz_key(conn: &Connection, quiz_ref: &str) -> Result<Option<AnswerKey>> {
    let raw = conn
        .query_row(
            "SELECT answer_key_json FROM quiz_keys WHERE quiz_ref = ?1",
            params![quiz_ref],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to load quiz key")?;

    raw.map(|json| {
        serde_json::from_str::<BTreeMap<String, String>>(&json)
            .context("failed to deserialize stored answer key")
    })
    .transpose()
}

/// Create the migrations table only when missing, so an up-to-date database
/// is never written to while another connection holds the write lock.
fn ensure_schema_migrations_table(conn: &Connection) -> Result<()> {
    let exists = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to inspect sqlite_master")?
        > 0;
    if !exists {
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
    }
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} exceeds sqlite integer range"))
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("stored value {value} is negative"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn format_date(value: Date) -> Result<String> {
    value
        .format(time::macros::format_description!("[year]-[month]-[day]"))
        .context("failed to format calendar date")
}

fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value, time::macros::format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid calendar date: {value}"))
}

fn decode_level(raw: &str) -> Result<Level> {
    Level::parse(raw).ok_or_else(|| anyhow!("unknown level: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use super::*;
    use jornada_core::{
        ChapterReadMetadata, CourseCompletedMetadata, QuizCompletedMetadata,
    };
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_user(raw: &str) -> UserId {
        match UserId::parse(raw) {
            Ok(user_id) => user_id,
            Err(err) => panic!("invalid fixture user id {raw}: {err}"),
        }
    }

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn unique_temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("jornada-{label}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup_sqlite(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = std::path::PathBuf::from(format!("{}{}", path.display(), suffix));
            if candidate.exists() {
                fs::remove_file(&candidate).with_context(|| {
                    format!("failed to cleanup sqlite file {}", candidate.display())
                })?;
            }
        }
        Ok(())
    }

    fn chapter(reference: &str) -> ActivityClaim {
        ActivityClaim {
            activity_ref: reference.to_string(),
            activity: ActivityPayload::ChapterRead(ChapterReadMetadata {
                book: Some("Gênesis".to_string()),
                chapter: Some(1),
            }),
        }
    }

    fn course(reference: &str) -> ActivityClaim {
        ActivityClaim {
            activity_ref: reference.to_string(),
            activity: ActivityPayload::CourseCompleted(CourseCompletedMetadata {
                course_name: Some("Fundamentos da Fé".to_string()),
            }),
        }
    }

    fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect()
    }

    fn submit(
        store: &mut SqliteStore,
        user_id: &UserId,
        claim: &ActivityClaim,
    ) -> Result<AwardSummary> {
        store
            .submit_activity(user_id, claim, &ProgressionRules::default(), fixture_time())
            .map_err(|err| anyhow!(err))
    }

    #[test]
    fn migrate_is_idempotent_and_reports_latest_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn submit_creates_profile_lazily_and_persists_award() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-1");
        assert!(store.get_profile(&user_id)?.is_none());

        let summary = submit(&mut store, &user_id, &chapter("gen-1"))?;
        assert_eq!(summary.points_awarded, 10);

        let Some(profile) = store.get_profile(&user_id)? else {
            panic!("profile should exist after first award");
        };
        assert_eq!(profile.points, 10);
        assert_eq!(profile.revision, 1);
        assert_eq!(profile.streak.current_days, 1);
        assert!(profile.badges.contains(&BadgeId::new("first_chapter")));
        assert_eq!(profile.last_activity_at, Some(fixture_time()));
        Ok(())
    }

    #[test]
    fn duplicate_submission_writes_nothing() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-2");

        submit(&mut store, &user_id, &chapter("gen-1"))?;
        let before = store.get_profile(&user_id)?;

        let duplicate = submit(&mut store, &user_id, &chapter("gen-1"))?;
        assert!(duplicate.already_credited);
        assert_eq!(duplicate.points_awarded, 0);
        assert_eq!(duplicate.new_total, 10);

        assert_eq!(store.get_profile(&user_id)?, before);
        assert_eq!(store.list_activities(&user_id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn credited_reference_under_another_type_writes_nothing() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-2b");

        submit(&mut store, &user_id, &chapter("gen-1"))?;
        let before = store.get_profile(&user_id)?;

        let resubmitted = submit(&mut store, &user_id, &course("gen-1"))?;
        assert!(resubmitted.already_credited);
        assert_eq!(resubmitted.points_awarded, 0);
        assert_eq!(resubmitted.new_total, 10);
        assert!(resubmitted.badges_awarded.is_empty());

        assert_eq!(store.get_profile(&user_id)?, before);
        let activities = store.list_activities(&user_id)?;
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].key.activity_type, ActivityType::ChapterRead);

        let duplicate_row = store.conn.execute(
            "INSERT INTO credited_activities(
                activity_id, user_id, activity_type, activity_ref, points_awarded, credited_at, payload_json
             ) VALUES (?1, ?2, 'course_completed', 'gen-1', 50, ?3, '{}')",
            params![Ulid::new().to_string(), user_id.as_str(), rfc3339(fixture_time())?],
        );
        assert!(duplicate_row.is_err(), "one ledger row per member and reference");
        Ok(())
    }

    #[test]
    fn course_badge_is_recorded_once() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-3");

        let first = submit(&mut store, &user_id, &course("curso-1"))?;
        assert_eq!(first.badges_awarded.len(), 1);
        assert_eq!(first.badges_awarded[0].id.as_str(), "course_finisher");

        let repeat = submit(&mut store, &user_id, &course("curso-1"))?;
        assert!(repeat.badges_awarded.is_empty());
        let second = submit(&mut store, &user_id, &course("curso-2"))?;
        assert!(second.badges_awarded.is_empty());

        let badge_rows: i64 = store.conn.query_row(
            "SELECT COUNT(*) FROM badge_awards WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        assert_eq!(badge_rows, 1);
        Ok(())
    }

    #[test]
    fn registered_quiz_key_overrides_inline_key() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-4");
        store.register_quiz_key(
            "quiz-genesis",
            &answers(&[("q1", "a"), ("q2", "b")]),
            "pastor",
            fixture_time(),
        )?;

        let claim = ActivityClaim {
            activity_ref: "quiz-genesis".to_string(),
            activity: ActivityPayload::QuizCompleted(QuizCompletedMetadata {
                answers: answers(&[("q1", "a"), ("q2", "c")]),
                answer_key: Some(answers(&[("q1", "a"), ("q2", "c")])),
            }),
        };
        let summary = submit(&mut store, &user_id, &claim)?;

        let Some(score) = summary.quiz_score else {
            panic!("quiz award should report a score");
        };
        assert_eq!(score.correct_count, 1);
        assert_eq!(summary.points_awarded, 5);
        Ok(())
    }

    #[test]
    fn quiz_without_any_key_is_invalid_and_not_retry_safe() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-5");
        let claim = ActivityClaim {
            activity_ref: "quiz-unknown".to_string(),
            activity: ActivityPayload::QuizCompleted(QuizCompletedMetadata {
                answers: answers(&[("q1", "a")]),
                answer_key: None,
            }),
        };

        let Err(err) =
            store.submit_activity(&user_id, &claim, &ProgressionRules::default(), fixture_time())
        else {
            panic!("quiz without key must be rejected");
        };
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(!err.is_retry_safe());
        assert!(store.get_profile(&user_id)?.is_none());
        Ok(())
    }

    #[test]
    fn stale_revision_is_reported_as_conflict() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-6");
        submit(&mut store, &user_id, &chapter("gen-1"))?;

        let Some(profile) = store.get_profile(&user_id)? else {
            panic!("profile should exist");
        };
        let Err(err) = persist_profile(&store.conn, &profile, 7, fixture_time()) else {
            panic!("stale revision must not update the profile");
        };
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(err.is_retry_safe());

        let Err(err) = persist_profile(&store.conn, &profile, 0, fixture_time()) else {
            panic!("second profile insert must conflict");
        };
        assert!(matches!(err, StoreError::Conflict { .. }));
        Ok(())
    }

    #[test]
    fn adjustments_are_clamped_and_reconciled() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-7");
        let rules = ProgressionRules::default();
        submit(&mut store, &user_id, &chapter("gen-1"))?;

        let raise = store
            .adjust_points(&user_id, 95, "secretaria", "bonus de encontro", &rules, fixture_time())
            .map_err(|err| anyhow!(err))?;
        assert_eq!(raise.points_after, 105);
        assert_eq!(raise.level_after, Level::Discipulo);

        let cut = store
            .adjust_points(&user_id, -500, "secretaria", "correção", &rules, fixture_time())
            .map_err(|err| anyhow!(err))?;
        assert_eq!(cut.points_after, 0);

        let Err(err) = store.adjust_points(&user_id, 5, " ", "x", &rules, fixture_time()) else {
            panic!("blank writer must be rejected");
        };
        assert!(matches!(err, StoreError::Invalid(_)));

        assert_eq!(store.list_adjustments(&user_id)?.len(), 2);
        let Some(profile) = store.get_profile(&user_id)? else {
            panic!("profile should exist");
        };
        assert_eq!(profile.credited.len(), 1);

        let report = store.integrity_check()?;
        assert!(report.ledger_mismatches.is_empty());
        Ok(())
    }

    #[test]
    fn leaderboard_orders_by_points_then_user() -> Result<()> {
        let mut store = memory_store()?;
        let ana = fixture_user("ana");
        let bia = fixture_user("bia");
        let caio = fixture_user("caio");

        submit(&mut store, &bia, &chapter("gen-1"))?;
        submit(&mut store, &ana, &chapter("gen-1"))?;
        submit(&mut store, &caio, &course("curso-1"))?;

        let board = store.leaderboard(10)?;
        let order = board.iter().map(|entry| entry.user_id.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["caio", "ana", "bia"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(store.leaderboard(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn malformed_stored_timestamps_fall_back_to_defaults() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-8");
        submit(&mut store, &user_id, &chapter("gen-1"))?;
        store.conn.execute(
            "UPDATE profiles SET last_reading_date = 'ontem', last_activity_at = 'agora'
             WHERE user_id = ?1",
            params![user_id.as_str()],
        )?;

        let Some(profile) = store.get_profile(&user_id)? else {
            panic!("profile should exist");
        };
        assert_eq!(profile.streak.last_reading_date, None);
        assert_eq!(profile.last_activity_at, None);

        let next = submit(&mut store, &user_id, &chapter("gen-2"))?;
        assert_eq!(next.new_total, 20);
        Ok(())
    }

    #[test]
    fn list_activities_returns_newest_first_with_payloads() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-9");
        let rules = ProgressionRules::default();
        store
            .submit_activity(&user_id, &chapter("gen-1"), &rules, fixture_time())
            .map_err(|err| anyhow!(err))?;
        store
            .submit_activity(
                &user_id,
                &course("curso-1"),
                &rules,
                fixture_time() + Duration::hours(1),
            )
            .map_err(|err| anyhow!(err))?;

        let activities = store.list_activities(&user_id)?;
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0].key.activity_type, ActivityType::CourseCompleted);
        assert_eq!(activities[1].payload, chapter("gen-1").activity);
        Ok(())
    }

    #[test]
    fn export_snapshot_writes_manifest_digests() -> Result<()> {
        let mut store = memory_store()?;
        let user_id = fixture_user("member-10");
        submit(&mut store, &user_id, &chapter("gen-1"))?;
        submit(&mut store, &user_id, &course("curso-1"))?;

        let out_dir = std::env::temp_dir().join(format!("jornada-export-{}", Ulid::new()));
        let manifest = store.export_snapshot(&out_dir)?;

        assert_eq!(manifest.files.len(), 3);
        let counts = manifest
            .files
            .iter()
            .map(|file| (file.path.as_str(), file.records))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(counts.get(PROFILES_FILE), Some(&1));
        assert_eq!(counts.get(ACTIVITIES_FILE), Some(&2));
        assert_eq!(counts.get(ADJUSTMENTS_FILE), Some(&0));
        assert!(out_dir.join("manifest.json").exists());

        fs::remove_dir_all(&out_dir)
            .with_context(|| format!("failed to cleanup {}", out_dir.display()))?;
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path("backup-source");
        let backup_path = unique_temp_db_path("backup-file");
        let user_id = fixture_user("member-11");

        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            submit(&mut store, &user_id, &chapter("gen-1"))?;
            store.backup_database(&backup_path)?;
            submit(&mut store, &user_id, &chapter("gen-2"))?;
        }

        {
            let mut store = SqliteStore::open(&db_path)?;
            store.restore_database(&backup_path)?;
            let Some(profile) = store.get_profile(&user_id)? else {
                panic!("restored database should contain the profile");
            };
            assert_eq!(profile.points, 10);
        }

        cleanup_sqlite(&db_path)?;
        cleanup_sqlite(&backup_path)?;
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = memory_store()?;
        submit(&mut store, &fixture_user("member-12"), &chapter("gen-1"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.ledger_mismatches.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn concurrent_duplicate_submissions_credit_once() -> Result<()> {
        let db_path = unique_temp_db_path("concurrency");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let threads = 6;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<u64> {
                let mut store = SqliteStore::open(&path)?;
                let user_id = fixture_user("double-tap");
                let claim = chapter("gen-1");
                loop {
                    match store.submit_activity(
                        &user_id,
                        &claim,
                        &ProgressionRules::default(),
                        fixture_time(),
                    ) {
                        Ok(summary) => return Ok(summary.points_awarded),
                        Err(err) if err.is_retry_safe() && matches!(err, StoreError::Conflict { .. }) => {}
                        Err(err) => return Err(anyhow!(err)),
                    }
                }
            }));
        }

        let mut total_awarded = 0;
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            total_awarded += result?;
        }
        assert_eq!(total_awarded, 10);

        let store = SqliteStore::open(&db_path)?;
        let Some(profile) = store.get_profile(&fixture_user("double-tap"))? else {
            panic!("profile should exist");
        };
        assert_eq!(profile.points, 10);
        assert_eq!(profile.credited.len(), 1);

        drop(store);
        cleanup_sqlite(&db_path)?;
        Ok(())
    }
}
