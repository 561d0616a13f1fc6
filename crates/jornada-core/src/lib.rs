use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod quiz;
mod rules;

pub use quiz::{score_quiz, AnswerKey, QuizAnswers, QuizScore};
pub use rules::{
    default_badges, default_levels, BadgeCriterion, BadgeDefinition, LevelTier, ProgressionRules,
    WeightTable,
};

const MAX_IDENTIFIER_LEN: usize = 200;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown activity_type: {0}")]
    UnknownActivityType(String),
    #[error("rules error: {0}")]
    Rules(String),
}

fn check_identifier(field: &str, value: &str) -> Result<(), ProgressionError> {
    if value.trim().is_empty() {
        return Err(ProgressionError::Validation(format!("{field} MUST be non-empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ProgressionError::Validation(format!(
            "{field} MUST be at most {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    Ok(())
}

/// Opaque identity of a member, taken from the caller's authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Build a user id from untrusted input.
    ///
    /// # Errors
    /// Returns [`ProgressionError::Validation`] when the value is blank or too long.
    pub fn parse(raw: &str) -> Result<Self, ProgressionError> {
        let trimmed = raw.trim();
        check_identifier("user_id", trimmed)?;
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ProgressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BadgeId(String);

impl BadgeId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BadgeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActivityId(pub Ulid);

impl ActivityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ChapterRead,
    QuizCompleted,
    CourseCompleted,
    DonationCompleted,
}

impl ActivityType {
    pub const ALL: [Self; 4] =
        [Self::ChapterRead, Self::QuizCompleted, Self::CourseCompleted, Self::DonationCompleted];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChapterRead => "chapter_read",
            Self::QuizCompleted => "quiz_completed",
            Self::CourseCompleted => "course_completed",
            Self::DonationCompleted => "donation_completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chapter_read" => Some(Self::ChapterRead),
            "quiz_completed" => Some(Self::QuizCompleted),
            "course_completed" => Some(Self::CourseCompleted),
            "donation_completed" => Some(Self::DonationCompleted),
            _ => None,
        }
    }
}

/// Progression tiers, lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Aprendiz,
    Discipulo,
    Servo,
    Obreiro,
    Lider,
    Mestre,
}

impl Level {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Aprendiz => 1,
            Self::Discipulo => 2,
            Self::Servo => 3,
            Self::Obreiro => 4,
            Self::Lider => 5,
            Self::Mestre => 6,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aprendiz => "aprendiz",
            Self::Discipulo => "discipulo",
            Self::Servo => "servo",
            Self::Obreiro => "obreiro",
            Self::Lider => "lider",
            Self::Mestre => "mestre",
        }
    }

    /// Display title shown to members.
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Aprendiz => "Aprendiz",
            Self::Discipulo => "Discípulo",
            Self::Servo => "Servo",
            Self::Obreiro => "Obreiro",
            Self::Lider => "Líder",
            Self::Mestre => "Mestre",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aprendiz" => Some(Self::Aprendiz),
            "discipulo" => Some(Self::Discipulo),
            "servo" => Some(Self::Servo),
            "obreiro" => Some(Self::Obreiro),
            "lider" => Some(Self::Lider),
            "mestre" => Some(Self::Mestre),
            _ => None,
        }
    }
}

/// Ledger identity of one credited activity: the type it was credited under
/// and its reference. Only the reference takes part in idempotency.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CreditKey {
    pub activity_type: ActivityType,
    pub activity_ref: String,
}

impl Display for CreditKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.activity_type.as_str(), self.activity_ref)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChapterReadMetadata {
    #[serde(default)]
    pub book: Option<String>,
    #[serde(default)]
    pub chapter: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuizCompletedMetadata {
    pub answers: QuizAnswers,
    #[serde(default)]
    pub answer_key: Option<AnswerKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CourseCompletedMetadata {
    #[serde(default)]
    pub course_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DonationCompletedMetadata {
    #[serde(default)]
    pub amount_cents: Option<u64>,
    #[serde(default)]
    pub campaign: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "activity_type", content = "metadata", rename_all = "snake_case")]
pub enum ActivityPayload {
    ChapterRead(ChapterReadMetadata),
    QuizCompleted(QuizCompletedMetadata),
    CourseCompleted(CourseCompletedMetadata),
    DonationCompleted(DonationCompletedMetadata),
}

impl ActivityPayload {
    #[must_use]
    pub fn activity_type(&self) -> ActivityType {
        match self {
            Self::ChapterRead(_) => ActivityType::ChapterRead,
            Self::QuizCompleted(_) => ActivityType::QuizCompleted,
            Self::CourseCompleted(_) => ActivityType::CourseCompleted,
            Self::DonationCompleted(_) => ActivityType::DonationCompleted,
        }
    }

    /// Parse a payload from loosely shaped JSON, reporting an unknown
    /// `activity_type` separately from malformed metadata.
    ///
    /// # Errors
    /// Returns [`ProgressionError::UnknownActivityType`] or
    /// [`ProgressionError::Validation`].
    pub fn from_json(mut value: serde_json::Value) -> Result<Self, ProgressionError> {
        let Some(raw_type) = value.get("activity_type").and_then(serde_json::Value::as_str) else {
            return Err(ProgressionError::Validation("activity_type MUST be provided".into()));
        };
        if ActivityType::parse(raw_type).is_none() {
            return Err(ProgressionError::UnknownActivityType(raw_type.to_string()));
        }
        // Absent and null metadata both mean "no metadata".
        if let Some(object) = value.as_object_mut() {
            let metadata = object.entry("metadata").or_insert(serde_json::Value::Null);
            if metadata.is_null() {
                *metadata = serde_json::Value::Object(serde_json::Map::new());
            }
        }
        serde_json::from_value(value)
            .map_err(|err| ProgressionError::Validation(format!("invalid activity metadata: {err}")))
    }
}

/// One claimed activity: the idempotency reference plus typed metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActivityClaim {
    pub activity_ref: String,
    pub activity: ActivityPayload,
}

impl ActivityClaim {
    #[must_use]
    pub fn activity_type(&self) -> ActivityType {
        self.activity.activity_type()
    }

    #[must_use]
    pub fn credit_key(&self) -> CreditKey {
        CreditKey {
            activity_type: self.activity_type(),
            activity_ref: self.activity_ref.trim().to_string(),
        }
    }

    /// Check the claim shape before any state is read.
    ///
    /// # Errors
    /// Returns [`ProgressionError::Validation`] when the reference is blank or
    /// too long, or a quiz carries no answers or an empty inline key.
    pub fn validate(&self) -> Result<(), ProgressionError> {
        check_identifier("activity_ref", &self.activity_ref)?;

        if let ActivityPayload::QuizCompleted(quiz) = &self.activity {
            if quiz.answers.is_empty() {
                return Err(ProgressionError::Validation(
                    "quiz_completed MUST include at least one answer".into(),
                ));
            }
            if quiz.answer_key.as_ref().is_some_and(std::collections::BTreeMap::is_empty) {
                return Err(ProgressionError::Validation(
                    "quiz answer_key MUST contain at least one question".into(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReadingStreak {
    pub current_days: u32,
    pub longest_days: u32,
    #[serde(default, with = "iso_date::option")]
    pub last_reading_date: Option<Date>,
}

impl ReadingStreak {
    /// Register a reading on `day`. Same-day and out-of-order readings leave the
    /// streak unchanged; a gap of more than one day restarts it.
    pub fn record(&mut self, day: Date) {
        match self.last_reading_date {
            Some(last) if day <= last => return,
            Some(last) if last.next_day() == Some(day) => {
                self.current_days = self.current_days.saturating_add(1);
            }
            _ => self.current_days = 1,
        }
        self.last_reading_date = Some(day);
        self.longest_days = self.longest_days.max(self.current_days);
    }

    /// Streak length as seen on `today`: zero once a full day has been missed.
    #[must_use]
    pub fn active_days(&self, today: Date) -> u32 {
        match self.last_reading_date {
            Some(last) if last == today || last.next_day() == Some(today) => self.current_days,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: UserId,
    pub points: u64,
    pub level: Level,
    /// Credited references mapped to the type they were credited under.
    #[serde(default)]
    pub credited: BTreeMap<String, ActivityType>,
    #[serde(default)]
    pub badges: BTreeSet<BadgeId>,
    #[serde(default)]
    pub streak: ReadingStreak,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_activity_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub revision: u64,
}

impl Profile {
    /// Zero-state profile used on first contact.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            points: 0,
            level: Level::Aprendiz,
            credited: BTreeMap::new(),
            badges: BTreeSet::new(),
            streak: ReadingStreak::default(),
            last_activity_at: None,
            revision: 0,
        }
    }

    #[must_use]
    pub fn is_credited(&self, activity_ref: &str) -> bool {
        self.credited.contains_key(activity_ref.trim())
    }

    #[must_use]
    pub fn completions(&self, activity_type: ActivityType) -> usize {
        self.credited.values().filter(|credited| **credited == activity_type).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwardedBadge {
    pub id: BadgeId,
    pub name: String,
    pub description: String,
}

impl From<&BadgeDefinition> for AwardedBadge {
    fn from(value: &BadgeDefinition) -> Self {
        Self { id: value.id.clone(), name: value.name.clone(), description: value.description.clone() }
    }
}

/// Result of one submission, returned to the caller for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardSummary {
    pub user_id: UserId,
    pub activity_type: ActivityType,
    pub activity_ref: String,
    pub already_credited: bool,
    pub points_awarded: u64,
    pub new_total: u64,
    pub previous_level: Level,
    pub new_level: Level,
    pub leveled_up: bool,
    pub badges_awarded: Vec<AwardedBadge>,
    pub quiz_score: Option<QuizScore>,
    pub streak: ReadingStreak,
}

/// Ledger row for one credited activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditedActivity {
    pub activity_id: ActivityId,
    pub user_id: UserId,
    pub key: CreditKey,
    pub points_awarded: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub credited_at: OffsetDateTime,
    pub payload: ActivityPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOutcome {
    pub profile: Profile,
    pub summary: AwardSummary,
    /// `None` when the claim was already credited and nothing changed.
    pub credited: Option<CreditedActivity>,
}

/// Badges whose condition names `activity_type`, are satisfied by `profile`,
/// and are not already held.
#[must_use]
pub fn award_badges<'a>(
    profile: &Profile,
    activity_type: ActivityType,
    quiz_score: Option<&QuizScore>,
    rules: &'a ProgressionRules,
) -> Vec<&'a BadgeDefinition> {
    rules
        .badges
        .iter()
        .filter(|badge| badge.activity_type == activity_type)
        .filter(|badge| !profile.badges.contains(&badge.id))
        .filter(|badge| match badge.criterion {
            BadgeCriterion::Completions { threshold } => {
                profile.completions(activity_type) >= usize::try_from(threshold).unwrap_or(usize::MAX)
            }
            BadgeCriterion::ReadingStreak { days } => profile.streak.current_days >= days,
            BadgeCriterion::PerfectScore => quiz_score.is_some_and(QuizScore::is_perfect),
        })
        .collect()
}

/// Apply one claim to a profile snapshot.
///
/// Pure: the caller persists `outcome.profile` and `outcome.credited`
/// atomically. A claim whose `activity_ref` is already credited, under any
/// activity type, yields a zero award and an unchanged profile.
///
/// # Errors
/// Returns [`ProgressionError::Validation`] when the claim is malformed or a
/// quiz has no answer key.
pub fn apply_activity(
    profile: &Profile,
    claim: &ActivityClaim,
    rules: &ProgressionRules,
    at: OffsetDateTime,
) -> Result<ActivityOutcome, ProgressionError> {
    claim.validate()?;
    let key = claim.credit_key();
    let activity_type = claim.activity_type();

    if profile.is_credited(&key.activity_ref) {
        return Ok(ActivityOutcome {
            profile: profile.clone(),
            summary: AwardSummary {
                user_id: profile.user_id.clone(),
                activity_type,
                activity_ref: key.activity_ref,
                already_credited: true,
                points_awarded: 0,
                new_total: profile.points,
                previous_level: profile.level,
                new_level: profile.level,
                leveled_up: false,
                badges_awarded: Vec::new(),
                quiz_score: None,
                streak: profile.streak,
            },
            credited: None,
        });
    }

    let quiz_score = match &claim.activity {
        ActivityPayload::QuizCompleted(quiz) => {
            let Some(answer_key) = quiz.answer_key.as_ref() else {
                return Err(ProgressionError::Validation(format!(
                    "no answer key available for quiz {}",
                    key.activity_ref
                )));
            };
            Some(score_quiz(&quiz.answers, answer_key))
        }
        _ => None,
    };

    let points_awarded = rules.weights.points_for(activity_type, quiz_score.as_ref());
    let previous_level = profile.level;

    let mut next = profile.clone();
    next.credited.insert(key.activity_ref.clone(), activity_type);
    next.points = next.points.saturating_add(points_awarded);
    next.level = rules.level_for(next.points);
    if activity_type == ActivityType::ChapterRead {
        next.streak.record(at.to_offset(UtcOffset::UTC).date());
    }
    next.last_activity_at = Some(at);

    let badges_awarded = award_badges(&next, activity_type, quiz_score.as_ref(), rules)
        .into_iter()
        .map(AwardedBadge::from)
        .collect::<Vec<_>>();
    for badge in &badges_awarded {
        next.badges.insert(badge.id.clone());
    }

    let summary = AwardSummary {
        user_id: next.user_id.clone(),
        activity_type,
        activity_ref: key.activity_ref.clone(),
        already_credited: false,
        points_awarded,
        new_total: next.points,
        previous_level,
        new_level: next.level,
        leveled_up: next.level > previous_level,
        badges_awarded,
        quiz_score,
        streak: next.streak,
    };

    let credited = CreditedActivity {
        activity_id: ActivityId::new(),
        user_id: next.user_id.clone(),
        key,
        points_awarded,
        credited_at: at,
        payload: claim.activity.clone(),
    };

    Ok(ActivityOutcome { profile: next, summary, credited: Some(credited) })
}

/// Apply an administrative point correction. The result never drops below
/// zero; credited activities and badges are untouched.
#[must_use]
pub fn apply_adjustment(profile: &Profile, delta: i64, rules: &ProgressionRules) -> Profile {
    let mut next = profile.clone();
    next.points = if delta >= 0 {
        next.points.saturating_add(delta.unsigned_abs())
    } else {
        next.points.saturating_sub(delta.unsigned_abs())
    };
    next.level = rules.level_for(next.points);
    next
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_user(raw: &str) -> UserId {
        match UserId::parse(raw) {
            Ok(user_id) => user_id,
            Err(err) => panic!("invalid fixture user id {raw}: {err}"),
        }
    }

    fn chapter(reference: &str) -> ActivityClaim {
        ActivityClaim {
            activity_ref: reference.to_string(),
            activity: ActivityPayload::ChapterRead(ChapterReadMetadata::default()),
        }
    }

    fn course(reference: &str) -> ActivityClaim {
        ActivityClaim {
            activity_ref: reference.to_string(),
            activity: ActivityPayload::CourseCompleted(CourseCompletedMetadata {
                course_name: Some("Fundamentos".to_string()),
            }),
        }
    }

    fn quiz(reference: &str, correct: usize, total: usize) -> ActivityClaim {
        let answer_key = (0..total)
            .map(|index| (format!("q{index}"), "a".to_string()))
            .collect::<BTreeMap<_, _>>();
        let answers = (0..total)
            .map(|index| {
                let choice = if index < correct { "a" } else { "b" };
                (format!("q{index}"), choice.to_string())
            })
            .collect::<BTreeMap<_, _>>();
        ActivityClaim {
            activity_ref: reference.to_string(),
            activity: ActivityPayload::QuizCompleted(QuizCompletedMetadata {
                answers,
                answer_key: Some(answer_key),
            }),
        }
    }

    fn apply(profile: &Profile, claim: &ActivityClaim, at: OffsetDateTime) -> ActivityOutcome {
        match apply_activity(profile, claim, &ProgressionRules::default(), at) {
            Ok(outcome) => outcome,
            Err(err) => panic!("claim should apply: {err}"),
        }
    }

    fn badge_ids(summary: &AwardSummary) -> Vec<&str> {
        summary.badges_awarded.iter().map(|badge| badge.id.as_str()).collect()
    }

    #[test]
    fn chapter_duplicate_and_quiz_scenario() {
        let start = Profile::new(fixture_user("member-1"));

        let first = apply(&start, &chapter("gen-1"), fixture_time());
        assert_eq!(first.summary.points_awarded, 10);
        assert_eq!(first.summary.new_total, 10);
        assert!(!first.summary.leveled_up);
        assert_eq!(first.summary.new_level, Level::Aprendiz);

        let duplicate = apply(&first.profile, &chapter("gen-1"), fixture_time());
        assert!(duplicate.summary.already_credited);
        assert_eq!(duplicate.summary.points_awarded, 0);
        assert_eq!(duplicate.summary.new_total, 10);
        assert!(duplicate.credited.is_none());
        assert_eq!(duplicate.profile, first.profile);

        let scored = apply(&duplicate.profile, &quiz("quiz-genesis", 8, 10), fixture_time());
        assert_eq!(scored.summary.points_awarded, 40);
        assert_eq!(scored.summary.new_total, 50);
        let Some(score) = scored.summary.quiz_score else {
            panic!("quiz submissions report their score");
        };
        assert_eq!(score.correct_count, 8);
        assert_eq!(score.total_questions, 10);
    }

    #[test]
    fn course_completion_awards_finisher_badge_once() {
        let start = Profile::new(fixture_user("member-2"));

        let first = apply(&start, &course("curso-basico"), fixture_time());
        assert_eq!(badge_ids(&first.summary), vec!["course_finisher"]);

        let repeat = apply(&first.profile, &course("curso-basico"), fixture_time());
        assert!(repeat.summary.badges_awarded.is_empty());

        let another = apply(&repeat.profile, &course("curso-avancado"), fixture_time());
        assert!(another.summary.badges_awarded.is_empty());
        assert_eq!(another.profile.badges.len(), 1);
    }

    #[test]
    fn credited_reference_resubmitted_under_another_type_awards_nothing() {
        let start = Profile::new(fixture_user("member-3"));
        let read = apply(&start, &chapter("gen-1"), fixture_time());
        let resubmitted = apply(&read.profile, &course(" gen-1 "), fixture_time());

        assert!(resubmitted.summary.already_credited);
        assert_eq!(resubmitted.summary.activity_type, ActivityType::CourseCompleted);
        assert_eq!(resubmitted.summary.points_awarded, 0);
        assert_eq!(resubmitted.summary.new_total, 10);
        assert!(resubmitted.summary.badges_awarded.is_empty());
        assert!(resubmitted.credited.is_none());
        assert_eq!(resubmitted.profile, read.profile);
        assert_eq!(
            resubmitted.profile.credited.get("gen-1"),
            Some(&ActivityType::ChapterRead)
        );
        assert_eq!(resubmitted.profile.completions(ActivityType::CourseCompleted), 0);
    }

    #[test]
    fn level_up_is_reported_only_when_threshold_is_crossed() {
        let mut profile = Profile::new(fixture_user("member-4"));
        let mut level_ups = Vec::new();

        for index in 0..12 {
            let outcome = apply(&profile, &chapter(&format!("psa-{index}")), fixture_time());
            if outcome.summary.leveled_up {
                level_ups.push((index, outcome.summary.new_total, outcome.summary.new_level));
            }
            profile = outcome.profile;
        }

        assert_eq!(level_ups, vec![(9, 100, Level::Discipulo)]);
        assert_eq!(profile.points, 120);
    }

    #[test]
    fn quiz_without_answer_key_is_rejected() {
        let mut claim = quiz("quiz-1", 1, 2);
        if let ActivityPayload::QuizCompleted(metadata) = &mut claim.activity {
            metadata.answer_key = None;
        }

        let err = match apply_activity(
            &Profile::new(fixture_user("member-5")),
            &claim,
            &ProgressionRules::default(),
            fixture_time(),
        ) {
            Ok(_) => panic!("quiz without key must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no answer key"));
    }

    #[test]
    fn blank_reference_is_rejected() {
        let result = apply_activity(
            &Profile::new(fixture_user("member-6")),
            &chapter("  "),
            &ProgressionRules::default(),
            fixture_time(),
        );
        assert!(matches!(result, Err(ProgressionError::Validation(_))));
    }

    #[test]
    fn payload_from_json_distinguishes_unknown_types() {
        let unknown = ActivityPayload::from_json(serde_json::json!({
            "activity_type": "sermon_watched",
            "metadata": {}
        }));
        assert_eq!(unknown, Err(ProgressionError::UnknownActivityType("sermon_watched".into())));

        let malformed = ActivityPayload::from_json(serde_json::json!({
            "activity_type": "quiz_completed",
            "metadata": { "answers": 3 }
        }));
        assert!(matches!(malformed, Err(ProgressionError::Validation(_))));

        let parsed = ActivityPayload::from_json(serde_json::json!({
            "activity_type": "donation_completed",
            "metadata": { "amount_cents": 5000 }
        }));
        assert_eq!(
            parsed,
            Ok(ActivityPayload::DonationCompleted(DonationCompletedMetadata {
                amount_cents: Some(5000),
                campaign: None,
            }))
        );
    }

    #[test]
    fn user_id_rejects_blank_values_on_deserialize() {
        let parsed = serde_json::from_str::<UserId>("\"   \"");
        assert!(parsed.is_err());
    }

    #[test]
    fn user_id_length_limit_applies_to_trimmed_value() {
        let at_limit = "m".repeat(MAX_IDENTIFIER_LEN);
        let Ok(padded) = UserId::parse(&format!("  {at_limit}  ")) else {
            panic!("surrounding whitespace does not count toward the limit");
        };
        assert_eq!(padded.as_str(), at_limit);

        let over_limit = format!(" {at_limit}m ");
        assert!(matches!(UserId::parse(&over_limit), Err(ProgressionError::Validation(_))));
    }

    #[test]
    fn payload_from_json_treats_null_metadata_as_absent() {
        let completed = ActivityPayload::from_json(serde_json::json!({
            "activity_type": "course_completed",
            "metadata": null
        }));
        assert_eq!(
            completed,
            Ok(ActivityPayload::CourseCompleted(CourseCompletedMetadata { course_name: None }))
        );

        let read = ActivityPayload::from_json(serde_json::json!({ "activity_type": "chapter_read" }));
        assert_eq!(read, Ok(ActivityPayload::ChapterRead(ChapterReadMetadata::default())));

        let quiz = ActivityPayload::from_json(serde_json::json!({
            "activity_type": "quiz_completed",
            "metadata": null
        }));
        assert!(matches!(quiz, Err(ProgressionError::Validation(_))));
    }

    #[test]
    fn reading_streak_extends_resets_and_ignores_same_day() {
        let day = fixture_time().date();
        let mut streak = ReadingStreak::default();

        streak.record(day);
        streak.record(day);
        assert_eq!(streak.current_days, 1);

        let Some(next) = day.next_day() else { panic!("fixture date has a successor") };
        streak.record(next);
        assert_eq!(streak.current_days, 2);

        streak.record(day);
        assert_eq!(streak.current_days, 2);

        let later = next + Duration::days(3);
        streak.record(later);
        assert_eq!(streak.current_days, 1);
        assert_eq!(streak.longest_days, 2);
        assert_eq!(streak.active_days(later + Duration::days(1)), 1);
        assert_eq!(streak.active_days(later + Duration::days(2)), 0);
    }

    #[test]
    fn seven_day_reading_streak_awards_badge() {
        let mut profile = Profile::new(fixture_user("member-7"));
        let mut awarded_on = Vec::new();

        for day in 0..8 {
            let at = fixture_time() + Duration::days(day);
            let outcome = apply(&profile, &chapter(&format!("jo-{day}")), at);
            if badge_ids(&outcome.summary).contains(&"streak_7") {
                awarded_on.push(day);
            }
            profile = outcome.profile;
        }

        assert_eq!(awarded_on, vec![6]);
        assert_eq!(profile.streak.current_days, 8);
    }

    #[test]
    fn perfect_quiz_awards_badge() {
        let outcome =
            apply(&Profile::new(fixture_user("member-8")), &quiz("quiz-2", 4, 4), fixture_time());
        assert_eq!(badge_ids(&outcome.summary), vec!["quiz_perfect"]);
        assert_eq!(outcome.summary.points_awarded, 20);
    }

    #[test]
    fn adjustment_clamps_at_zero_and_recomputes_level() {
        let rules = ProgressionRules::default();
        let mut profile = Profile::new(fixture_user("member-9"));
        profile = apply_adjustment(&profile, 260, &rules);
        assert_eq!(profile.level, Level::Servo);

        profile = apply_adjustment(&profile, -1_000, &rules);
        assert_eq!(profile.points, 0);
        assert_eq!(profile.level, Level::Aprendiz);
    }

    fn arbitrary_claim() -> impl Strategy<Value = ActivityClaim> {
        prop_oneof![
            (0_u8..20).prop_map(|index| chapter(&format!("chapter-{index}"))),
            (0_u8..5).prop_map(|index| course(&format!("course-{index}"))),
            (0_usize..6).prop_map(|index| quiz(&format!("quiz-{index}"), index, 5)),
        ]
    }

    fn replay(claims: &[ActivityClaim]) -> Profile {
        let mut profile = Profile::new(fixture_user("prop-member"));
        for claim in claims {
            profile = apply(&profile, claim, fixture_time()).profile;
        }
        profile
    }

    proptest! {
        #[test]
        fn property_totals_are_order_independent(claims in prop::collection::vec(arbitrary_claim(), 0..30)) {
            let mut reversed = claims.clone();
            reversed.reverse();

            let forward = replay(&claims);
            let backward = replay(&reversed);

            prop_assert_eq!(forward.points, backward.points);
            prop_assert_eq!(forward.credited, backward.credited);
            prop_assert_eq!(forward.level, backward.level);
            prop_assert_eq!(forward.badges, backward.badges);
        }

        #[test]
        fn property_duplicates_never_change_state(claims in prop::collection::vec(arbitrary_claim(), 1..20)) {
            let once = replay(&claims);
            let mut doubled = claims.clone();
            doubled.extend(claims.iter().cloned());
            let twice = replay(&doubled);

            prop_assert_eq!(once.points, twice.points);
            prop_assert_eq!(once.credited, twice.credited);
            prop_assert_eq!(once.badges, twice.badges);
        }

        #[test]
        fn property_points_equal_sum_of_first_awards(claims in prop::collection::vec(arbitrary_claim(), 0..30)) {
            let rules = ProgressionRules::default();
            let mut profile = Profile::new(fixture_user("prop-member"));
            let mut awarded = 0_u64;
            for claim in &claims {
                let outcome = match apply_activity(&profile, claim, &rules, fixture_time()) {
                    Ok(outcome) => outcome,
                    Err(err) => panic!("claim should apply: {err}"),
                };
                awarded += outcome.summary.points_awarded;
                profile = outcome.profile;
            }
            prop_assert_eq!(profile.points, awarded);
        }
    }
}
