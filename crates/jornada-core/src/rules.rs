use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ActivityType, BadgeId, Level, ProgressionError, QuizScore};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WeightTable {
    pub chapter_read: u64,
    pub quiz_per_correct: u64,
    pub course_completed: u64,
    pub donation_completed: u64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self { chapter_read: 10, quiz_per_correct: 5, course_completed: 50, donation_completed: 20 }
    }
}

impl WeightTable {
    /// Points earned by one credited activity. Quizzes pay per correct answer;
    /// a quiz without a score earns nothing.
    #[must_use]
    pub fn points_for(&self, activity_type: ActivityType, quiz_score: Option<&QuizScore>) -> u64 {
        match activity_type {
            ActivityType::ChapterRead => self.chapter_read,
            ActivityType::QuizCompleted => quiz_score.map_or(0, |score| {
                u64::from(score.correct_count).saturating_mul(self.quiz_per_correct)
            }),
            ActivityType::CourseCompleted => self.course_completed,
            ActivityType::DonationCompleted => self.donation_completed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelTier {
    pub level: Level,
    pub threshold: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BadgeCriterion {
    /// Number of credited activities of the badge's type reaches `threshold`.
    Completions { threshold: u32 },
    /// Current reading streak reaches `days`.
    ReadingStreak { days: u32 },
    /// The submitted quiz was answered without mistakes.
    PerfectScore,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BadgeDefinition {
    pub id: BadgeId,
    pub name: String,
    pub description: String,
    pub activity_type: ActivityType,
    pub criterion: BadgeCriterion,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressionRules {
    #[serde(default)]
    pub weights: WeightTable,
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelTier>,
    #[serde(default = "default_badges")]
    pub badges: Vec<BadgeDefinition>,
}

impl Default for ProgressionRules {
    fn default() -> Self {
        Self { weights: WeightTable::default(), levels: default_levels(), badges: default_badges() }
    }
}

#[must_use]
pub fn default_levels() -> Vec<LevelTier> {
    vec![
        LevelTier { level: Level::Aprendiz, threshold: 0 },
        LevelTier { level: Level::Discipulo, threshold: 100 },
        LevelTier { level: Level::Servo, threshold: 250 },
        LevelTier { level: Level::Obreiro, threshold: 500 },
        LevelTier { level: Level::Lider, threshold: 1_000 },
        LevelTier { level: Level::Mestre, threshold: 2_000 },
    ]
}

fn badge(
    id: &str,
    name: &str,
    description: &str,
    activity_type: ActivityType,
    criterion: BadgeCriterion,
) -> BadgeDefinition {
    BadgeDefinition {
        id: BadgeId::new(id),
        name: name.to_string(),
        description: description.to_string(),
        activity_type,
        criterion,
    }
}

#[must_use]
pub fn default_badges() -> Vec<BadgeDefinition> {
    vec![
        badge(
            "first_chapter",
            "Primeiro Passo",
            "Leu o primeiro capítulo da jornada",
            ActivityType::ChapterRead,
            BadgeCriterion::Completions { threshold: 1 },
        ),
        badge(
            "reader_50",
            "Leitor Dedicado",
            "Leu 50 capítulos",
            ActivityType::ChapterRead,
            BadgeCriterion::Completions { threshold: 50 },
        ),
        badge(
            "streak_7",
            "Constância",
            "Leu pelo menos um capítulo por dia durante 7 dias seguidos",
            ActivityType::ChapterRead,
            BadgeCriterion::ReadingStreak { days: 7 },
        ),
        badge(
            "quiz_perfect",
            "Nota Máxima",
            "Acertou todas as perguntas de um quiz",
            ActivityType::QuizCompleted,
            BadgeCriterion::PerfectScore,
        ),
        badge(
            "course_finisher",
            "Concluinte",
            "Concluiu um curso",
            ActivityType::CourseCompleted,
            BadgeCriterion::Completions { threshold: 1 },
        ),
        badge(
            "first_donation",
            "Coração Generoso",
            "Concluiu a primeira doação",
            ActivityType::DonationCompleted,
            BadgeCriterion::Completions { threshold: 1 },
        ),
    ]
}

impl ProgressionRules {
    /// Parse and validate rules from a YAML document. Omitted sections fall
    /// back to the built-in defaults.
    ///
    /// # Errors
    /// Returns [`ProgressionError::Rules`] when the document does not parse or
    /// violates the invariants checked by [`ProgressionRules::validate`].
    pub fn from_yaml_str(raw: &str) -> Result<Self, ProgressionError> {
        let rules: Self = serde_yaml::from_str(raw)
            .map_err(|err| ProgressionError::Rules(format!("invalid rules document: {err}")))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check level and badge tables.
    ///
    /// # Errors
    /// Returns [`ProgressionError::Rules`] when the level table does not start at
    /// `aprendiz` with threshold 0, tiers are not strictly ascending, badge ids
    /// repeat or are blank, or a badge threshold is zero.
    pub fn validate(&self) -> Result<(), ProgressionError> {
        let Some(first) = self.levels.first() else {
            return Err(ProgressionError::Rules("levels MUST contain at least one tier".into()));
        };
        if first.level != Level::Aprendiz || first.threshold != 0 {
            return Err(ProgressionError::Rules(
                "first level tier MUST be aprendiz with threshold 0".into(),
            ));
        }

        for pair in self.levels.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if upper.level <= lower.level || upper.threshold <= lower.threshold {
                return Err(ProgressionError::Rules(format!(
                    "level tiers MUST be strictly ascending: {} ({}) then {} ({})",
                    lower.level.as_str(),
                    lower.threshold,
                    upper.level.as_str(),
                    upper.threshold
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for badge in &self.badges {
            if badge.id.as_str().trim().is_empty() {
                return Err(ProgressionError::Rules("badge id MUST be non-empty".into()));
            }
            if !seen.insert(badge.id.as_str()) {
                return Err(ProgressionError::Rules(format!("duplicate badge id: {}", badge.id)));
            }
            match badge.criterion {
                BadgeCriterion::Completions { threshold: 0 }
                | BadgeCriterion::ReadingStreak { days: 0 } => {
                    return Err(ProgressionError::Rules(format!(
                        "badge {} MUST have a positive threshold",
                        badge.id
                    )));
                }
                BadgeCriterion::ReadingStreak { .. }
                    if badge.activity_type != ActivityType::ChapterRead =>
                {
                    return Err(ProgressionError::Rules(format!(
                        "badge {} uses a reading streak but is not bound to chapter_read",
                        badge.id
                    )));
                }
                BadgeCriterion::PerfectScore
                    if badge.activity_type != ActivityType::QuizCompleted =>
                {
                    return Err(ProgressionError::Rules(format!(
                        "badge {} uses perfect_score but is not bound to quiz_completed",
                        badge.id
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Highest tier whose threshold is reached by `points`.
    #[must_use]
    pub fn level_for(&self, points: u64) -> Level {
        self.levels
            .iter()
            .take_while(|tier| tier.threshold <= points)
            .last()
            .map_or(Level::Aprendiz, |tier| tier.level)
    }

    #[must_use]
    pub fn next_tier(&self, level: Level) -> Option<&LevelTier> {
        self.levels.iter().find(|tier| tier.level > level)
    }

    #[must_use]
    pub fn badge(&self, id: &BadgeId) -> Option<&BadgeDefinition> {
        self.badges.iter().find(|badge| &badge.id == id)
    }
}
