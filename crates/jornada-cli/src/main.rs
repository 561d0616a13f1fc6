use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use jornada_api::{
    load_rules, AdjustPointsRequest, ProgressionApi, RegisterQuizRequest, ScoreQuizRequest,
    DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_SUBMIT_ATTEMPTS,
};
use jornada_core::{ActivityClaim, ActivityPayload, ActivityType, AnswerKey, QuizAnswers, UserId};
use jornada_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "jr")]
#[command(about = "Jornada progression CLI")]
struct Cli {
    #[arg(long, env = "JORNADA_DB", default_value = "./jornada.sqlite3")]
    db: PathBuf,

    /// YAML file overriding weights, level thresholds, and badges.
    #[arg(long, env = "JORNADA_RULES")]
    rules: Option<PathBuf>,

    /// Attempts per activity submission before a write conflict is returned.
    #[arg(long, env = "JORNADA_MAX_SUBMIT_ATTEMPTS", default_value_t = DEFAULT_MAX_SUBMIT_ATTEMPTS)]
    max_submit_attempts: u32,

    /// Milliseconds a write waits on another writer before it counts as a conflict.
    #[arg(long, env = "JORNADA_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    #[command(flatten)]
    Progression(ProgressionCommand),
}

/// Commands served through the progression facade.
#[derive(Debug, Subcommand)]
enum ProgressionCommand {
    Activity {
        #[command(subcommand)]
        command: ActivityCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Quiz {
        #[command(subcommand)]
        command: QuizCommand,
    },
    /// List the configured badge catalogue.
    Badges,
    Leaderboard(LeaderboardArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ActivityCommand {
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "type")]
    activity_type: ActivityTypeArg,
    #[arg(long = "ref")]
    activity_ref: String,
    /// Activity metadata as a JSON object.
    #[arg(long)]
    metadata: Option<String>,
    /// RFC3339 time of the activity; defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Show(UserArgs),
    Activities(UserArgs),
    Adjust(AdjustArgs),
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct AdjustArgs {
    #[arg(long)]
    user: String,
    #[arg(long, allow_hyphen_values = true)]
    delta: i64,
    #[arg(long)]
    writer: String,
    #[arg(long)]
    justification: String,
}

#[derive(Debug, Subcommand)]
enum QuizCommand {
    Register(QuizRegisterArgs),
    Score(QuizScoreArgs),
}

#[derive(Debug, Args)]
struct QuizRegisterArgs {
    #[arg(long = "ref")]
    quiz_ref: String,
    /// Answer key as a JSON object of question id to choice.
    #[arg(long)]
    key: String,
    #[arg(long)]
    writer: String,
}

#[derive(Debug, Args)]
struct QuizScoreArgs {
    /// Answers as a JSON object of question id to choice.
    #[arg(long)]
    answers: String,
    #[arg(long)]
    key: Option<String>,
    #[arg(long = "ref")]
    quiz_ref: Option<String>,
}

#[derive(Debug, Args)]
struct LeaderboardArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActivityTypeArg {
    ChapterRead,
    QuizCompleted,
    CourseCompleted,
    DonationCompleted,
}

impl ActivityTypeArg {
    fn into_activity_type(self) -> ActivityType {
        match self {
            Self::ChapterRead => ActivityType::ChapterRead,
            Self::QuizCompleted => ActivityType::QuizCompleted,
            Self::CourseCompleted => ActivityType::CourseCompleted,
            Self::DonationCompleted => ActivityType::DonationCompleted,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_serialized<T: serde::Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.set_busy_timeout(Duration::from_millis(cli.busy_timeout_ms))?;
            run_db(command, &mut store)
        }
        Command::Progression(command) => {
            let rules = load_rules(cli.rules.as_deref())?;
            let api = ProgressionApi::new(cli.db, rules)
                .with_max_submit_attempts(cli.max_submit_attempts)
                .with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
            run_progression(command, &api)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_serialized(&report, "integrity report")
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_progression(command: ProgressionCommand, api: &ProgressionApi) -> Result<()> {
    match command {
        ProgressionCommand::Activity { command: ActivityCommand::Submit(args) } => {
            let user_id = parse_user(&args.user)?;
            let claim = build_claim(&args)?;
            let at = args.at.as_deref().map(parse_rfc3339).transpose()?;
            let summary = match at {
                Some(at) => api.submit_activity_at(&user_id, &claim, at)?,
                None => api.submit_activity(&user_id, &claim)?,
            };
            emit_serialized(&summary, "award summary")
        }
        ProgressionCommand::Profile { command } => match command {
            ProfileCommand::Show(args) => {
                let view = api.get_profile(&parse_user(&args.user)?)?;
                emit_serialized(&view, "profile")
            }
            ProfileCommand::Activities(args) => {
                let activities = api.list_activities(&parse_user(&args.user)?)?;
                emit_json(serde_json::json!({ "activities": activities }))
            }
            ProfileCommand::Adjust(args) => {
                let adjustment = api.adjust_points(
                    &parse_user(&args.user)?,
                    &AdjustPointsRequest {
                        delta: args.delta,
                        writer: args.writer,
                        justification: args.justification,
                    },
                )?;
                emit_serialized(&adjustment, "adjustment")
            }
        },
        ProgressionCommand::Quiz { command } => match command {
            QuizCommand::Register(args) => {
                let result = api.register_quiz(&RegisterQuizRequest {
                    quiz_ref: args.quiz_ref,
                    answer_key: parse_choice_map::<AnswerKey>("--key", &args.key)?,
                    writer: args.writer,
                })?;
                emit_serialized(&result, "quiz registration")
            }
            QuizCommand::Score(args) => {
                let score = api.score_quiz(&ScoreQuizRequest {
                    answers: parse_choice_map::<QuizAnswers>("--answers", &args.answers)?,
                    answer_key: args
                        .key
                        .as_deref()
                        .map(|raw| parse_choice_map::<AnswerKey>("--key", raw))
                        .transpose()?,
                    quiz_ref: args.quiz_ref,
                })?;
                emit_serialized(&score, "quiz score")
            }
        },
        ProgressionCommand::Badges => emit_json(serde_json::json!({ "badges": api.list_badges() })),
        ProgressionCommand::Leaderboard(args) => {
            let entries = api.leaderboard(args.limit)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn build_claim(args: &SubmitArgs) -> Result<ActivityClaim> {
    let metadata = match args.metadata.as_deref() {
        Some(raw) => serde_json::from_str::<Value>(raw).context("--metadata MUST be valid JSON")?,
        None => serde_json::json!({}),
    };
    let activity = ActivityPayload::from_json(serde_json::json!({
        "activity_type": args.activity_type.into_activity_type().as_str(),
        "metadata": metadata
    }))?;
    Ok(ActivityClaim { activity_ref: args.activity_ref.clone(), activity })
}

fn parse_user(raw: &str) -> Result<UserId> {
    Ok(UserId::parse(raw)?)
}

fn parse_choice_map<T: serde::de::DeserializeOwned>(flag: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .with_context(|| format!("{flag} MUST be a JSON object of question id to choice"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
