use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, Criterion};
use jornada_core::{
    apply_activity, ActivityClaim, ActivityPayload, ChapterReadMetadata, Profile, ProgressionRules,
    QuizCompletedMetadata, UserId,
};
use time::OffsetDateTime;

fn bench_user() -> UserId {
    match UserId::parse("bench-member") {
        Ok(user_id) => user_id,
        Err(err) => panic!("bench user id should parse: {err}"),
    }
}

fn mk_chapter(index: usize) -> ActivityClaim {
    ActivityClaim {
        activity_ref: format!("chapter-{index}"),
        activity: ActivityPayload::ChapterRead(ChapterReadMetadata {
            book: Some("Salmos".to_string()),
            chapter: u16::try_from(index % 150).ok(),
        }),
    }
}

fn seasoned_profile(rules: &ProgressionRules) -> Profile {
    let mut profile = Profile::new(bench_user());
    for index in 0..1_000 {
        match apply_activity(&profile, &mk_chapter(index), rules, OffsetDateTime::UNIX_EPOCH) {
            Ok(outcome) => profile = outcome.profile,
            Err(err) => panic!("seeding benchmark profile failed: {err}"),
        }
    }
    profile
}

fn bench_chapter_award(c: &mut Criterion) {
    let rules = ProgressionRules::default();
    let profile = seasoned_profile(&rules);
    let fresh = mk_chapter(5_000);
    let duplicate = mk_chapter(10);

    c.bench_function("chapter_award_1000_credited", |b| {
        b.iter(|| {
            if let Err(err) = apply_activity(&profile, &fresh, &rules, OffsetDateTime::UNIX_EPOCH)
            {
                panic!("chapter benchmark award failed: {err}");
            }
        });
    });

    c.bench_function("chapter_duplicate_1000_credited", |b| {
        b.iter(|| {
            if let Err(err) =
                apply_activity(&profile, &duplicate, &rules, OffsetDateTime::UNIX_EPOCH)
            {
                panic!("duplicate benchmark award failed: {err}");
            }
        });
    });
}

fn bench_quiz_award(c: &mut Criterion) {
    let rules = ProgressionRules::default();
    let profile = Profile::new(bench_user());
    let answer_key = (0..50)
        .map(|index| (format!("q{index}"), "a".to_string()))
        .collect::<BTreeMap<_, _>>();
    let claim = ActivityClaim {
        activity_ref: "quiz-bench".to_string(),
        activity: ActivityPayload::QuizCompleted(QuizCompletedMetadata {
            answers: answer_key.clone(),
            answer_key: Some(answer_key),
        }),
    };

    c.bench_function("quiz_award_50_questions", |b| {
        b.iter(|| {
            if let Err(err) = apply_activity(&profile, &claim, &rules, OffsetDateTime::UNIX_EPOCH) {
                panic!("quiz benchmark award failed: {err}");
            }
        });
    });
}

criterion_group!(award_benches, bench_chapter_award, bench_quiz_award);
criterion_main!(award_benches);
