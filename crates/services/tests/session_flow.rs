use std::sync::Arc;
use std::time::Duration;

use reader_core::model::{
    AdvanceStatus, Arm, Assignment, AssignmentId, BlockIndex, BlockSummary, CaseId, DiagnosisId,
    Phase, UserId,
};
use reader_core::time::fixed_now;
use services::{
    Clock, InMemoryStudyApi, ReaderSession, SchedulerError, SessionConfig, SessionError, StudyApi,
};
use storage::repository::Storage;

const USER: UserId = UserId::new(1);

fn session(api: &InMemoryStudyApi, storage: &Storage, config: SessionConfig) -> ReaderSession {
    let remote: Arc<dyn StudyApi> = Arc::new(api.clone());
    ReaderSession::new(USER, Clock::fixed(fixed_now()), remote, storage, config)
}

fn block_of(size: u64, post_done: u64) -> Vec<Assignment> {
    (1..=size)
        .map(|id| Assignment {
            id: AssignmentId::new(id),
            user_id: USER,
            case_id: CaseId::new(id),
            arm: Arm::Human,
            display_order: u32::try_from(id - 1).unwrap(),
            block_index: BlockIndex::new(0),
            started_at: Some(fixed_now()),
            completed_pre_at: Some(fixed_now()),
            completed_post_at: (id <= post_done).then(fixed_now),
        })
        .collect()
}

fn populated(block: BlockIndex) -> BlockSummary {
    BlockSummary {
        top1_accuracy_pre: Some(0.4),
        top1_accuracy_post: Some(0.6),
        top3_accuracy_pre: Some(0.7),
        top3_accuracy_post: Some(0.9),
        delta_top1: Some(0.2),
        delta_top3: Some(0.2),
        ..BlockSummary::placeholder(block)
    }
}

#[tokio::test]
async fn reader_works_through_a_block_and_resumes_from_cache() {
    let storage = Storage::sqlite(
        "sqlite:file:memdb_session_flow?mode=memory&cache=shared",
        "caseProgress",
    )
    .await
    .expect("connect sqlite");
    let api = InMemoryStudyApi::new(USER)
        .with_numbered_cases(4)
        .with_block_size(2);
    let config = SessionConfig::default().with_block_size(2);

    let first = session(&api, &storage, config.clone());
    first.bootstrap().await.expect("bootstrap");
    assert_eq!(first.next_case().map(|c| c.id), Some(CaseId::new(1)));

    let advanced = first.advance().await.expect("advance");
    assert_eq!(advanced.status, AdvanceStatus::Started);
    let case = advanced.assignment.expect("assignment").case_id;

    api.record_assessment(case, Phase::Pre, &[DiagnosisId::new(10)]);
    let pre = first.submit_phase(case, Phase::Pre).await;
    assert!(pre.pre_completed && !pre.post_completed);

    let err = first.start_next_block().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Scheduler(SchedulerError::PreconditionFailed { block }) if block == BlockIndex::new(0)
    ));

    api.record_assessment(case, Phase::Post, &[DiagnosisId::new(10)]);
    first.submit_phase(case, Phase::Post).await;
    let progress = first.block_progress(BlockIndex::new(0));
    assert_eq!((progress.post, progress.total), (1, 2));
    first.shutdown().await;

    let resumed = session(&api, &storage, config);
    resumed.bootstrap().await.expect("bootstrap again");
    let restored = resumed.get_progress(case);
    assert!(restored.pre_completed && restored.post_completed);
    assert_ne!(resumed.next_case().map(|c| c.id), Some(case));
    assert_eq!(
        resumed.block_progress(BlockIndex::new(0)).total,
        2,
        "active block is hydrated after restart"
    );
    resumed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn completing_the_last_post_fetches_the_summary_once() {
    let api = InMemoryStudyApi::new(USER).with_numbered_cases(10);
    api.seed_block(BlockIndex::new(0), block_of(10, 9));
    let storage = Storage::in_memory();
    let config = SessionConfig::default().with_poll_interval(Duration::from_secs(6));
    let session = session(&api, &storage, config);
    session.bootstrap().await.expect("bootstrap");

    let before = session.block_progress(BlockIndex::new(0));
    assert_eq!((before.post, before.total), (9, 10));
    assert!(!session.poller().is_polling(BlockIndex::new(0)));

    api.set_summary(populated(BlockIndex::new(0)));
    api.record_assessment(CaseId::new(10), Phase::Post, &[DiagnosisId::new(100)]);
    session.submit_phase(CaseId::new(10), Phase::Post).await;

    assert!(session.block_progress(BlockIndex::new(0)).is_complete());
    assert!(session.poller().is_polling(BlockIndex::new(0)));
    assert_eq!(api.calls("block_summary"), 0);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(api.calls("block_summary"), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.calls("block_summary"), 1);
    assert!(!session.poller().is_polling(BlockIndex::new(0)));

    let feedback = session
        .block_feedback(BlockIndex::new(0))
        .await
        .expect("feedback");
    assert_eq!(feedback, populated(BlockIndex::new(0)));
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn summary_that_is_not_ready_keeps_polling() {
    let api = InMemoryStudyApi::new(USER).with_numbered_cases(2);
    api.seed_block(BlockIndex::new(0), block_of(2, 1));
    let storage = Storage::in_memory();
    let session = session(&api, &storage, SessionConfig::default());
    session.bootstrap().await.expect("bootstrap");

    api.record_assessment(CaseId::new(2), Phase::Post, &[DiagnosisId::new(20)]);
    session.submit_phase(CaseId::new(2), Phase::Post).await;

    tokio::time::sleep(Duration::from_secs(13)).await;
    assert_eq!(api.calls("block_summary"), 2);
    assert!(session.poller().is_polling(BlockIndex::new(0)));

    api.set_summary(populated(BlockIndex::new(0)));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(api.calls("block_summary"), 3);
    assert!(!session.poller().is_polling(BlockIndex::new(0)));
    assert!(
        session
            .known_summaries()
            .iter()
            .any(|s| s.block_index == BlockIndex::new(0) && s.has_accuracy())
    );
    session.shutdown().await;
}

#[tokio::test]
async fn feedback_falls_back_to_local_accuracy() {
    let api = InMemoryStudyApi::new(USER)
        .with_numbered_cases(2)
        .with_block_size(2);
    let storage = Storage::in_memory();
    let session = session(&api, &storage, SessionConfig::default().with_block_size(2));
    session.bootstrap().await.expect("bootstrap");
    session.start_next_block().await.expect("start block");

    let placeholder = session.block_feedback(BlockIndex::new(0)).await.unwrap();
    assert!(placeholder.is_placeholder());

    // Case 1: right before and after. Case 2: wrong first, second guess after.
    api.record_assessment(CaseId::new(1), Phase::Pre, &[DiagnosisId::new(10)]);
    api.record_assessment(CaseId::new(1), Phase::Post, &[DiagnosisId::new(10)]);
    api.record_assessment(CaseId::new(2), Phase::Pre, &[DiagnosisId::new(99)]);
    api.record_assessment(
        CaseId::new(2),
        Phase::Post,
        &[DiagnosisId::new(99), DiagnosisId::new(20)],
    );
    for case in [CaseId::new(1), CaseId::new(2)] {
        session.submit_phase(case, Phase::Pre).await;
        session.submit_phase(case, Phase::Post).await;
    }
    session.poller().stop_all();

    let local = session.block_feedback(BlockIndex::new(0)).await.unwrap();
    assert_eq!(local.top1_accuracy_pre, Some(0.5));
    assert_eq!(local.top1_accuracy_post, Some(0.5));
    assert_eq!(local.top3_accuracy_post, Some(1.0));
    assert_eq!(local.peer_percentile_top1, None);
    session.shutdown().await;
}

#[tokio::test]
async fn denied_post_reopens_the_block_and_stops_polling() {
    let api = InMemoryStudyApi::new(USER)
        .with_numbered_cases(2)
        .with_block_size(1);
    let storage = Storage::in_memory();
    let session = session(&api, &storage, SessionConfig::default().with_block_size(1));
    session.bootstrap().await.expect("bootstrap");

    let case = session
        .advance()
        .await
        .expect("advance")
        .assignment
        .expect("assignment")
        .case_id;
    let block = BlockIndex::new(0);

    // Nothing recorded server-side, so both optimistic phases get denied.
    let optimistic = session.submit_phase(case, Phase::Post).await;
    assert!(optimistic.post_completed);
    session.tracker().settle().await;

    assert!(!session.get_progress(case).post_completed);
    let progress = session.block_progress(block);
    assert_eq!((progress.pre, progress.post, progress.total), (0, 0, 1));
    assert!(session.scheduler().has_incomplete_block());
    assert!(!session.poller().is_polling(block));

    let err = session.start_next_block().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Scheduler(SchedulerError::PreconditionFailed { block: b }) if b == block
    ));
    assert_eq!(api.calls("start_block"), 0);
    session.shutdown().await;
}
