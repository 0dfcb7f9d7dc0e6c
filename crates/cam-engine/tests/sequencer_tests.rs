//! Sequencer invocation modes, lock exclusivity and failure handling.

use async_trait::async_trait;
use cam_core::prelude::*;
use cam_core::{LockError, LockHandle};
use cam_engine::test_harness::{
    FailureMode, FlakyRelationalStore, InterruptingBlobStore, SlowBlobStore,
};
use cam_engine::{
    BlobStore, MigrationError, MigrationSequencer, MigrationStatus, OrphanReconciler, Progress,
    RelationalStore, SequencerState, StoreError, TreeStore,
};
use cam_test_utils::{address, test_config, TestSystem, TEST_RESOURCE};
use mockall::mock;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Locks {}

    #[async_trait]
    impl LockCoordinator for Locks {
        async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError>;
        async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError>;
        async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
    }
}

fn handle_for(resource: &str) -> LockHandle {
    LockHandle {
        token: format!("{resource}-token"),
        resource: resource.to_string(),
        acquired_at: chrono::Utc::now(),
    }
}

fn sequencer_with_locks(
    system: &TestSystem,
    locks: Arc<dyn LockCoordinator>,
) -> MigrationSequencer {
    let relational: Arc<dyn RelationalStore> = system.relational.clone();
    let tree: Arc<dyn TreeStore> = system.tree.clone();
    let blobs: Arc<dyn BlobStore> = system.blobs.clone();
    MigrationSequencer::standard(
        test_config(),
        locks,
        system.registry_dyn(),
        relational,
        tree,
        blobs,
        Arc::new(system.table.clone()),
        system.shutdown.clone(),
    )
    .unwrap()
}

#[tokio::test]
async fn busy_lock_bypasses_scheduled_tick() {
    let system = TestSystem::new();
    system.seed_relational(0..250);
    let _held = system.lock().await;
    let sequencer = system.sequencer(test_config());

    let status = sequencer.run(InvocationMode::ScheduledTick).await;
    assert_eq!(
        status,
        MigrationStatus::Bypassed {
            resource: TEST_RESOURCE.to_string()
        }
    );
    assert_eq!(sequencer.state(), SequencerState::Waiting);
    assert!(system.registry.snapshot().is_empty());
    assert_eq!(system.relational.legacy_count(), 250);
}

#[tokio::test]
async fn busy_lock_is_fatal_for_one_shot() {
    let system = TestSystem::new();
    let _held = system.lock().await;
    let sequencer = system.sequencer(test_config());

    let status = sequencer.run(InvocationMode::OneShot).await;
    assert!(status.is_failure());
    assert!(
        status.to_string().contains("is held by another node"),
        "{status}"
    );
    assert_eq!(sequencer.state(), SequencerState::Failed);
    assert!(system.registry.snapshot().is_empty());
}

#[tokio::test]
async fn one_shot_migrates_everything_and_releases_the_lock() {
    let system = TestSystem::new();
    system.seed_relational(0..250);
    system.seed_tree(0..120);
    system.seed_orphans(&["blob://orphan/1", "blob://orphan/2", "blob://orphan/3"]);
    let sequencer = system.sequencer(test_config());

    let status = sequencer.run(InvocationMode::OneShot).await;
    assert_eq!(status, MigrationStatus::Done);
    assert_eq!(sequencer.state(), SequencerState::Done);
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);

    assert_eq!(system.relational.legacy_count(), 0);
    assert_eq!(system.tree.legacy_count(), 0);
    assert_eq!(
        system.table.orphans(),
        vec![
            address("blob://orphan/1"),
            address("blob://orphan/2"),
            address("blob://orphan/3"),
        ]
    );
    for record in system.tracker().load_all().await.unwrap() {
        assert!(record.done, "{record}");
    }

    // Finished migrations stay finished
    assert_eq!(sequencer.run(InvocationMode::ScheduledTick).await, MigrationStatus::Done);
}

#[tokio::test]
async fn scheduled_ticks_advance_one_batch_per_phase() {
    let system = TestSystem::new();
    system.seed_relational(0..250);
    system.seed_tree(0..150);
    system.seed_orphans(&["blob://orphan/1"]);
    let sequencer = system.sequencer(test_config());
    let tracker = system.tracker();

    let first = sequencer.run(InvocationMode::ScheduledTick).await;
    assert_eq!(
        first,
        MigrationStatus::InProgress {
            phase: MigrationPhase::Relational,
            progress: Progress::Cursor {
                cursor: 100,
                high_water_mark: 250
            }
        }
    );
    assert_eq!(first.to_string(), "in progress: relational store at id 100 of 250");
    assert_eq!(tracker.load(MigrationPhase::Tree).await.unwrap().cursor, Some(100));
    assert_eq!(sequencer.state(), SequencerState::Start);
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);

    let second = sequencer.run(InvocationMode::ScheduledTick).await;
    assert_eq!(
        second,
        MigrationStatus::InProgress {
            phase: MigrationPhase::Relational,
            progress: Progress::Cursor {
                cursor: 200,
                high_water_mark: 250
            }
        }
    );
    assert!(tracker.load(MigrationPhase::Tree).await.unwrap().done);
    assert!(system.table.orphans().is_empty());

    let third = sequencer.run(InvocationMode::ScheduledTick).await;
    assert_eq!(third, MigrationStatus::Done);
    let relational = tracker.load(MigrationPhase::Relational).await.unwrap();
    assert_eq!((relational.cursor, relational.done), (Some(250), true));
    assert_eq!(system.table.orphans(), vec![address("blob://orphan/1")]);
}

#[tokio::test]
async fn failed_batch_releases_lock_and_next_tick_retries() {
    let system = TestSystem::new();
    system.seed_relational(0..50);
    let flaky = Arc::new(FlakyRelationalStore::new(system.relational.clone()));
    flaky.fail_once(0, FailureMode::BeforeWrite);
    let sequencer = system.sequencer_over(
        test_config(),
        flaky,
        system.tree.clone(),
        system.blobs.clone(),
    );

    let status = sequencer.run(InvocationMode::ScheduledTick).await;
    match &status {
        MigrationStatus::Failed { phase, error } => {
            assert_eq!(*phase, Some(MigrationPhase::Relational));
            assert!(error.contains("1 of 1 ranges failed"), "{error}");
        }
        other => panic!("unexpected status: {other}"),
    }
    assert_eq!(sequencer.state(), SequencerState::Failed);
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);
    let record = system.tracker().load(MigrationPhase::Relational).await.unwrap();
    assert_eq!(record.cursor, None);

    assert_eq!(
        sequencer.run(InvocationMode::ScheduledTick).await,
        MigrationStatus::Done
    );
}

#[tokio::test]
async fn shutdown_before_start_stops_cleanly() {
    let system = TestSystem::new();
    system.seed_relational(0..50);
    system.shutdown.request();
    let sequencer = system.sequencer(test_config());

    let status = sequencer.run(InvocationMode::OneShot).await;
    assert_eq!(
        status,
        MigrationStatus::Incomplete {
            phase: MigrationPhase::Relational,
            progress: Progress::NotStarted,
        }
    );
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);
    assert_eq!(system.relational.legacy_count(), 50);
}

#[tokio::test]
async fn shutdown_during_reconciliation_is_incomplete() {
    let system = TestSystem::new();
    for n in 0..10 {
        system.blobs.put(format!("blob://{n:02}"), 10);
    }
    let interrupting = Arc::new(InterruptingBlobStore::new(
        system.blobs.clone(),
        system.shutdown.clone(),
        5,
    ));
    let sequencer = system.sequencer_over(
        test_config(),
        system.relational.clone(),
        system.tree.clone(),
        interrupting,
    );

    let status = sequencer.run(InvocationMode::OneShot).await;
    assert!(
        matches!(
            status,
            MigrationStatus::Incomplete {
                phase: MigrationPhase::Reconciliation,
                progress: Progress::Scanned { addresses: 5, .. },
            }
        ),
        "{status}"
    );
    let record = system
        .tracker()
        .load(MigrationPhase::Reconciliation)
        .await
        .unwrap();
    assert!(!record.done);
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);
}

#[tokio::test]
async fn lost_lock_fails_without_persisting_the_batch() {
    let system = TestSystem::new();
    system.seed_relational(0..500);

    let mut locks = MockLocks::new();
    locks
        .expect_acquire()
        .times(1)
        .returning(|resource, _| Ok(Some(handle_for(resource))));
    // sequencer, pre-batch and post-batch heartbeats; the second post-batch one fails
    let mut refreshes = 0;
    locks.expect_refresh().returning(move |h, _| {
        refreshes += 1;
        if refreshes < 6 {
            Ok(())
        } else {
            Err(LockError::Lost {
                resource: h.resource.clone(),
            })
        }
    });
    locks.expect_release().times(1).returning(|_| Ok(()));
    let sequencer = sequencer_with_locks(&system, Arc::new(locks));

    let status = sequencer.run(InvocationMode::OneShot).await;
    match &status {
        MigrationStatus::Failed { phase, error } => {
            assert_eq!(*phase, Some(MigrationPhase::Relational));
            assert!(error.contains("lock"), "{error}");
        }
        other => panic!("unexpected status: {other}"),
    }
    let record = system.tracker().load(MigrationPhase::Relational).await.unwrap();
    assert_eq!(record.cursor, Some(100));
    assert!(!record.done);
}

#[tokio::test]
async fn only_one_of_two_concurrent_runs_holds_the_lock() {
    let system = TestSystem::new();
    system.seed_relational(0..120);

    let mut locks = MockLocks::new();
    let mut granted = false;
    locks.expect_acquire().returning(move |resource, _| {
        if granted {
            Ok(None)
        } else {
            granted = true;
            Ok(Some(handle_for(resource)))
        }
    });
    locks.expect_refresh().returning(|_, _| Ok(()));
    locks.expect_release().times(1).returning(|_| Ok(()));
    let locks: Arc<dyn LockCoordinator> = Arc::new(locks);

    let first = sequencer_with_locks(&system, Arc::clone(&locks));
    let second = sequencer_with_locks(&system, locks);
    let (a, b) = tokio::join!(
        first.run(InvocationMode::ScheduledTick),
        second.run(InvocationMode::ScheduledTick)
    );

    let holders = [&a, &b]
        .iter()
        .filter(|s| !matches!(s, MigrationStatus::Bypassed { .. }))
        .count();
    assert_eq!(holders, 1, "{a} / {b}");
}

/// Relational store counting how many callers are inside `update_range`
struct OverlapProbe {
    inner: Arc<dyn RelationalStore>,
    active: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

#[async_trait]
impl RelationalStore for OverlapProbe {
    async fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.inner.max_id().await
    }

    async fn update_range(&self, range: IdRange) -> Result<u64, StoreError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = self.inner.update_range(range).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_nodes_never_work_at_the_same_time() {
    let system = Arc::new(TestSystem::new());
    system.seed_relational(0..2_000);
    system.seed_orphans(&["blob://orphan"]);
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut nodes = Vec::new();
    for _ in 0..4 {
        let probe = Arc::new(OverlapProbe {
            inner: system.relational.clone(),
            active: Arc::clone(&active),
            overlaps: Arc::clone(&overlaps),
        });
        let sequencer =
            system.sequencer_over(test_config(), probe, system.tree.clone(), system.blobs.clone());
        nodes.push(tokio::spawn(async move {
            for _ in 0..5_000 {
                match sequencer.run(InvocationMode::ScheduledTick).await {
                    MigrationStatus::Done => return true,
                    MigrationStatus::Failed { .. } => return false,
                    _ => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
            false
        }));
    }

    for node in nodes {
        assert!(node.await.unwrap());
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(system.relational.legacy_count(), 0);
    assert_eq!(system.table.orphans(), vec![address("blob://orphan")]);
}

#[tokio::test]
async fn one_shot_refuses_to_reconcile_before_node_phases() {
    let system = TestSystem::new();
    let reconciler = OrphanReconciler::new(
        system.blobs.clone(),
        Arc::new(system.table.clone()),
        system.tracker(),
        10,
    );
    let sequencer = MigrationSequencer::new(
        test_config(),
        system.locks_dyn(),
        system.registry_dyn(),
        system.shutdown.clone(),
    )
    .unwrap()
    .with_phase(Box::new(reconciler));

    let status = sequencer.run(InvocationMode::OneShot).await;
    assert_eq!(
        status.to_string(),
        "failed during reconciliation: reconciliation cannot run before relational store is done"
    );
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);

    // A scheduled tick just reports what it is waiting on
    let status = sequencer.run(InvocationMode::ScheduledTick).await;
    assert_eq!(
        status,
        MigrationStatus::InProgress {
            phase: MigrationPhase::Relational,
            progress: Progress::NotStarted,
        }
    );
}

#[tokio::test]
async fn sequencer_rejects_sizing_that_plans_no_work() {
    let system = TestSystem::new();
    system.seed_relational(0..10);

    for config in [
        test_config().with_thread_count(0),
        test_config().with_ranges_per_thread(0),
    ] {
        let err = MigrationSequencer::standard(
            config,
            system.locks_dyn(),
            system.registry_dyn(),
            system.relational.clone(),
            system.tree.clone(),
            system.blobs.clone(),
            Arc::new(system.table.clone()),
            system.shutdown.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)), "{err}");
    }
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);
    assert_eq!(system.relational.legacy_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn lock_outlives_slow_reconciliation_checkpoint() {
    let system = TestSystem::new();
    let orphans: Vec<String> = (0..400).map(|n| format!("blob://slow/{n:03}")).collect();
    for orphan in &orphans {
        system.blobs.put(orphan.as_str(), 10);
    }
    // 400 checks at 50ms each is 20s between heartbeats
    let slow: Arc<dyn BlobStore> = Arc::new(SlowBlobStore::new(
        system.blobs.clone(),
        Duration::from_millis(50),
    ));
    let config = test_config().with_checkpoint_interval(400);
    assert!(config.lock_ttl() > Duration::from_secs(20));

    let sequencer = system.sequencer_over(
        config,
        system.relational.clone(),
        system.tree.clone(),
        slow,
    );
    let status = sequencer.run(InvocationMode::OneShot).await;
    assert_eq!(status, MigrationStatus::Done);
    assert_eq!(system.table.orphans().len(), 400);
    assert_eq!(system.locks.holder(TEST_RESOURCE), None);
}
