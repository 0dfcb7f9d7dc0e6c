//! Orphan reconciliation: preconditions, race tolerance, shutdown and resume.

use async_trait::async_trait;
use cam_core::prelude::*;
use cam_core::{LockError, LockHandle};
use cam_engine::memory::MemoryBlobStore;
use cam_engine::test_harness::{InterruptingBlobStore, VanishingBlobStore};
use cam_engine::{
    BlobStore, MigrationError, OrphanReconciler, PhaseDriver, PhaseOutcome, ReconcileOutcome,
    ReconcileReport,
};
use cam_test_utils::{address, TestSystem};
use mockall::mock;
use pretty_assertions::assert_eq;
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

fn reconciler(system: &TestSystem, blobs: Arc<dyn BlobStore>, interval: u64) -> OrphanReconciler {
    OrphanReconciler::new(
        blobs,
        Arc::new(system.table.clone()),
        system.tracker(),
        interval,
    )
}

async fn node_phases_done(system: &TestSystem, session: &LockSession) {
    let tracker = system.tracker();
    tracker
        .mark_done(session, MigrationPhase::Relational)
        .await
        .unwrap();
    tracker.mark_done(session, MigrationPhase::Tree).await.unwrap();
}

fn complete(outcome: ReconcileOutcome) -> ReconcileReport {
    match outcome {
        ReconcileOutcome::Complete(report) => report,
        other => panic!("expected a complete pass, got {other:?}"),
    }
}

fn incomplete(outcome: ReconcileOutcome) -> ReconcileReport {
    match outcome {
        ReconcileOutcome::Incomplete(report) => report,
        other => panic!("expected an interrupted pass, got {other:?}"),
    }
}

fn ten_orphans(system: &TestSystem) {
    for n in 0..10 {
        system.blobs.put(format!("blob://{n:02}"), 100);
    }
}

#[tokio::test]
async fn unowned_address_is_registered_once() {
    let system = TestSystem::new();
    system.seed_orphans(&["blob://123"]);
    let session = system.lock().await;
    node_phases_done(&system, &session).await;
    let pass = reconciler(&system, system.blobs.clone(), 10);

    let first = pass.run(&session, &system.shutdown).await.unwrap();
    let report = complete(first);
    assert_eq!(report.reconciled, 1);
    assert!(system.table.row(&address("blob://123")).unwrap().orphaned);

    let second = pass.run(&session, &system.shutdown).await.unwrap();
    let report = complete(second);
    assert_eq!(report.reconciled, 0);
    assert_eq!(report.already_owned, 1);
    assert_eq!(system.table.len(), 1);
}

#[tokio::test]
async fn owned_addresses_are_skipped_without_aborting() {
    let system = TestSystem::new();
    system.seed_orphans(&["blob://a", "blob://b", "blob://c"]);
    system.table.ensure_owned(&address("blob://b"));
    let session = system.lock().await;
    node_phases_done(&system, &session).await;

    let outcome = reconciler(&system, system.blobs.clone(), 1)
        .run(&session, &system.shutdown)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Complete(ReconcileReport {
            scanned: 3,
            reconciled: 2,
            already_owned: 1,
            vanished: 0,
            bytes_scanned: 300,
        })
    );
    assert_eq!(
        system.table.orphans(),
        vec![address("blob://a"), address("blob://c")]
    );
    assert!(!system.table.row(&address("blob://b")).unwrap().orphaned);
}

#[tokio::test]
async fn not_ready_until_node_phases_finish() {
    let system = TestSystem::new();
    system.seed_orphans(&["blob://1"]);
    let session = system.lock().await;
    let pass = reconciler(&system, system.blobs.clone(), 10);

    let outcome = pass.run(&session, &system.shutdown).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::NotReady {
            waiting_on: MigrationPhase::Relational
        }
    );

    system
        .tracker()
        .mark_done(&session, MigrationPhase::Relational)
        .await
        .unwrap();
    let outcome = pass.run_one_batch(&session, &system.shutdown).await.unwrap();
    assert_eq!(
        outcome,
        PhaseOutcome::NotReady {
            waiting_on: MigrationPhase::Tree
        }
    );
    assert!(system.table.is_empty());
    assert!(!pass.is_done().await.unwrap());
}

#[tokio::test]
async fn shutdown_midway_leaves_phase_open_and_resumes() {
    let system = TestSystem::new();
    ten_orphans(&system);
    let session = system.lock().await;
    node_phases_done(&system, &session).await;

    let interrupting = Arc::new(InterruptingBlobStore::new(
        system.blobs.clone(),
        system.shutdown.clone(),
        5,
    ));
    let outcome = reconciler(&system, interrupting, 1)
        .run(&session, &system.shutdown)
        .await
        .unwrap();
    let report = incomplete(outcome);
    assert_eq!(report.scanned, 5);

    let tracker = system.tracker();
    assert!(!tracker.load(MigrationPhase::Reconciliation).await.unwrap().done);
    assert_eq!(tracker.last_address().await.unwrap(), Some(address("blob://04")));
    assert_eq!(system.table.orphans().len(), 5);

    // Next process: fresh signal, enumeration continues after the last address
    let shutdown = ShutdownSignal::new();
    let outcome = reconciler(&system, system.blobs.clone(), 1)
        .run(&session, &shutdown)
        .await
        .unwrap();
    let report = complete(outcome);
    assert_eq!((report.scanned, report.reconciled, report.already_owned), (5, 5, 0));
    assert!(tracker.load(MigrationPhase::Reconciliation).await.unwrap().done);
    assert_eq!(tracker.last_address().await.unwrap(), None);
    assert_eq!(system.table.orphans().len(), 10);
}

#[tokio::test]
async fn unstable_order_restarts_from_the_beginning() {
    let system = TestSystem::with_blobs(MemoryBlobStore::new().with_unstable_order());
    ten_orphans(&system);
    let session = system.lock().await;
    node_phases_done(&system, &session).await;

    let interrupting = Arc::new(InterruptingBlobStore::new(
        system.blobs.clone(),
        system.shutdown.clone(),
        5,
    ));
    let outcome = reconciler(&system, interrupting, 1)
        .run(&session, &system.shutdown)
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Incomplete(_)));
    assert_eq!(system.tracker().last_address().await.unwrap(), None);

    let outcome = reconciler(&system, system.blobs.clone(), 1)
        .run(&session, &ShutdownSignal::new())
        .await
        .unwrap();
    let report = complete(outcome);
    assert_eq!((report.scanned, report.reconciled, report.already_owned), (10, 5, 5));
    assert_eq!(system.table.orphans().len(), 10);
}

#[tokio::test]
async fn vanished_blobs_are_skipped() {
    let system = TestSystem::new();
    system.seed_orphans(&["blob://kept", "blob://gone"]);
    let session = system.lock().await;
    node_phases_done(&system, &session).await;

    let vanishing = Arc::new(VanishingBlobStore::new(
        system.blobs.clone(),
        [address("blob://gone")],
    ));
    let outcome = reconciler(&system, vanishing, 10)
        .run(&session, &system.shutdown)
        .await
        .unwrap();
    let report = complete(outcome);
    assert_eq!((report.reconciled, report.vanished), (1, 1));
    assert_eq!(system.table.orphans(), vec![address("blob://kept")]);
}

#[tokio::test]
async fn store_without_enumeration_is_marked_done() {
    let system = TestSystem::with_blobs(MemoryBlobStore::new().without_enumeration());
    system.seed_orphans(&["blob://1"]);
    let session = system.lock().await;
    node_phases_done(&system, &session).await;

    let pass = reconciler(&system, system.blobs.clone(), 10);
    let outcome = pass.run_one_batch(&session, &system.shutdown).await.unwrap();
    assert_eq!(outcome, PhaseOutcome::Done);
    assert!(pass.is_done().await.unwrap());
    assert!(system.table.is_empty());
}

#[tokio::test]
async fn lost_lock_at_checkpoint_commits_nothing() {
    let system = TestSystem::new();
    ten_orphans(&system);
    {
        let session = system.lock().await;
        node_phases_done(&system, &session).await;
        session.release().await;
    }

    let mut locks = MockLocks::new();
    locks.expect_acquire().returning(|resource, _| {
        Ok(Some(LockHandle {
            token: "stale".into(),
            resource: resource.to_string(),
            acquired_at: chrono::Utc::now(),
        }))
    });
    let mut refreshes = 0;
    locks.expect_refresh().returning(move |h, _| {
        refreshes += 1;
        if refreshes == 1 {
            Ok(())
        } else {
            Err(LockError::Lost {
                resource: h.resource.clone(),
            })
        }
    });
    let session =
        LockSession::acquire(Arc::new(locks), "content-url-migration", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

    let err = reconciler(&system, system.blobs.clone(), 3)
        .run(&session, &system.shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Lock(LockError::Lost { .. })));
    assert_eq!(system.table.commits(), 0);
    assert!(system.table.is_empty());
}
