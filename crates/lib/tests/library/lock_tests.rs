//! Operator lock release through the services layer.

use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::lock::{LockError, LockId};
use conveyor_lib::record::RecordEvent;
use conveyor_lib::services::ServicesError;

use super::common::Harness;

#[tokio::test]
async fn force_unlock_records_the_release() {
  let h = Harness::new();
  let services = h.services();
  let stage = services.environment("stage").unwrap();
  let lease = services.locks.acquire(stage, "crashed-runner", Some("run-42")).await.unwrap();

  let (removed, record) = services.force_unlock("stage", &lease.lock_id, "oncall").await.unwrap();

  assert_eq!(removed.lock_id, lease.lock_id);
  assert!(services.locks.current("stage").await.unwrap().is_none());
  assert_eq!(record.actor, "oncall");
  assert_eq!(record.run_id.as_deref(), Some("run-42"));
  match &record.event {
    RecordEvent::ForcedUnlock { lock_id, holder } => {
      assert_eq!(lock_id, &lease.lock_id);
      assert_eq!(holder, "crashed-runner");
    }
    other => panic!("unexpected record {:?}", other),
  }
  assert_eq!(services.records.history("stage").unwrap(), vec![record]);
}

#[tokio::test]
async fn force_unlock_with_the_wrong_id_changes_nothing() {
  let h = Harness::new();
  let services = h.services();
  let stage = services.environment("stage").unwrap();
  let lease = services.locks.acquire(stage, "runner", None).await.unwrap();

  let err = services
    .force_unlock("stage", &LockId::generate(), "oncall")
    .await
    .unwrap_err();

  assert!(matches!(err, ServicesError::Lock(LockError::NotHeld { .. })));
  assert_eq!(err.kind(), FailureKind::NotFound);
  assert_eq!(services.locks.current("stage").await.unwrap().map(|l| l.lock_id), Some(lease.lock_id));
  assert!(services.records.history("stage").unwrap().is_empty());

  let err = services.force_unlock("qa", &LockId::generate(), "oncall").await.unwrap_err();
  assert!(matches!(err, ServicesError::UnknownEnvironment(_)));
}
