//! Integration tests for `SqliteStore` against an in-memory database.

use tally_core::{
  classification::{Answer, Label, NewClassification},
  store::TallyStore,
  subject::{ApplyResult, RecordOutcome},
};

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn vote(id: i64, subject_id: i64, t0: f64) -> NewClassification {
  NewClassification::new(id, subject_id, Label::new(Answer::Value(t0), None))
}

fn vote2(id: i64, subject_id: i64, t0: Answer, t1: Answer) -> NewClassification {
  NewClassification::new(id, subject_id, Label::new(t0, Some(t1)))
}

// ─── Resumption ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn recover_on_empty_store_is_zero() {
  let s = store().await;
  assert_eq!(s.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn recover_returns_highest_id() {
  let s = store().await;
  s.record_classification(vote(7, 1, 1.0)).await.unwrap();
  s.record_classification(vote(3, 2, 1.0)).await.unwrap();
  s.insert_classification(vote(12, 2, 0.0)).await.unwrap();

  assert_eq!(s.recover().await.unwrap(), 12);
}

#[tokio::test]
async fn reopening_a_file_store_keeps_state() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("tally.sqlite3");

  {
    let s = SqliteStore::open(&path).await.unwrap();
    s.record_classification(vote(1, 42, 1.0)).await.unwrap();
    s.record_classification(vote(2, 42, 1.0)).await.unwrap();
  }

  let s = SqliteStore::open(&path).await.unwrap();
  assert_eq!(s.recover().await.unwrap(), 2);

  // Replaying everything at or below the recovered id changes nothing.
  for id in 1..=2 {
    let outcome = s.record_classification(vote(id, 42, 1.0)).await.unwrap();
    assert_eq!(outcome, RecordOutcome::Duplicate);
  }
  let tally = s.read_tally(42).await.unwrap().unwrap();
  assert_eq!(tally.classification_count, 2);
  assert_eq!(tally.tally_t0, 2.0);
}

// ─── Classifications ─────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_is_idempotent_by_id() {
  let s = store().await;
  assert!(s.insert_classification(vote(1, 42, 1.0)).await.unwrap());
  assert!(!s.insert_classification(vote(1, 42, 0.0)).await.unwrap());
  assert!(s.has_classification(1).await.unwrap());
  assert!(!s.has_classification(2).await.unwrap());
}

#[tokio::test]
async fn insert_leaves_row_unprocessed() {
  let s = store().await;
  let mut input = vote(1, 42, 1.0);
  input.user_id = Some("1234".into());
  input.object_id = Some("ZTF19aaaaaaa".into());
  s.insert_classification(input).await.unwrap();

  let pending = s.unprocessed_classifications().await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].id, 1);
  assert!(!pending[0].processed());
  assert_eq!(pending[0].label, Label::new(Answer::Value(1.0), None));
  assert_eq!(pending[0].user_id.as_deref(), Some("1234"));
  assert_eq!(pending[0].object_id.as_deref(), Some("ZTF19aaaaaaa"));
  assert!(s.get_subject(42).await.unwrap().is_none());
}

#[tokio::test]
async fn apply_creates_then_updates() {
  let s = store().await;
  let a = vote2(1, 42, Answer::Value(1.0), Answer::Value(0.0));
  let b = vote2(2, 42, Answer::Value(1.0), Answer::None);
  s.insert_classification(a.clone()).await.unwrap();
  s.insert_classification(b.clone()).await.unwrap();

  let r = s.apply_to_subject(1, 42, a.label).await.unwrap();
  assert_eq!(r, ApplyResult::Created);
  let r = s.apply_to_subject(2, 42, b.label).await.unwrap();
  assert_eq!(r, ApplyResult::Updated);

  let agg = s.get_subject(42).await.unwrap().unwrap();
  assert_eq!(agg.classification_count, 2);
  assert_eq!(agg.tally_t0, 2.0);
  assert_eq!(agg.tally_t1, 0.0);
  assert!(!agg.retired);
  assert!(s.unprocessed_classifications().await.unwrap().is_empty());
}

#[tokio::test]
async fn apply_twice_is_rejected() {
  let s = store().await;
  let a = vote(1, 42, 1.0);
  s.insert_classification(a.clone()).await.unwrap();
  s.apply_to_subject(1, 42, a.label).await.unwrap();

  let err = s.apply_to_subject(1, 42, a.label).await.unwrap_err();
  assert!(matches!(err, crate::Error::AlreadyProcessed(1)));
  assert_eq!(s.read_tally(42).await.unwrap().unwrap().classification_count, 1);
}

#[tokio::test]
async fn apply_unknown_classification_errors() {
  let s = store().await;
  let err = s
    .apply_to_subject(99, 42, Label::new(Answer::Value(1.0), None))
    .await
    .unwrap_err();
  assert!(matches!(err, crate::Error::ClassificationNotFound(99)));
}

#[tokio::test]
async fn apply_to_wrong_subject_errors_without_mutation() {
  let s = store().await;
  let a = vote(1, 42, 1.0);
  s.insert_classification(a.clone()).await.unwrap();

  let err = s.apply_to_subject(1, 43, a.label).await.unwrap_err();
  assert!(matches!(err, crate::Error::SubjectMismatch { stored: 42, requested: 43, .. }));
  assert!(s.get_subject(43).await.unwrap().is_none());
  assert_eq!(s.unprocessed_classifications().await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_record_counts_once() {
  let s = store().await;
  let first = s.record_classification(vote(1, 42, 1.0)).await.unwrap();
  let again = s.record_classification(vote(1, 42, 1.0)).await.unwrap();

  assert_eq!(first, RecordOutcome::Applied(ApplyResult::Created));
  assert_eq!(again, RecordOutcome::Duplicate);
  let tally = s.read_tally(42).await.unwrap().unwrap();
  assert_eq!(tally.classification_count, 1);
  assert_eq!(tally.tally_t0, 1.0);
}

#[tokio::test]
async fn tallies_are_sums_of_counted_answers() {
  let s = store().await;
  s.record_classification(vote2(1, 5, Answer::Value(1.0), Answer::Value(1.0))).await.unwrap();
  s.record_classification(vote2(2, 5, Answer::None, Answer::Value(1.0))).await.unwrap();
  s.record_classification(vote(3, 5, 1.0)).await.unwrap();
  s.record_classification(vote2(4, 5, Answer::Value(0.0), Answer::None)).await.unwrap();

  let tally = s.read_tally(5).await.unwrap().unwrap();
  assert_eq!(tally.classification_count, 4);
  assert_eq!(tally.tally_t0, 2.0);
  assert_eq!(tally.tally_t1, 2.0);
  assert!(s.audit_subjects(&[5]).await.unwrap().is_empty());
}

#[tokio::test]
async fn first_object_id_sticks() {
  let s = store().await;
  let mut a = vote(1, 42, 1.0);
  a.object_id = None;
  let mut b = vote(2, 42, 1.0);
  b.object_id = Some("ZTF21first".into());
  let mut c = vote(3, 42, 1.0);
  c.object_id = Some("ZTF21other".into());
  for v in [a, b, c] {
    s.record_classification(v).await.unwrap();
  }

  let tally = s.read_tally(42).await.unwrap().unwrap();
  assert_eq!(tally.object_id.as_deref(), Some("ZTF21first"));
}

// ─── Retirement ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn threshold_only_considers_candidates() {
  let s = store().await;
  for id in 1..=3 {
    s.record_classification(vote(id, 1, 1.0)).await.unwrap();
  }
  for id in 4..=6 {
    s.record_classification(vote(id, 2, 1.0)).await.unwrap();
  }
  s.record_classification(vote(7, 3, 1.0)).await.unwrap();

  let found = s.subjects_meeting_threshold(&[1, 3, 99], 3).await.unwrap();
  assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1]);

  let global = s.retirement_candidates(3).await.unwrap();
  assert_eq!(global.into_iter().collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn mark_retired_is_idempotent() {
  let s = store().await;
  s.record_classification(vote(1, 1, 1.0)).await.unwrap();
  s.record_classification(vote(2, 2, 1.0)).await.unwrap();

  let first = s.mark_retired(&[1, 2]).await.unwrap();
  assert_eq!(first.len(), 2);
  let again = s.mark_retired(&[1, 2, 3]).await.unwrap();
  assert!(again.is_empty());

  let agg = s.get_subject(1).await.unwrap().unwrap();
  assert!(agg.retired);
  assert!(agg.retired_at.is_some());
  assert!(s.subjects_meeting_threshold(&[1, 2], 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn retired_subject_is_frozen() {
  let s = store().await;
  for id in 1..=3 {
    s.record_classification(vote(id, 42, 1.0)).await.unwrap();
  }
  s.mark_retired(&[42]).await.unwrap();
  let before = s.read_tally(42).await.unwrap().unwrap();

  let outcome = s.record_classification(vote(4, 42, 1.0)).await.unwrap();
  assert_eq!(outcome, RecordOutcome::Applied(ApplyResult::SkippedBecauseRetired));

  // The raw event is still recorded and processed.
  assert!(s.has_classification(4).await.unwrap());
  assert!(s.unprocessed_classifications().await.unwrap().is_empty());

  let after = s.read_tally(42).await.unwrap().unwrap();
  assert_eq!(before, after);
  assert!(s.audit_subjects(&[42]).await.unwrap().is_empty());
}

// ─── Export ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_tally_missing_returns_none() {
  let s = store().await;
  assert!(s.read_tally(42).await.unwrap().is_none());
}

#[tokio::test]
async fn exported_subjects_leave_the_pending_list() {
  let s = store().await;
  for (id, subject) in [(1, 10), (2, 20), (3, 30)] {
    s.record_classification(vote(id, subject, 1.0)).await.unwrap();
  }
  s.mark_retired(&[10, 20]).await.unwrap();
  assert_eq!(s.unexported_retirements().await.unwrap(), vec![10, 20]);

  // Unretired subjects are never marked exported.
  s.mark_exported(&[10, 30]).await.unwrap();
  assert_eq!(s.unexported_retirements().await.unwrap(), vec![20]);
  assert!(s.get_subject(10).await.unwrap().unwrap().exported_at.is_some());
  assert!(s.get_subject(30).await.unwrap().unwrap().exported_at.is_none());
}

// ─── Integrity ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn audit_detects_tampered_count() {
  let s = store().await;
  s.record_classification(vote(1, 42, 1.0)).await.unwrap();
  s.record_classification(vote(2, 42, 0.0)).await.unwrap();

  s.connection()
    .call(|conn| {
      conn.execute(
        "UPDATE subjects SET classification_count = 5 WHERE subject_id = 42",
        [],
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let findings = s.audit_subjects(&[42]).await.unwrap();
  assert_eq!(findings.len(), 1);
  assert_eq!(findings[0].stored_count, 5);
  assert_eq!(findings[0].expected_count, 2);
}

#[tokio::test]
async fn audit_detects_tampered_tally() {
  let s = store().await;
  s.record_classification(vote(1, 42, 1.0)).await.unwrap();

  s.connection()
    .call(|conn| {
      conn.execute("UPDATE subjects SET tally_t1 = 3 WHERE subject_id = 42", [])?;
      Ok(())
    })
    .await
    .unwrap();

  let findings = s.audit_subjects(&[42]).await.unwrap();
  assert_eq!(findings.len(), 1);
  assert_eq!(findings[0].stored_t1, 3.0);
  assert_eq!(findings[0].expected_t1, 0.0);
}

#[tokio::test]
async fn audit_of_unknown_subject_is_clean() {
  let s = store().await;
  assert!(s.audit_subjects(&[1, 2, 3]).await.unwrap().is_empty());
}
