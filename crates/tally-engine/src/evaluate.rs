//! Retirement evaluation.
//!
//! Only subjects touched by the current batch are considered, so each round
//! costs O(batch) rather than O(all subjects).

use std::collections::BTreeSet;

use tally_core::{store::TallyStore, subject::SubjectId};
use tracing::{error, info};

use crate::{Error, Result};

/// Retire every subject in `touched` that has reached `threshold` counted
/// classifications and is not retired yet.
///
/// The touched aggregates are audited first; any disagreement between an
/// aggregate and its classification rows is fatal. Returns the subjects that
/// transitioned to retired in this call.
pub async fn evaluate<S: TallyStore>(
  store:     &S,
  touched:   &[SubjectId],
  threshold: u32,
) -> Result<BTreeSet<SubjectId>> {
  if touched.is_empty() {
    return Ok(BTreeSet::new());
  }

  let findings = store.audit_subjects(touched).await.map_err(Error::store)?;
  if !findings.is_empty() {
    for finding in &findings {
      error!(subject_id = finding.subject_id, %finding, "aggregate disagrees with its classifications");
    }
    return Err(Error::Corruption(findings));
  }

  let due = store
    .subjects_meeting_threshold(touched, threshold)
    .await
    .map_err(Error::store)?;
  if due.is_empty() {
    return Ok(BTreeSet::new());
  }

  let due: Vec<SubjectId> = due.into_iter().collect();
  let retired = store.mark_retired(&due).await.map_err(Error::store)?;
  info!(count = retired.len(), subjects = ?retired, threshold, "retired subjects");
  Ok(retired)
}

#[cfg(test)]
mod tests {
  use tally_core::classification::{Answer, Label, NewClassification};
  use tally_store_sqlite::SqliteStore;

  use super::*;

  async fn store_with_votes(votes: &[(i64, i64)]) -> SqliteStore {
    let store = SqliteStore::open_in_memory().await.unwrap();
    for &(id, subject) in votes {
      store
        .record_classification(NewClassification::new(
          id,
          subject,
          Label::new(Answer::Value(1.0), None),
        ))
        .await
        .unwrap();
    }
    store
  }

  #[tokio::test]
  async fn retires_only_touched_subjects_over_threshold() {
    let store = store_with_votes(&[(1, 10), (2, 10), (3, 20), (4, 20), (5, 30)]).await;

    let retired = evaluate(&store, &[10, 30], 2).await.unwrap();
    assert_eq!(retired.into_iter().collect::<Vec<_>>(), vec![10]);

    // Subject 20 qualifies but was not touched.
    assert!(!store.get_subject(20).await.unwrap().unwrap().retired);
  }

  #[tokio::test]
  async fn second_evaluation_retires_nothing() {
    let store = store_with_votes(&[(1, 10), (2, 10)]).await;
    assert_eq!(evaluate(&store, &[10], 2).await.unwrap().len(), 1);
    assert!(evaluate(&store, &[10], 2).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn below_threshold_stays_open() {
    let store = store_with_votes(&[(1, 10), (2, 10)]).await;
    assert!(evaluate(&store, &[10], 3).await.unwrap().is_empty());
  }
}
