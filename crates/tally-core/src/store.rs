//! The `TallyStore` trait.
//!
//! The trait is implemented by storage backends (e.g. `tally-store-sqlite`).
//! The ingestion engine depends on this abstraction, not on any concrete
//! backend.

use std::{collections::BTreeSet, future::Future};

use crate::{
  classification::{ClassificationId, Label, NewClassification, StoredClassification},
  subject::{ApplyResult, Inconsistency, RecordOutcome, SubjectAggregate, SubjectId, Tally},
};

/// Abstraction over the durable record store.
///
/// The store exclusively owns the classification and subject tables. Every
/// method is a single atomic unit: a failed write leaves no partial state.
/// Only one writer may use a store at a time.
pub trait TallyStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Resumption ────────────────────────────────────────────────────────

  /// The highest classification id ever stored, or 0 for an empty store.
  fn recover(&self) -> impl Future<Output = Result<ClassificationId, Self::Error>> + Send + '_;

  // ── Classifications ───────────────────────────────────────────────────

  /// Whether a classification with this id is already stored.
  fn has_classification(
    &self,
    id: ClassificationId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Append an unprocessed classification row. Returns `false` (and changes
  /// nothing) if the id is already stored.
  fn insert_classification(
    &self,
    input: NewClassification,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Fold a stored classification's label into its subject's aggregate and
  /// mark the row processed.
  ///
  /// Creates the aggregate on first sight; leaves a retired aggregate
  /// untouched and reports [`ApplyResult::SkippedBecauseRetired`]. Errors if
  /// the row does not exist or was already processed.
  fn apply_to_subject(
    &self,
    classification_id: ClassificationId,
    subject_id: SubjectId,
    label: Label,
  ) -> impl Future<Output = Result<ApplyResult, Self::Error>> + Send + '_;

  /// [`insert_classification`](Self::insert_classification) followed by
  /// [`apply_to_subject`](Self::apply_to_subject) in one transaction.
  fn record_classification(
    &self,
    input: NewClassification,
  ) -> impl Future<Output = Result<RecordOutcome, Self::Error>> + Send + '_;

  /// Rows inserted but never applied, in ascending id order.
  fn unprocessed_classifications(
    &self,
  ) -> impl Future<Output = Result<Vec<StoredClassification>, Self::Error>> + Send + '_;

  // ── Retirement ────────────────────────────────────────────────────────

  /// The members of `candidates` with at least `threshold` counted
  /// classifications that are not yet retired.
  fn subjects_meeting_threshold<'a>(
    &'a self,
    candidates: &'a [SubjectId],
    threshold: u32,
  ) -> impl Future<Output = Result<BTreeSet<SubjectId>, Self::Error>> + Send + 'a;

  /// Every unretired subject with at least `threshold` counted
  /// classifications. Scans all subjects; meant for startup only.
  fn retirement_candidates(
    &self,
    threshold: u32,
  ) -> impl Future<Output = Result<BTreeSet<SubjectId>, Self::Error>> + Send + '_;

  /// Retire the given subjects. Idempotent; returns the subjects that were
  /// not retired before this call.
  fn mark_retired<'a>(
    &'a self,
    subject_ids: &'a [SubjectId],
  ) -> impl Future<Output = Result<BTreeSet<SubjectId>, Self::Error>> + Send + 'a;

  // ── Export ────────────────────────────────────────────────────────────

  /// Running tallies for a subject. Returns `None` if it has no aggregate.
  fn read_tally(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Option<Tally>, Self::Error>> + Send + '_;

  /// Retired subjects whose export has not been acknowledged by both sinks,
  /// in ascending id order.
  fn unexported_retirements(
    &self,
  ) -> impl Future<Output = Result<Vec<SubjectId>, Self::Error>> + Send + '_;

  /// Record that the given subjects were delivered downstream.
  fn mark_exported<'a>(
    &'a self,
    subject_ids: &'a [SubjectId],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Reads & integrity ─────────────────────────────────────────────────

  /// The full aggregate row for a subject, if any.
  fn get_subject(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Option<SubjectAggregate>, Self::Error>> + Send + '_;

  /// Compare each subject's aggregate against the classification rows
  /// counted into it. Returns one entry per subject that disagrees.
  fn audit_subjects<'a>(
    &'a self,
    subject_ids: &'a [SubjectId],
  ) -> impl Future<Output = Result<Vec<Inconsistency>, Self::Error>> + Send + 'a;
}
