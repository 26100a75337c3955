//! Subject aggregates: the per-candidate running tallies.
//!
//! An aggregate is created by the first classification of its subject,
//! grows additively with each later one, and is frozen once retired.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a candidate subject.
pub type SubjectId = i64;

/// What applying one classification did to its subject's aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyResult {
  /// First classification for the subject; aggregate created with count 1.
  Created,
  /// Contributions added to an existing, unretired aggregate.
  Updated,
  /// The subject was already retired; the aggregate was left untouched.
  SkippedBecauseRetired,
}

impl ApplyResult {
  /// Whether the classification counts towards the aggregate.
  pub fn is_counted(self) -> bool { !matches!(self, Self::SkippedBecauseRetired) }
}

/// Result of storing and applying a classification in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
  /// A classification with the same id was already stored; nothing changed.
  Duplicate,
  Applied(ApplyResult),
}

/// The full persisted aggregate row for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectAggregate {
  pub subject_id:           SubjectId,
  pub object_id:            Option<String>,
  pub tally_t0:             f64,
  pub tally_t1:             f64,
  pub classification_count: u32,
  pub retired:              bool,
  pub created_at:           DateTime<Utc>,
  pub updated_at:           DateTime<Utc>,
  pub retired_at:           Option<DateTime<Utc>>,
  /// Set once both sinks accepted this subject's export.
  pub exported_at:          Option<DateTime<Utc>>,
}

/// The slice of an aggregate needed to export a retired subject.
#[derive(Debug, Clone, PartialEq)]
pub struct Tally {
  pub subject_id:           SubjectId,
  pub object_id:            Option<String>,
  pub tally_t0:             f64,
  pub tally_t1:             f64,
  pub classification_count: u32,
}

impl Tally {
  /// Per-slot vote fractions; `None` when no classification was counted.
  pub fn fractions(&self) -> Option<VoteFractions> {
    if self.classification_count == 0 {
      return None;
    }
    let n = f64::from(self.classification_count);
    Some(VoteFractions {
      subject_id:           self.subject_id,
      object_id:            self.object_id.clone(),
      fraction_t0:          self.tally_t0 / n,
      fraction_t1:          self.tally_t1 / n,
      classification_count: self.classification_count,
    })
  }
}

/// What the results sink receives for each retired subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteFractions {
  pub subject_id:           SubjectId,
  pub object_id:            Option<String>,
  pub fraction_t0:          f64,
  pub fraction_t1:          f64,
  pub classification_count: u32,
}

/// A subject whose stored aggregate disagrees with the classification rows
/// that were folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inconsistency {
  pub subject_id:     SubjectId,
  pub stored_count:   u32,
  pub expected_count: u32,
  pub stored_t0:      f64,
  pub expected_t0:    f64,
  pub stored_t1:      f64,
  pub expected_t1:    f64,
}

impl fmt::Display for Inconsistency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "subject {}: count {} (expected {}), tally_t0 {} (expected {}), tally_t1 {} (expected {})",
      self.subject_id,
      self.stored_count,
      self.expected_count,
      self.stored_t0,
      self.expected_t0,
      self.stored_t1,
      self.expected_t1,
    )
  }
}
