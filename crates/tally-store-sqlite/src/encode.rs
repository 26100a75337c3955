//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings. Answers are stored as text:
//! the number itself, or the literal `None`.

use chrono::{DateTime, Utc};
use tally_core::{
  classification::{Answer, ClassificationId, Label, StoredClassification},
  subject::{ApplyResult, SubjectAggregate, SubjectId},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Answer ──────────────────────────────────────────────────────────────────

const NONE_ANSWER: &str = "None";

pub fn encode_answer(a: Answer) -> String {
  match a {
    Answer::Value(v) => v.to_string(),
    Answer::None => NONE_ANSWER.to_owned(),
  }
}

pub fn decode_answer(s: &str) -> Result<Answer> {
  if s == NONE_ANSWER {
    return Ok(Answer::None);
  }
  match s.parse::<f64>() {
    Ok(v) if v.is_finite() && v >= 0.0 => Ok(Answer::Value(v)),
    _ => Err(Error::InvalidAnswer(s.to_owned())),
  }
}

pub fn decode_label(t0: &str, t1: Option<&str>) -> Result<Label> {
  Ok(Label::new(decode_answer(t0)?, t1.map(decode_answer).transpose()?))
}

// ─── ApplyResult ─────────────────────────────────────────────────────────────

pub fn encode_outcome(r: ApplyResult) -> &'static str {
  match r {
    ApplyResult::Created => "created",
    ApplyResult::Updated => "updated",
    ApplyResult::SkippedBecauseRetired => "skipped_retired",
  }
}

pub fn decode_outcome(s: &str) -> Result<ApplyResult> {
  match s {
    "created" => Ok(ApplyResult::Created),
    "updated" => Ok(ApplyResult::Updated),
    "skipped_retired" => Ok(ApplyResult::SkippedBecauseRetired),
    other => Err(Error::UnknownOutcome(other.to_owned())),
  }
}

// ─── Raw row types ───────────────────────────────────────────────────────────

/// Column values read straight out of the `subjects` table.
pub struct RawSubject {
  pub subject_id:           SubjectId,
  pub object_id:            Option<String>,
  pub tally_t0:             f64,
  pub tally_t1:             f64,
  pub classification_count: u32,
  pub retired:              bool,
  pub created_at:           String,
  pub updated_at:           String,
  pub retired_at:           Option<String>,
  pub exported_at:          Option<String>,
}

impl RawSubject {
  pub const COLUMNS: &'static str = "subject_id, object_id, tally_t0, tally_t1, \
     classification_count, retired, created_at, updated_at, retired_at, exported_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_id:           row.get(0)?,
      object_id:            row.get(1)?,
      tally_t0:             row.get(2)?,
      tally_t1:             row.get(3)?,
      classification_count: row.get(4)?,
      retired:              row.get(5)?,
      created_at:           row.get(6)?,
      updated_at:           row.get(7)?,
      retired_at:           row.get(8)?,
      exported_at:          row.get(9)?,
    })
  }

  pub fn into_aggregate(self) -> Result<SubjectAggregate> {
    Ok(SubjectAggregate {
      subject_id:           self.subject_id,
      object_id:            self.object_id,
      tally_t0:             self.tally_t0,
      tally_t1:             self.tally_t1,
      classification_count: self.classification_count,
      retired:              self.retired,
      created_at:           decode_dt(&self.created_at)?,
      updated_at:           decode_dt(&self.updated_at)?,
      retired_at:           decode_opt_dt(self.retired_at.as_deref())?,
      exported_at:          decode_opt_dt(self.exported_at.as_deref())?,
    })
  }
}

/// Column values read straight out of the `classifications` table.
pub struct RawClassification {
  pub id:          ClassificationId,
  pub subject_id:  SubjectId,
  pub t0:          String,
  pub t1:          Option<String>,
  pub user_id:     Option<String>,
  pub object_id:   Option<String>,
  pub outcome:     Option<String>,
  pub recorded_at: String,
}

impl RawClassification {
  pub const COLUMNS: &'static str =
    "id, subject_id, t0, t1, user_id, object_id, outcome, recorded_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:          row.get(0)?,
      subject_id:  row.get(1)?,
      t0:          row.get(2)?,
      t1:          row.get(3)?,
      user_id:     row.get(4)?,
      object_id:   row.get(5)?,
      outcome:     row.get(6)?,
      recorded_at: row.get(7)?,
    })
  }

  pub fn into_classification(self) -> Result<StoredClassification> {
    Ok(StoredClassification {
      id:          self.id,
      subject_id:  self.subject_id,
      label:       decode_label(&self.t0, self.t1.as_deref())?,
      user_id:     self.user_id,
      object_id:   self.object_id,
      recorded_at: decode_dt(&self.recorded_at)?,
      outcome:     self.outcome.as_deref().map(decode_outcome).transpose()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn answers_survive_the_text_column() {
    for a in [Answer::None, Answer::Value(0.0), Answer::Value(1.0), Answer::Value(0.25)] {
      assert_eq!(decode_answer(&encode_answer(a)).unwrap(), a);
    }
  }

  #[test]
  fn garbage_answers_are_rejected() {
    assert!(matches!(decode_answer("yes"), Err(Error::InvalidAnswer(_))));
    assert!(matches!(decode_answer("-1"), Err(Error::InvalidAnswer(_))));
    assert!(matches!(decode_answer("none"), Err(Error::InvalidAnswer(_))));
  }

  #[test]
  fn unknown_outcome_is_rejected() {
    assert!(matches!(decode_outcome("retired"), Err(Error::UnknownOutcome(_))));
  }
}
