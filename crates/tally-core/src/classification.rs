//! Classification events and the labels parsed out of them.
//!
//! An event is what the source delivers; a [`NewClassification`] is what the
//! store persists once the event's annotation has been parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subject::{ApplyResult, SubjectId};

/// Identifier of a single classification; unique and monotonically
/// increasing across the event stream.
pub type ClassificationId = i64;

// ─── Answers ─────────────────────────────────────────────────────────────────

/// A single parsed answer slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
  /// A non-negative numeric answer.
  Value(f64),
  /// The volunteer explicitly answered "None"; contributes nothing.
  None,
}

impl Answer {
  /// The amount this answer adds to a running tally.
  pub fn contribution(self) -> f64 {
    match self {
      Self::Value(v) => v,
      Self::None => 0.0,
    }
  }
}

/// The normalised result of parsing one annotation payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Label {
  pub t0: Answer,
  /// `None` when the payload had no `T1` slot at all.
  pub t1: Option<Answer>,
}

impl Label {
  pub fn new(t0: Answer, t1: Option<Answer>) -> Self { Self { t0, t1 } }

  pub fn contribution_t0(&self) -> f64 { self.t0.contribution() }

  pub fn contribution_t1(&self) -> f64 {
    self.t1.map_or(0.0, Answer::contribution)
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// One volunteer's classification of one subject, as delivered by an event
/// source. Field aliases accept the column names used by project exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationEvent {
  #[serde(alias = "classification_id", deserialize_with = "de::integer")]
  pub id:             ClassificationId,
  #[serde(alias = "subject_ids", deserialize_with = "de::integer")]
  pub subject_id:     SubjectId,
  #[serde(rename = "annotation", alias = "annotations")]
  pub raw_annotation: serde_json::Value,
  /// Volunteer identifier; numeric for logged-in users, a string otherwise.
  #[serde(default, deserialize_with = "de::optional_text")]
  pub user_id:        Option<String>,
  /// Survey object name (e.g. a ZTF id) depicted by the subject.
  #[serde(default, deserialize_with = "de::optional_text")]
  pub object_id:      Option<String>,
}

impl ClassificationEvent {
  pub fn new(
    id: ClassificationId,
    subject_id: SubjectId,
    raw_annotation: serde_json::Value,
  ) -> Self {
    Self {
      id,
      subject_id,
      raw_annotation,
      user_id: None,
      object_id: None,
    }
  }
}

// ─── Persisted classifications ───────────────────────────────────────────────

/// Input to [`crate::store::TallyStore::insert_classification`] and
/// [`crate::store::TallyStore::record_classification`].
/// `recorded_at` is always set by the store.
#[derive(Debug, Clone)]
pub struct NewClassification {
  pub id:         ClassificationId,
  pub subject_id: SubjectId,
  pub label:      Label,
  pub user_id:    Option<String>,
  pub object_id:  Option<String>,
}

impl NewClassification {
  /// Convenience constructor with no provenance fields.
  pub fn new(id: ClassificationId, subject_id: SubjectId, label: Label) -> Self {
    Self {
      id,
      subject_id,
      label,
      user_id: None,
      object_id: None,
    }
  }

  /// Pair an event with the label parsed from its annotation.
  pub fn from_event(event: &ClassificationEvent, label: Label) -> Self {
    Self {
      id: event.id,
      subject_id: event.subject_id,
      label,
      user_id: event.user_id.clone(),
      object_id: event.object_id.clone(),
    }
  }
}

/// A classification row as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredClassification {
  pub id:          ClassificationId,
  pub subject_id:  SubjectId,
  pub label:       Label,
  pub user_id:     Option<String>,
  pub object_id:   Option<String>,
  pub recorded_at: DateTime<Utc>,
  /// Set once the row has been folded into (or skipped by) its aggregate.
  pub outcome:     Option<ApplyResult>,
}

impl StoredClassification {
  pub fn processed(&self) -> bool { self.outcome.is_some() }
}

mod de {
  use serde::{Deserialize, Deserializer, de::Error as _};

  #[derive(Deserialize)]
  #[serde(untagged)]
  enum NumberOrText {
    Number(i64),
    Text(String),
  }

  /// Accept `42` or `"42"`.
  pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match NumberOrText::deserialize(d)? {
      NumberOrText::Number(n) => Ok(n),
      NumberOrText::Text(s) => s
        .trim()
        .parse()
        .map_err(|_| D::Error::custom(format!("expected an integer, got {s:?}"))),
    }
  }

  /// Accept a number, a string, or null; empty strings become `None`.
  pub fn optional_text<'de, D: Deserializer<'de>>(
    d: D,
  ) -> Result<Option<String>, D::Error> {
    Ok(match Option::<NumberOrText>::deserialize(d)? {
      None => None,
      Some(NumberOrText::Number(n)) => Some(n.to_string()),
      Some(NumberOrText::Text(s)) if s.trim().is_empty() => None,
      Some(NumberOrText::Text(s)) => Some(s),
    })
  }
}
