//! Error type for `tally-store-sqlite`.

use tally_core::{classification::ClassificationId, subject::SubjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored answer column could not be decoded.
  #[error("invalid stored answer: {0:?}")]
  InvalidAnswer(String),

  #[error("unknown classification outcome: {0:?}")]
  UnknownOutcome(String),

  #[error("classification not found: {0}")]
  ClassificationNotFound(ClassificationId),

  #[error("classification {0} is already processed")]
  AlreadyProcessed(ClassificationId),

  #[error("classification {id} belongs to subject {stored}, not {requested}")]
  SubjectMismatch {
    id:        ClassificationId,
    stored:    SubjectId,
    requested: SubjectId,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
