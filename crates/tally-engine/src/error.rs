//! Error type for `tally-engine`.

use tally_core::subject::{Inconsistency, SubjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("event source error: {0}")]
  Source(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// The store disagrees with itself; continuing would let tallies drift.
  #[error("store corruption detected: {}", describe(.0))]
  Corruption(Vec<Inconsistency>),

  /// A retired subject has no usable aggregate to export.
  #[error("retired subject {0} has no classifications to export")]
  EmptyRetiredSubject(SubjectId),
}

impl Error {
  pub(crate) fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }

  pub(crate) fn event_source(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Source(Box::new(e))
  }

  /// Whether the engine must stop rather than carry on.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::Corruption(_) | Self::EmptyRetiredSubject(_))
  }
}

fn describe(findings: &[Inconsistency]) -> String {
  findings
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
