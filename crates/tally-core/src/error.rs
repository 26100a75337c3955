//! Error types for `tally-core`.

use thiserror::Error;

/// Why a raw annotation payload could not be turned into a
/// [`Label`](crate::classification::Label).
///
/// A parse error only ever rejects the single event it came from.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error("missing required answer for task {0}")]
  MissingRequiredAnswer(&'static str),

  #[error("invalid answer for task {task}: {value}")]
  InvalidAnswer {
    task:  &'static str,
    value: serde_json::Value,
  },

  #[error("malformed annotation payload: {0}")]
  MalformedPayload(String),

  #[error("annotation is not valid json: {0}")]
  Json(#[from] serde_json::Error),
}
