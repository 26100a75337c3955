//! Contracts for the engine's external collaborators.
//!
//! Events come in through an [`EventSource`]; retired subjects go out
//! through a [`RetirementSink`] and a [`ResultsSink`]. Delivery to either
//! sink is at-least-once; idempotency is the sink's concern.

use std::{future::Future, time::Duration};

use crate::{
  classification::{ClassificationEvent, ClassificationId},
  subject::{SubjectId, VoteFractions},
};

/// A stream of classification events delivered in batches.
///
/// Delivery is at-least-once: the same event id may arrive more than once.
pub trait EventSource: Send {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Position the stream just after `last_id`, the highest id already
  /// persisted. Called once before the first poll.
  fn resume_after(
    &mut self,
    last_id: ClassificationId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Wait up to `timeout` for the next batch. An empty batch means no data
  /// arrived in time and is not an error.
  ///
  /// Must be cancel-safe: dropping the returned future loses no events.
  fn poll(
    &mut self,
    timeout: Duration,
  ) -> impl Future<Output = Result<Vec<ClassificationEvent>, Self::Error>> + Send + '_;
}

/// Receives the ids of subjects that should be finalised upstream.
pub trait RetirementSink: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn retire<'a>(
    &'a self,
    subject_ids: &'a [SubjectId],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Receives the vote fractions of each retired subject.
pub trait ResultsSink: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn report<'a>(
    &'a self,
    fractions: &'a VoteFractions,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
