//! The ingestion loop.
//!
//! ```text
//! Starting ──▶ Polling ──▶ Draining ──▶ Polling ...
//!                 │  ▲
//!                 ▼  │
//!            BackingOff          (any) ──shutdown──▶ Stopping
//! ```
//!
//! Events are applied strictly in arrival order by a single consumer.
//! Shutdown is only observed between batches, so a batch in flight is
//! always finished before the loop exits.

use std::{collections::BTreeSet, future::Future, time::Duration};

use tally_core::{
  ParseError,
  classification::{ClassificationEvent, ClassificationId, NewClassification},
  io::{EventSource, ResultsSink, RetirementSink},
  store::TallyStore,
  subject::{ApplyResult, RecordOutcome, SubjectId},
};
use tracing::{debug, error, info, warn};

use crate::{
  EngineConfig, Error, ExportDispatcher, Result, StoreFailurePolicy, evaluate::evaluate,
};

/// Pause between store retries under [`StoreFailurePolicy::Retry`].
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Running counters for one engine lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
  pub batches:         u64,
  /// Events stored, including those that hit an already-retired subject.
  pub accepted:        u64,
  pub skipped_retired: u64,
  pub duplicates:      u64,
  /// Events whose annotation could not be parsed.
  pub rejected:        u64,
  /// Events lost to a store failure under [`StoreFailurePolicy::Skip`].
  pub dropped:         u64,
  pub retired:         u64,
}

enum Phase {
  Starting,
  Polling,
  BackingOff,
  Draining(Vec<ClassificationEvent>),
  Stopping,
}

enum EventOutcome {
  Duplicate,
  Rejected(ParseError),
  Applied(ApplyResult),
}

/// Ties a store, an event source and the export sinks together.
pub struct Engine<S, E, R, P> {
  store:      S,
  source:     E,
  dispatcher: ExportDispatcher<R, P>,
  config:     EngineConfig,
  watermark:  ClassificationId,
  stats:      IngestStats,
}

impl<S, E, R, P> Engine<S, E, R, P>
where
  S: TallyStore,
  E: EventSource,
  R: RetirementSink,
  P: ResultsSink,
{
  pub fn new(
    store:      S,
    source:     E,
    dispatcher: ExportDispatcher<R, P>,
    config:     EngineConfig,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      source,
      dispatcher,
      config,
      watermark: 0,
      stats: IngestStats::default(),
    })
  }

  pub fn store(&self) -> &S { &self.store }

  /// Highest event id applied by this process. Informational only: the
  /// resume point is always recomputed from the store at startup.
  pub fn watermark(&self) -> ClassificationId { self.watermark }

  pub fn stats(&self) -> IngestStats { self.stats }

  /// Run until `shutdown` resolves or a fatal error occurs.
  pub async fn run<F>(&mut self, shutdown: F) -> Result<IngestStats>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(shutdown);
    let timeout = self.config.poll_timeout();
    let mut phase = Phase::Starting;

    loop {
      phase = match phase {
        Phase::Starting => {
          self.start().await?;
          Phase::Polling
        }
        Phase::Polling => tokio::select! {
          biased;
          () = &mut shutdown => Phase::Stopping,
          polled = self.source.poll(timeout) => match polled {
            Ok(batch) if batch.is_empty() => Phase::Polling,
            Ok(batch) => Phase::Draining(batch),
            Err(e) => {
              warn!(error = %e, "event source poll failed; backing off");
              Phase::BackingOff
            }
          },
        },
        Phase::BackingOff => tokio::select! {
          biased;
          () = &mut shutdown => Phase::Stopping,
          () = tokio::time::sleep(timeout) => Phase::Polling,
        },
        Phase::Draining(batch) => {
          self.process_batch(batch).await?;
          Phase::Polling
        }
        Phase::Stopping => {
          info!(watermark = self.watermark, stats = ?self.stats, "ingestion stopped");
          return Ok(self.stats);
        }
      };
    }
  }

  async fn start(&mut self) -> Result<()> {
    let last = self.store.recover().await.map_err(Error::store)?;
    self.watermark = last;
    info!(
      last_processed_id = last,
      threshold = self.config.threshold,
      "resuming classification stream"
    );
    self
      .source
      .resume_after(last)
      .await
      .map_err(Error::event_source)?;

    if self.config.reconcile_on_startup {
      self.reconcile().await?;
    }
    Ok(())
  }

  /// Repair anything an earlier, interrupted run left behind:
  ///
  /// 1. fold classification rows that were stored but never applied;
  /// 2. retire every subject already at the threshold;
  /// 3. export every retired subject the sinks never acknowledged.
  ///
  /// Returns the subjects retired by this pass.
  pub async fn reconcile(&mut self) -> Result<BTreeSet<SubjectId>> {
    let pending = self
      .store
      .unprocessed_classifications()
      .await
      .map_err(Error::store)?;
    if !pending.is_empty() {
      info!(count = pending.len(), "applying classifications left unprocessed");
    }
    for row in pending {
      let result = self
        .store
        .apply_to_subject(row.id, row.subject_id, row.label)
        .await
        .map_err(Error::store)?;
      debug!(event_id = row.id, subject_id = row.subject_id, ?result, "applied leftover classification");
    }

    let overdue: Vec<SubjectId> = self
      .store
      .retirement_candidates(self.config.threshold)
      .await
      .map_err(Error::store)?
      .into_iter()
      .collect();
    let retired = evaluate(&self.store, &overdue, self.config.threshold).await?;
    self.stats.retired += retired.len() as u64;

    let unexported = self
      .store
      .unexported_retirements()
      .await
      .map_err(Error::store)?;
    if !unexported.is_empty() {
      info!(count = unexported.len(), "exporting retired subjects not yet delivered");
      self.dispatcher.dispatch(&self.store, &unexported).await?;
    }

    Ok(retired)
  }

  /// Apply one batch in arrival order, then retire and export whatever it
  /// pushed over the threshold. Returns the subjects retired.
  pub async fn process_batch(
    &mut self,
    batch: Vec<ClassificationEvent>,
  ) -> Result<BTreeSet<SubjectId>> {
    self.stats.batches += 1;
    let mut touched = BTreeSet::new();

    for event in &batch {
      let Some(outcome) = self.ingest_with_policy(event).await? else {
        self.stats.dropped += 1;
        continue;
      };
      match outcome {
        EventOutcome::Duplicate => {
          debug!(event_id = event.id, "skipping duplicate classification");
          self.stats.duplicates += 1;
        }
        EventOutcome::Rejected(e) => {
          warn!(
            event_id = event.id,
            subject_id = event.subject_id,
            error = %e,
            "skipping malformed classification"
          );
          self.stats.rejected += 1;
        }
        EventOutcome::Applied(result) => {
          debug!(event_id = event.id, subject_id = event.subject_id, ?result, "applied classification");
          self.stats.accepted += 1;
          if result == ApplyResult::SkippedBecauseRetired {
            self.stats.skipped_retired += 1;
          }
          touched.insert(event.subject_id);
          self.watermark = self.watermark.max(event.id);
        }
      }
    }

    if touched.is_empty() {
      return Ok(BTreeSet::new());
    }

    let retired = self.retire_and_export(&touched).await;
    match retired {
      Err(e) if !e.is_fatal() && self.config.store_failure_policy == StoreFailurePolicy::Skip => {
        // Subjects left unretired are re-evaluated, and retired but
        // unexported ones re-dispatched, when next touched or at startup.
        error!(error = %e, "retirement round failed");
        Ok(BTreeSet::new())
      }
      other => other,
    }
  }

  async fn retire_and_export(
    &mut self,
    touched: &BTreeSet<SubjectId>,
  ) -> Result<BTreeSet<SubjectId>> {
    let ids: Vec<SubjectId> = touched.iter().copied().collect();
    let retired = evaluate(&self.store, &ids, self.config.threshold).await?;
    self.stats.retired += retired.len() as u64;

    // Touched subjects retired earlier whose export never completed.
    let pending: BTreeSet<SubjectId> = self
      .store
      .unexported_retirements()
      .await
      .map_err(Error::store)?
      .into_iter()
      .filter(|id| touched.contains(id) && !retired.contains(id))
      .collect();
    if !pending.is_empty() {
      info!(count = pending.len(), "re-dispatching touched subjects not yet exported");
    }

    let due: Vec<SubjectId> = retired.union(&pending).copied().collect();
    if !due.is_empty() {
      self.dispatcher.dispatch(&self.store, &due).await?;
    }
    Ok(retired)
  }

  /// Runs [`Self::ingest_event`] under the configured failure policy.
  /// `Ok(None)` means the event was dropped.
  async fn ingest_with_policy(
    &self,
    event: &ClassificationEvent,
  ) -> Result<Option<EventOutcome>> {
    let attempts = self.config.store_attempts();
    let mut attempt = 1;

    loop {
      let e = match self.ingest_event(event).await {
        Ok(outcome) => return Ok(Some(outcome)),
        Err(e) => e,
      };

      if attempt < attempts {
        warn!(event_id = event.id, attempt, error = %e, "store write failed; retrying");
        attempt += 1;
        tokio::time::sleep(RETRY_DELAY).await;
        continue;
      }

      return match self.config.store_failure_policy {
        StoreFailurePolicy::Skip => {
          error!(
            event_id = event.id,
            subject_id = event.subject_id,
            error = %e,
            "store write failed; dropping classification"
          );
          Ok(None)
        }
        StoreFailurePolicy::Retry | StoreFailurePolicy::Halt => {
          error!(event_id = event.id, error = %e, "store write failed; halting");
          Err(Error::store(e))
        }
      };
    }
  }

  async fn ingest_event(
    &self,
    event: &ClassificationEvent,
  ) -> Result<EventOutcome, S::Error> {
    if self.store.has_classification(event.id).await? {
      return Ok(EventOutcome::Duplicate);
    }

    let label = match tally_core::parse(&event.raw_annotation) {
      Ok(label) => label,
      Err(e) => return Ok(EventOutcome::Rejected(e)),
    };

    let outcome = self
      .store
      .record_classification(NewClassification::from_event(event, label))
      .await?;

    Ok(match outcome {
      RecordOutcome::Duplicate => EventOutcome::Duplicate,
      RecordOutcome::Applied(result) => EventOutcome::Applied(result),
    })
  }
}
