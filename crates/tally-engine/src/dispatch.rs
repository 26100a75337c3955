//! Export of retired subjects to the downstream sinks.

use tally_core::{
  io::{ResultsSink, RetirementSink},
  store::TallyStore,
  subject::{SubjectId, Tally, VoteFractions},
};
use tracing::{error, info, warn};

use crate::{Error, Result};

/// What happened to one dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
  /// The retirement sink accepted the batch.
  pub retire_delivered: bool,
  /// Subjects the results sink accepted.
  pub reported:         Vec<SubjectId>,
  /// Subjects the results sink rejected.
  pub failed:           Vec<SubjectId>,
  /// Subjects recorded as exported in the store.
  pub exported:         Vec<SubjectId>,
}

/// Sends retired subjects to the retirement sink (one batched call) and
/// their vote fractions to the results sink (one call per subject).
///
/// Each call is attempted once. A failed call is logged and leaves the
/// subject pending export; it never undoes the retirement itself.
pub struct ExportDispatcher<R, P> {
  retirement: R,
  results:    P,
}

impl<R: RetirementSink, P: ResultsSink> ExportDispatcher<R, P> {
  pub fn new(retirement: R, results: P) -> Self { Self { retirement, results } }

  pub async fn dispatch<S: TallyStore>(
    &self,
    store:   &S,
    retired: &[SubjectId],
  ) -> Result<DispatchReport> {
    if retired.is_empty() {
      return Ok(DispatchReport::default());
    }

    let mut fractions: Vec<VoteFractions> = Vec::with_capacity(retired.len());
    for &subject_id in retired {
      let tally = store.read_tally(subject_id).await.map_err(Error::store)?;
      let f = tally
        .as_ref()
        .and_then(Tally::fractions)
        .ok_or(Error::EmptyRetiredSubject(subject_id))?;
      fractions.push(f);
    }

    let mut report = DispatchReport::default();

    match self.retirement.retire(retired).await {
      Ok(()) => report.retire_delivered = true,
      Err(e) => error!(count = retired.len(), error = %e, "retirement sink rejected batch"),
    }

    for f in &fractions {
      match self.results.report(f).await {
        Ok(()) => report.reported.push(f.subject_id),
        Err(e) => {
          error!(subject_id = f.subject_id, error = %e, "results sink rejected subject");
          report.failed.push(f.subject_id);
        }
      }
    }

    if report.retire_delivered && !report.reported.is_empty() {
      match store.mark_exported(&report.reported).await {
        Ok(()) => report.exported = report.reported.clone(),
        // Left pending; startup reconciliation exports them again.
        Err(e) => warn!(error = %e, "could not record export"),
      }
    }

    info!(
      retired   = retired.len(),
      reported  = report.reported.len(),
      failed    = report.failed.len(),
      delivered = report.retire_delivered,
      "dispatched retired subjects"
    );
    Ok(report)
  }
}
