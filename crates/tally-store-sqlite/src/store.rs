//! [`SqliteStore`], the SQLite implementation of [`TallyStore`].

use std::{collections::BTreeSet, path::Path};

use chrono::Utc;
use rusqlite::{OptionalExtension as _, Transaction};
use tally_core::{
  classification::{ClassificationId, Label, NewClassification, StoredClassification},
  store::TallyStore,
  subject::{
    ApplyResult, Inconsistency, RecordOutcome, SubjectAggregate, SubjectId, Tally,
  },
};

use crate::{
  encode::{
    RawClassification, RawSubject, decode_label, encode_answer, encode_dt, encode_outcome,
  },
  schema::SCHEMA,
  Error, Result,
};

/// Relative tolerance when comparing stored tallies against recomputed ones.
const TALLY_EPSILON: f64 = 1e-9;

// ─── Transaction helpers ─────────────────────────────────────────────────────

/// A classification row ready to be written, with every column pre-encoded.
struct InsertRow {
  id:          ClassificationId,
  subject_id:  SubjectId,
  t0:          String,
  t1:          Option<String>,
  user_id:     Option<String>,
  object_id:   Option<String>,
  recorded_at: String,
}

impl InsertRow {
  fn new(input: &NewClassification, recorded_at: &str) -> Self {
    Self {
      id:          input.id,
      subject_id:  input.subject_id,
      t0:          encode_answer(input.label.t0),
      t1:          input.label.t1.map(encode_answer),
      user_id:     input.user_id.clone(),
      object_id:   input.object_id.clone(),
      recorded_at: recorded_at.to_owned(),
    }
  }
}

/// What a label adds to its subject's aggregate.
struct Contribution {
  classification_id: ClassificationId,
  subject_id:        SubjectId,
  t0:                f64,
  t1:                f64,
  at:                String,
}

impl Contribution {
  fn new(classification_id: ClassificationId, subject_id: SubjectId, label: &Label, at: &str) -> Self {
    Self {
      classification_id,
      subject_id,
      t0: label.contribution_t0(),
      t1: label.contribution_t1(),
      at: at.to_owned(),
    }
  }
}

enum ApplyStep {
  Missing,
  AlreadyProcessed,
  WrongSubject(SubjectId),
  Applied(ApplyResult),
}

impl ApplyStep {
  fn into_result(self, id: ClassificationId, subject_id: SubjectId) -> Result<ApplyResult> {
    match self {
      Self::Applied(r) => Ok(r),
      Self::Missing => Err(Error::ClassificationNotFound(id)),
      Self::AlreadyProcessed => Err(Error::AlreadyProcessed(id)),
      Self::WrongSubject(stored) => Err(Error::SubjectMismatch {
        id,
        stored,
        requested: subject_id,
      }),
    }
  }
}

/// Returns `false` if the id was already present.
fn insert_in_tx(tx: &Transaction<'_>, row: &InsertRow) -> rusqlite::Result<bool> {
  let changed = tx.execute(
    "INSERT OR IGNORE INTO classifications (
       id, subject_id, t0, t1, user_id, object_id, processed, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
    rusqlite::params![
      row.id,
      row.subject_id,
      row.t0,
      row.t1,
      row.user_id,
      row.object_id,
      row.recorded_at,
    ],
  )?;
  Ok(changed == 1)
}

/// Fold one classification into its aggregate and mark the row processed.
/// The caller commits only on [`ApplyStep::Applied`].
fn apply_in_tx(tx: &Transaction<'_>, c: &Contribution) -> rusqlite::Result<ApplyStep> {
  let row: Option<(SubjectId, bool, Option<String>)> = tx
    .query_row(
      "SELECT subject_id, processed, object_id FROM classifications WHERE id = ?1",
      rusqlite::params![c.classification_id],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()?;

  let Some((stored_subject, processed, object_id)) = row else {
    return Ok(ApplyStep::Missing);
  };
  if stored_subject != c.subject_id {
    return Ok(ApplyStep::WrongSubject(stored_subject));
  }
  if processed {
    return Ok(ApplyStep::AlreadyProcessed);
  }

  let retired: Option<bool> = tx
    .query_row(
      "SELECT retired FROM subjects WHERE subject_id = ?1",
      rusqlite::params![c.subject_id],
      |r| r.get(0),
    )
    .optional()?;

  let result = match retired {
    None => {
      tx.execute(
        "INSERT INTO subjects (
           subject_id, object_id, tally_t0, tally_t1,
           classification_count, retired, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)",
        rusqlite::params![c.subject_id, object_id, c.t0, c.t1, c.at],
      )?;
      ApplyResult::Created
    }
    Some(true) => ApplyResult::SkippedBecauseRetired,
    Some(false) => {
      tx.execute(
        "UPDATE subjects SET
           tally_t0             = tally_t0 + ?2,
           tally_t1             = tally_t1 + ?3,
           classification_count = classification_count + 1,
           object_id            = COALESCE(object_id, ?4),
           updated_at           = ?5
         WHERE subject_id = ?1 AND retired = 0",
        rusqlite::params![c.subject_id, c.t0, c.t1, object_id, c.at],
      )?;
      ApplyResult::Updated
    }
  };

  tx.execute(
    "UPDATE classifications SET processed = 1, outcome = ?2 WHERE id = ?1",
    rusqlite::params![c.classification_id, encode_outcome(result)],
  )?;

  Ok(ApplyStep::Applied(result))
}

fn differs(stored: f64, expected: f64) -> bool {
  (stored - expected).abs() > TALLY_EPSILON * expected.abs().max(1.0)
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A tally store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Clones
/// share one connection, so they still form a single writer.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  /// Opening an existing store keeps its contents.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    tracing::debug!(path = %path.display(), "opened tally store");
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn connection(&self) -> &tokio_rusqlite::Connection { &self.conn }
}

// ─── TallyStore impl ─────────────────────────────────────────────────────────

impl TallyStore for SqliteStore {
  type Error = Error;

  // ── Resumption ────────────────────────────────────────────────────────────

  async fn recover(&self) -> Result<ClassificationId> {
    let max = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          "SELECT COALESCE(MAX(id), 0) FROM classifications",
          [],
          |r| r.get::<_, ClassificationId>(0),
        )?)
      })
      .await?;
    Ok(max)
  }

  // ── Classifications ───────────────────────────────────────────────────────

  async fn has_classification(&self, id: ClassificationId) -> Result<bool> {
    let exists = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT 1 FROM classifications WHERE id = ?1",
            rusqlite::params![id],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false))
      })
      .await?;
    Ok(exists)
  }

  async fn insert_classification(&self, input: NewClassification) -> Result<bool> {
    let row = InsertRow::new(&input, &encode_dt(Utc::now()));

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = insert_in_tx(&tx, &row)?;
        tx.commit()?;
        Ok(inserted)
      })
      .await?;
    Ok(inserted)
  }

  async fn apply_to_subject(
    &self,
    classification_id: ClassificationId,
    subject_id:        SubjectId,
    label:             Label,
  ) -> Result<ApplyResult> {
    let contribution =
      Contribution::new(classification_id, subject_id, &label, &encode_dt(Utc::now()));

    let step = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let step = apply_in_tx(&tx, &contribution)?;
        if matches!(step, ApplyStep::Applied(_)) {
          tx.commit()?;
        }
        Ok(step)
      })
      .await?;

    step.into_result(classification_id, subject_id)
  }

  async fn record_classification(&self, input: NewClassification) -> Result<RecordOutcome> {
    let now          = encode_dt(Utc::now());
    let row          = InsertRow::new(&input, &now);
    let contribution = Contribution::new(input.id, input.subject_id, &input.label, &now);

    let step = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !insert_in_tx(&tx, &row)? {
          return Ok(None);
        }
        let step = apply_in_tx(&tx, &contribution)?;
        if matches!(step, ApplyStep::Applied(_)) {
          tx.commit()?;
        }
        Ok(Some(step))
      })
      .await?;

    match step {
      None => Ok(RecordOutcome::Duplicate),
      Some(step) => Ok(RecordOutcome::Applied(
        step.into_result(input.id, input.subject_id)?,
      )),
    }
  }

  async fn unprocessed_classifications(&self) -> Result<Vec<StoredClassification>> {
    let raws: Vec<RawClassification> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM classifications WHERE processed = 0 ORDER BY id",
          RawClassification::COLUMNS
        ))?;
        let rows = stmt
          .query_map([], RawClassification::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(RawClassification::into_classification)
      .collect()
  }

  // ── Retirement ────────────────────────────────────────────────────────────

  async fn subjects_meeting_threshold(
    &self,
    candidates: &[SubjectId],
    threshold:  u32,
  ) -> Result<BTreeSet<SubjectId>> {
    let candidates = candidates.to_vec();

    let found = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT 1 FROM subjects
           WHERE subject_id = ?1 AND retired = 0 AND classification_count >= ?2",
        )?;
        let mut found = BTreeSet::new();
        for id in candidates {
          if stmt.exists(rusqlite::params![id, threshold])? {
            found.insert(id);
          }
        }
        Ok(found)
      })
      .await?;
    Ok(found)
  }

  async fn retirement_candidates(&self, threshold: u32) -> Result<BTreeSet<SubjectId>> {
    let found = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT subject_id FROM subjects
           WHERE retired = 0 AND classification_count >= ?1",
        )?;
        let ids = stmt
          .query_map(rusqlite::params![threshold], |r| r.get::<_, SubjectId>(0))?
          .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(found)
  }

  async fn mark_retired(&self, subject_ids: &[SubjectId]) -> Result<BTreeSet<SubjectId>> {
    let subject_ids = subject_ids.to_vec();
    let at          = encode_dt(Utc::now());

    let transitioned = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut transitioned = BTreeSet::new();
        {
          let mut stmt = tx.prepare(
            "UPDATE subjects SET retired = 1, retired_at = ?2
             WHERE subject_id = ?1 AND retired = 0",
          )?;
          for id in subject_ids {
            if stmt.execute(rusqlite::params![id, at])? == 1 {
              transitioned.insert(id);
            }
          }
        }
        tx.commit()?;
        Ok(transitioned)
      })
      .await?;
    Ok(transitioned)
  }

  // ── Export ────────────────────────────────────────────────────────────────

  async fn read_tally(&self, subject_id: SubjectId) -> Result<Option<Tally>> {
    let tally = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT subject_id, object_id, tally_t0, tally_t1, classification_count
             FROM subjects WHERE subject_id = ?1",
            rusqlite::params![subject_id],
            |r| {
              Ok(Tally {
                subject_id:           r.get(0)?,
                object_id:            r.get(1)?,
                tally_t0:             r.get(2)?,
                tally_t1:             r.get(3)?,
                classification_count: r.get(4)?,
              })
            },
          )
          .optional()?)
      })
      .await?;
    Ok(tally)
  }

  async fn unexported_retirements(&self) -> Result<Vec<SubjectId>> {
    let ids = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT subject_id FROM subjects
           WHERE retired = 1 AND exported_at IS NULL
           ORDER BY subject_id",
        )?;
        let ids = stmt
          .query_map([], |r| r.get::<_, SubjectId>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
      })
      .await?;
    Ok(ids)
  }

  async fn mark_exported(&self, subject_ids: &[SubjectId]) -> Result<()> {
    let subject_ids = subject_ids.to_vec();
    let at          = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "UPDATE subjects SET exported_at = ?2
             WHERE subject_id = ?1 AND retired = 1 AND exported_at IS NULL",
          )?;
          for id in subject_ids {
            stmt.execute(rusqlite::params![id, at])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Reads & integrity ─────────────────────────────────────────────────────

  async fn get_subject(&self, subject_id: SubjectId) -> Result<Option<SubjectAggregate>> {
    let raw: Option<RawSubject> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {} FROM subjects WHERE subject_id = ?1", RawSubject::COLUMNS),
            rusqlite::params![subject_id],
            RawSubject::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawSubject::into_aggregate).transpose()
  }

  async fn audit_subjects(&self, subject_ids: &[SubjectId]) -> Result<Vec<Inconsistency>> {
    type Stored  = Option<(u32, f64, f64)>;
    type Counted = Vec<(String, Option<String>)>;

    let subject_ids = subject_ids.to_vec();

    let raws: Vec<(SubjectId, Stored, Counted)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(subject_ids.len());
        {
          let mut aggregate = tx.prepare(
            "SELECT classification_count, tally_t0, tally_t1
             FROM subjects WHERE subject_id = ?1",
          )?;
          let mut counted = tx.prepare(
            "SELECT t0, t1 FROM classifications
             WHERE subject_id = ?1 AND outcome IN ('created', 'updated')",
          )?;
          for id in subject_ids {
            let stored: Stored = aggregate
              .query_row(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
              .optional()?;
            let rows: Counted = counted
              .query_map(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
              .collect::<rusqlite::Result<Vec<_>>>()?;
            out.push((id, stored, rows));
          }
        }
        tx.commit()?;
        Ok(out)
      })
      .await?;

    let mut findings = Vec::new();
    for (subject_id, stored, rows) in raws {
      let mut expected_t0 = 0.0;
      let mut expected_t1 = 0.0;
      for (t0, t1) in &rows {
        let label = decode_label(t0, t1.as_deref())?;
        expected_t0 += label.contribution_t0();
        expected_t1 += label.contribution_t1();
      }
      let expected_count = u32::try_from(rows.len()).unwrap_or(u32::MAX);
      let (stored_count, stored_t0, stored_t1) = stored.unwrap_or((0, 0.0, 0.0));

      if stored_count != expected_count
        || differs(stored_t0, expected_t0)
        || differs(stored_t1, expected_t1)
      {
        findings.push(Inconsistency {
          subject_id,
          stored_count,
          expected_count,
          stored_t0,
          expected_t0,
          stored_t1,
          expected_t1,
        });
      }
    }
    Ok(findings)
  }
}
