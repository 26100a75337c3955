//! JSON-lines adapters for the engine's external interfaces.
//!
//! The event source tails a spool file of classification events, one JSON
//! object per line. The sinks append one JSON object per call.

use std::{
  io::SeekFrom,
  path::{Path, PathBuf},
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{
  classification::{ClassificationEvent, ClassificationId},
  io::{EventSource, ResultsSink, RetirementSink},
  subject::{SubjectId, VoteFractions},
};
use thiserror::Error;
use tokio::{
  fs::{File, OpenOptions},
  io::{AsyncBufReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _, BufReader},
  time::Instant,
};
use tracing::warn;

/// How often an idle source re-checks its spool file.
const IDLE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum JsonlError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

// ─── Event source ────────────────────────────────────────────────────────────

/// Tails a newline-delimited JSON file of [`ClassificationEvent`]s.
///
/// Only complete lines are consumed; a partially written last line is left
/// for the next poll. Unreadable lines are logged and skipped.
pub struct JsonlEventSource {
  path:       PathBuf,
  batch_size: usize,
  /// Byte offset of the first unconsumed line.
  offset:     u64,
  /// Events at or below this id are already persisted.
  after:      ClassificationId,
}

impl JsonlEventSource {
  pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Self {
    Self {
      path: path.into(),
      batch_size: batch_size.max(1),
      offset: 0,
      after: 0,
    }
  }

  /// Read up to `batch_size` new events, one line at a time. All awaits
  /// happen before any state changes, so dropping the future mid-read loses
  /// nothing.
  async fn read_available(&mut self) -> Result<Vec<ClassificationEvent>, JsonlError> {
    let mut file = match File::open(&self.path).await {
      Ok(f) => f,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let len = file.metadata().await?.len();
    let start = if len < self.offset {
      warn!(path = %self.path.display(), "event spool shrank; rereading from the start");
      0
    } else {
      self.offset
    };

    file.seek(SeekFrom::Start(start)).await?;
    let mut reader = BufReader::new(file);

    let mut consumed = 0u64;
    let mut events = Vec::new();
    let mut line = Vec::new();
    while events.len() < self.batch_size {
      line.clear();
      let n = reader.read_until(b'\n', &mut line).await?;
      // A line without its newline is still being written.
      if n == 0 || !line.ends_with(b"\n") {
        break;
      }
      let line_offset = start + consumed;
      consumed += n as u64;

      let text = match std::str::from_utf8(&line) {
        Ok(text) => text.trim(),
        Err(e) => {
          warn!(
            path = %self.path.display(),
            offset = line_offset,
            error = %e,
            "skipping event line that is not valid utf-8"
          );
          continue;
        }
      };
      if text.is_empty() {
        continue;
      }
      match serde_json::from_str::<ClassificationEvent>(text) {
        Ok(event) if event.id <= self.after => {}
        Ok(event) => events.push(event),
        Err(e) => warn!(
          path = %self.path.display(),
          offset = line_offset,
          error = %e,
          "skipping unreadable event line"
        ),
      }
    }

    self.offset = start + consumed;
    Ok(events)
  }
}

impl EventSource for JsonlEventSource {
  type Error = JsonlError;

  async fn resume_after(&mut self, last_id: ClassificationId) -> Result<(), JsonlError> {
    self.after = last_id;
    self.offset = 0;
    Ok(())
  }

  async fn poll(&mut self, timeout: Duration) -> Result<Vec<ClassificationEvent>, JsonlError> {
    let deadline = Instant::now() + timeout;
    loop {
      let batch = self.read_available().await?;
      let now = Instant::now();
      if !batch.is_empty() || now >= deadline {
        return Ok(batch);
      }
      tokio::time::sleep(IDLE_INTERVAL.min(deadline - now)).await;
    }
  }
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

async fn append_line(path: &Path, mut line: Vec<u8>) -> Result<(), JsonlError> {
  line.push(b'\n');
  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .await?;
  file.write_all(&line).await?;
  file.flush().await?;
  Ok(())
}

#[derive(Serialize)]
struct RetirementRecord<'a> {
  subject_ids: &'a [SubjectId],
  retired_at:  DateTime<Utc>,
}

#[derive(Serialize)]
struct ResultRecord<'a> {
  #[serde(flatten)]
  fractions:   &'a VoteFractions,
  reported_at: DateTime<Utc>,
}

/// Appends one `{"subject_ids": [...], "retired_at": ...}` line per batch.
pub struct JsonlRetirementSink {
  path: PathBuf,
}

impl JsonlRetirementSink {
  pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

impl RetirementSink for JsonlRetirementSink {
  type Error = JsonlError;

  async fn retire(&self, subject_ids: &[SubjectId]) -> Result<(), JsonlError> {
    let line = serde_json::to_vec(&RetirementRecord {
      subject_ids,
      retired_at: Utc::now(),
    })?;
    append_line(&self.path, line).await
  }
}

/// Appends one line of vote fractions per retired subject.
pub struct JsonlResultsSink {
  path: PathBuf,
}

impl JsonlResultsSink {
  pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

impl ResultsSink for JsonlResultsSink {
  type Error = JsonlError;

  async fn report(&self, fractions: &VoteFractions) -> Result<(), JsonlError> {
    let line = serde_json::to_vec(&ResultRecord {
      fractions,
      reported_at: Utc::now(),
    })?;
    append_line(&self.path, line).await
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  async fn write_lines(path: &Path, lines: &[serde_json::Value]) {
    let mut text = String::new();
    for l in lines {
      text.push_str(&l.to_string());
      text.push('\n');
    }
    tokio::fs::write(path, text).await.unwrap();
  }

  fn event(id: i64, subject_id: i64) -> serde_json::Value {
    json!({ "id": id, "subject_id": subject_id, "annotation": { "T0": 1 } })
  }

  #[tokio::test]
  async fn source_skips_persisted_ids_and_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    write_lines(&path, &[event(1, 10), json!({ "nope": true }), event(2, 10), event(3, 11)]).await;

    let mut source = JsonlEventSource::new(&path, 10);
    source.resume_after(1).await.unwrap();
    let batch = source.poll(Duration::from_millis(10)).await.unwrap();

    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
  }

  #[tokio::test]
  async fn source_respects_batch_size_and_keeps_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    write_lines(&path, &[event(1, 10), event(2, 10), event(3, 10)]).await;

    let mut source = JsonlEventSource::new(&path, 2);
    let first = source.poll(Duration::from_millis(10)).await.unwrap();
    let second = source.poll(Duration::from_millis(10)).await.unwrap();
    let third = source.poll(Duration::from_millis(10)).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
    assert!(third.is_empty());
  }

  #[tokio::test]
  async fn source_waits_for_complete_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    tokio::fs::write(&path, format!("{}\n{{\"id\": 2", event(1, 10))).await.unwrap();

    let mut source = JsonlEventSource::new(&path, 10);
    let batch = source.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(batch.len(), 1);

    let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
    file
      .write_all(b", \"subject_id\": 10, \"annotation\": {\"T0\": 0}}\n")
      .await
      .unwrap();
    file.flush().await.unwrap();

    let batch = source.poll(Duration::from_millis(10)).await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
  }

  #[tokio::test]
  async fn backlog_drains_in_order_across_batches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let lines: Vec<_> = (1..=23).map(|id| event(id, id % 4)).collect();
    write_lines(&path, &lines).await;

    let mut source = JsonlEventSource::new(&path, 5);
    let mut seen = Vec::new();
    loop {
      let batch = source.poll(Duration::from_millis(5)).await.unwrap();
      if batch.is_empty() {
        break;
      }
      assert!(batch.len() <= 5);
      seen.extend(batch.iter().map(|e| e.id));
    }

    assert_eq!(seen, (1..=23).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn invalid_utf8_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut bytes = format!("{}\n", event(1, 10)).into_bytes();
    bytes.extend_from_slice(
      b"{\"id\": 2, \"subject_id\": 10, \"annotation\": {\"T0\": 1}, \"object_id\": \"ZTF\xff\"}\n",
    );
    bytes.extend(format!("{}\n", event(3, 10)).into_bytes());
    tokio::fs::write(&path, bytes).await.unwrap();

    let mut source = JsonlEventSource::new(&path, 10);
    let batch = source.poll(Duration::from_millis(5)).await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 3]);
  }

  #[tokio::test]
  async fn missing_spool_is_an_empty_poll() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = JsonlEventSource::new(dir.path().join("absent.jsonl"), 10);
    assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn sinks_append_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let retired = dir.path().join("retired.jsonl");
    let results = dir.path().join("results.jsonl");

    JsonlRetirementSink::new(&retired).retire(&[4, 2]).await.unwrap();
    let sink = JsonlResultsSink::new(&results);
    sink
      .report(&VoteFractions {
        subject_id:           4,
        object_id:            Some("ZTF22abc".into()),
        fraction_t0:          0.5,
        fraction_t1:          0.0,
        classification_count: 4,
      })
      .await
      .unwrap();

    let text = tokio::fs::read_to_string(&retired).await.unwrap();
    let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(line["subject_ids"], json!([4, 2]));

    let text = tokio::fs::read_to_string(&results).await.unwrap();
    let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(line["subject_id"], json!(4));
    assert_eq!(line["object_id"], json!("ZTF22abc"));
    assert_eq!(line["fraction_t0"], json!(0.5));
    assert!(line.get("reported_at").is_some());
  }
}
