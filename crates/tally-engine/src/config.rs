//! Runtime engine configuration, deserialised from `tally.toml` and
//! `TALLY_*` environment variables.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{Error, Result};

/// What to do when the store fails while recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFailurePolicy {
  /// Log and drop the event; only a re-delivery will bring it back.
  Skip,
  /// Retry the write a few times, then halt.
  Retry,
  /// Stop the engine. On restart the source resumes before the failed event.
  #[default]
  Halt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub store_path:           PathBuf,
  /// Counted classifications needed before a subject retires.
  pub threshold:            u32,
  pub poll_timeout_ms:      u64,
  /// Upper bound on events per poll, for sources that batch.
  pub batch_size:           usize,
  pub store_failure_policy: StoreFailurePolicy,
  pub store_retry_attempts: u32,
  /// Fold leftover rows, retire overdue subjects and re-export undelivered
  /// ones before the first poll.
  pub reconcile_on_startup: bool,
  pub events_path:          PathBuf,
  pub retired_path:         PathBuf,
  pub results_path:         PathBuf,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      store_path:           PathBuf::from("tally.sqlite3"),
      threshold:            3,
      poll_timeout_ms:      30_000,
      batch_size:           100,
      store_failure_policy: StoreFailurePolicy::default(),
      store_retry_attempts: 3,
      reconcile_on_startup: true,
      events_path:          PathBuf::from("events.jsonl"),
      retired_path:         PathBuf::from("retired.jsonl"),
      results_path:         PathBuf::from("results.jsonl"),
    }
  }
}

impl EngineConfig {
  pub fn validate(&self) -> Result<()> {
    if self.threshold == 0 {
      return Err(Error::Config("threshold must be at least 1".into()));
    }
    if self.poll_timeout_ms == 0 {
      return Err(Error::Config("poll_timeout_ms must be positive".into()));
    }
    if self.batch_size == 0 {
      return Err(Error::Config("batch_size must be positive".into()));
    }
    if self.store_failure_policy == StoreFailurePolicy::Retry && self.store_retry_attempts == 0 {
      return Err(Error::Config(
        "store_retry_attempts must be positive under the retry policy".into(),
      ));
    }
    Ok(())
  }

  pub fn poll_timeout(&self) -> Duration { Duration::from_millis(self.poll_timeout_ms) }

  /// Total attempts per event before the failure policy gives up.
  pub fn store_attempts(&self) -> u32 {
    match self.store_failure_policy {
      StoreFailurePolicy::Retry => self.store_retry_attempts.max(1),
      StoreFailurePolicy::Skip | StoreFailurePolicy::Halt => 1,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let cfg = EngineConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.threshold, 3);
    assert_eq!(cfg.store_failure_policy, StoreFailurePolicy::Halt);
    assert_eq!(cfg.store_attempts(), 1);
  }

  #[test]
  fn zero_threshold_is_rejected() {
    let cfg = EngineConfig { threshold: 0, ..EngineConfig::default() };
    assert!(matches!(cfg.validate(), Err(Error::Config(_))));
  }

  #[test]
  fn retry_policy_uses_configured_attempts() {
    let cfg = EngineConfig {
      store_failure_policy: StoreFailurePolicy::Retry,
      store_retry_attempts: 4,
      ..EngineConfig::default()
    };
    assert_eq!(cfg.store_attempts(), 4);

    let cfg = EngineConfig { store_retry_attempts: 0, ..cfg };
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn partial_toml_falls_back_to_defaults() {
    let cfg: EngineConfig = config::Config::builder()
      .add_source(config::File::from_str(
        "threshold = 5\nstore_failure_policy = \"skip\"\n",
        config::FileFormat::Toml,
      ))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap();

    assert_eq!(cfg.threshold, 5);
    assert_eq!(cfg.store_failure_policy, StoreFailurePolicy::Skip);
    assert_eq!(cfg.batch_size, 100);
    assert!(cfg.reconcile_on_startup);
  }
}
