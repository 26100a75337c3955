//! Annotation parsing.
//!
//! Turns the semi-structured annotation payload attached to a classification
//! into a [`Label`]. Two shapes are understood:
//!
//! - a task list, `[{"task": "T0", "value": 1}, {"task": "T1", "value": 0}]`,
//!   as written by project classification exports;
//! - a flat map, `{"T0": 1, "T1": "None"}`, as written by reducers.
//!
//! Either shape may arrive double-encoded as a JSON string.

use serde_json::Value;

use crate::{
  ParseError,
  classification::{Answer, Label},
};

/// The task every classification must answer.
pub const REQUIRED_TASK: &str = "T0";
/// The task a classification may answer.
pub const OPTIONAL_TASK: &str = "T1";

/// An answer of zero weight. Matched exactly.
const NONE_ANSWER: &str = "None";
/// Placeholder written for an unanswered task; same as a null.
const UNANSWERED: &str = "none";

/// Parse a raw annotation into a [`Label`].
///
/// A missing, null or `"none"` `T0` is an error; the literal answer `"None"`
/// is not, and counts as a zero contribution. A `T1` that is missing, null or
/// `"none"` is simply omitted from the label.
pub fn parse(raw: &Value) -> Result<Label, ParseError> {
  match raw {
    Value::String(encoded) => {
      let decoded: Value = serde_json::from_str(encoded)?;
      if decoded.is_string() {
        return Err(ParseError::MalformedPayload(
          "annotation is a doubly-encoded string".into(),
        ));
      }
      parse_document(&decoded)
    }
    other => parse_document(other),
  }
}

fn parse_document(doc: &Value) -> Result<Label, ParseError> {
  let (t0, t1) = slots(doc)?;

  let t0 = match t0.filter(|v| !unanswered(v)) {
    None => return Err(ParseError::MissingRequiredAnswer(REQUIRED_TASK)),
    Some(v) => answer(REQUIRED_TASK, v)?,
  };

  let t1 = match t1.filter(|v| !unanswered(v)) {
    None => None,
    Some(v) => Some(answer(OPTIONAL_TASK, v)?),
  };

  Ok(Label::new(t0, t1))
}

/// Locate the `T0` and `T1` slots. Unknown tasks are ignored; if a task
/// appears more than once in a task list the first occurrence wins.
fn slots(doc: &Value) -> Result<(Option<&Value>, Option<&Value>), ParseError> {
  match doc {
    Value::Object(map) => {
      Ok((map.get(REQUIRED_TASK), map.get(OPTIONAL_TASK)))
    }
    Value::Array(items) => {
      let mut t0 = None;
      let mut t1 = None;
      for item in items {
        let task = item
          .get("task")
          .and_then(Value::as_str)
          .ok_or_else(|| {
            ParseError::MalformedPayload(format!("task entry without a task name: {item}"))
          })?;
        let value = item.get("value").unwrap_or(&Value::Null);
        match task {
          REQUIRED_TASK if t0.is_none() => t0 = Some(value),
          OPTIONAL_TASK if t1.is_none() => t1 = Some(value),
          _ => {}
        }
      }
      Ok((t0, t1))
    }
    other => Err(ParseError::MalformedPayload(format!(
      "expected a task list or task map, got {other}"
    ))),
  }
}

fn unanswered(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.trim() == UNANSWERED,
    _ => false,
  }
}

fn answer(task: &'static str, value: &Value) -> Result<Answer, ParseError> {
  let invalid = || ParseError::InvalidAnswer { task, value: value.clone() };

  let number = match value {
    Value::Number(n) => n.as_f64().ok_or_else(invalid)?,
    Value::Bool(b) => f64::from(u8::from(*b)),
    Value::String(s) => {
      let s = s.trim();
      if s == NONE_ANSWER {
        return Ok(Answer::None);
      }
      s.parse::<f64>().map_err(|_| invalid())?
    }
    _ => return Err(invalid()),
  };

  if !number.is_finite() || number < 0.0 {
    return Err(invalid());
  }
  Ok(Answer::Value(number))
}
