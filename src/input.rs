//! Input dataset reading.
//!
//! Two formats: `.jsonl` (one JSON object per line, blank and
//! `#`-prefixed lines ignored) and `.json` (a top-level array, or a
//! top-level object whose first array-valued field holds the records).
//! JSONL is streamed so arbitrarily large inputs never live in memory
//! at once; a cheap counting pass runs first so the progress bar and
//! `input_total` are exact.
//!
//! Records are identified by their zero-based position in the stream.
//! A malformed record still consumes its index; the caller decides what
//! to do with it (log, count, skip).

use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_stream::wrappers::LinesStream;

use crate::{error::DistillError, prelude::*};

/// One position in the input stream.
#[derive(Debug)]
pub struct IndexedRecord {
    /// Zero-based input index.
    pub index: u64,
    pub payload: RecordPayload,
}

/// What we found at that position.
#[derive(Debug)]
pub enum RecordPayload {
    Object(JsonObject),
    /// Unparseable line or non-object entry, with the reason.
    Malformed(String),
}

/// An open input dataset: exact record count plus the record stream.
pub struct RecordStream {
    pub total: u64,
    pub stream: BoxedStream<Result<IndexedRecord>>,
}

/// Does this line hold a record? Blank and `#`-prefixed lines don't.
fn is_record_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn parse_record_line(line: &str) -> RecordPayload {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => RecordPayload::Object(map),
        Ok(other) => RecordPayload::Malformed(format!(
            "expected a JSON object, found {}",
            type_name(&other)
        )),
        Err(err) => RecordPayload::Malformed(format!("invalid JSON: {err}")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Open the dataset at `path`.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn open_records(path: &Path) -> Result<RecordStream> {
    let is_array_file = path.extension().is_some_and(|ext| ext == "json");
    if is_array_file {
        open_json_array(path).await
    } else {
        open_jsonl(path).await
    }
}

/// Count the records in the dataset without materializing them.
async fn count_jsonl_records(path: &Path) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0u64;
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("failed to read input file {}", path.display()))?
    {
        if is_record_line(&line) {
            count += 1;
        }
    }
    Ok(count)
}

async fn open_jsonl(path: &Path) -> Result<RecordStream> {
    let total = count_jsonl_records(path).await?;
    debug!(total, "Counted input records");

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let path_for_errors = path.to_owned();
    let stream = LinesStream::new(BufReader::new(file).lines())
        .filter_map(move |line| {
            let path = path_for_errors.clone();
            async move {
                match line {
                    Ok(line) if is_record_line(&line) => {
                        Some(Ok(parse_record_line(&line)))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow::Error::from(DistillError::io(
                        format!("failed reading {}: {err}", path.display()),
                    )))),
                }
            }
        })
        .enumerate()
        .map(|(index, payload)| {
            Ok(IndexedRecord {
                index: index as u64,
                payload: payload?,
            })
        })
        .boxed();
    Ok(RecordStream { total, stream })
}

/// Load a `.json` file: a top-level array, or the first array-valued
/// field of a top-level object.
async fn open_json_array(path: &Path) -> Result<RecordStream> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    let value: Value = serde_json::from_str(&data).map_err(|err| {
        DistillError::Input(format!("invalid JSON in {}: {err}", path.display()))
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            let array = map
                .into_iter()
                .find_map(|(_key, value)| match value {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| {
                    DistillError::Input(format!(
                        "{} has no array-valued field to use as the record list",
                        path.display()
                    ))
                })?;
            array
        }
        _ => {
            return Err(DistillError::Input(format!(
                "{} must contain a JSON array or object",
                path.display()
            ))
            .into());
        }
    };

    let total = items.len() as u64;
    let stream = futures::stream::iter(items.into_iter().enumerate().map(
        |(index, item)| {
            let payload = match item {
                Value::Object(map) => RecordPayload::Object(map),
                other => RecordPayload::Malformed(format!(
                    "expected a JSON object, found {}",
                    type_name(&other)
                )),
            };
            Ok(IndexedRecord {
                index: index as u64,
                payload,
            })
        },
    ))
    .boxed();
    Ok(RecordStream { total, stream })
}
