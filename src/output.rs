//! Output records and the append-only JSONL writer.
//!
//! The writer owns the output file handle exclusively. One JSON object
//! per line, UTF-8, `\n`-terminated, fsynced every `fsync_interval`
//! lines. On resume the file is truncated back to the line count the
//! checkpoint vouches for, which also removes any torn trailing line,
//! and reopened in append mode.

use chrono::Utc;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, BufWriter};

use crate::{error::DistillError, prelude::*, strategy::StrategyKind};

/// Metadata fields stamped on every output record. Their presence is an
/// invariant of the writer.
pub const GEN_METADATA_FIELDS: [&str; 6] = [
    "_gen_strategy",
    "_gen_model",
    "_gen_index",
    "_gen_seq",
    "_gen_timestamp",
    "_gen_elapsed_ms",
];

/// Extend an input record into an output record: the generated content
/// in the target field, the optional question field, and the generation
/// metadata.
#[allow(clippy::too_many_arguments)]
pub fn build_output_record(
    record: &JsonObject,
    generated: String,
    question: Option<(&str, String)>,
    target_field: &str,
    strategy: StrategyKind,
    model_id: &str,
    index: u64,
    seq: u32,
    elapsed_ms: u64,
) -> JsonObject {
    let mut output = record.clone();
    if let Some((field, text)) = question {
        output.insert(field.to_owned(), Value::String(text));
    }
    output.insert(target_field.to_owned(), Value::String(generated));
    output.insert("_gen_strategy".into(), json!(strategy.as_str()));
    output.insert("_gen_model".into(), json!(model_id));
    output.insert("_gen_index".into(), json!(index));
    output.insert("_gen_seq".into(), json!(seq));
    output.insert("_gen_timestamp".into(), json!(Utc::now().to_rfc3339()));
    output.insert("_gen_elapsed_ms".into(), json!(elapsed_ms));
    output
}

/// Append-only JSONL writer with an fsync cadence.
#[derive(Debug)]
pub struct OutputWriter {
    writer: BufWriter<tokio::fs::File>,
    path: PathBuf,
    fsync_interval: usize,
    lines_since_sync: usize,
    outputs_written: u64,
}

impl OutputWriter {
    /// Start a fresh output file, truncating anything already there.
    pub async fn create(path: &Path, fsync_interval: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                DistillError::io(format!(
                    "failed to create output directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let file = tokio::fs::File::create(path).await.map_err(|err| {
            DistillError::io(format!(
                "failed to create output file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_owned(),
            fsync_interval: fsync_interval.max(1),
            lines_since_sync: 0,
            outputs_written: 0,
        })
    }

    /// Reopen an existing output file for appending, keeping exactly
    /// the first `keep_lines` lines. Everything past them, including a
    /// torn trailing line, was not covered by the checkpoint and will
    /// be regenerated.
    pub async fn resume(
        path: &Path,
        fsync_interval: usize,
        keep_lines: u64,
    ) -> Result<Self> {
        if !path.exists() {
            if keep_lines > 0 {
                return Err(DistillError::io(format!(
                    "checkpoint claims {keep_lines} output lines but {} is missing",
                    path.display()
                ))
                .into());
            }
            return Self::create(path, fsync_interval).await;
        }

        let offset = byte_offset_of_line(path, keep_lines).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|err| {
                DistillError::io(format!(
                    "failed to open output file {}: {err}",
                    path.display()
                ))
            })?;
        file.set_len(offset).await.map_err(|err| {
            DistillError::io(format!(
                "failed to truncate output file {}: {err}",
                path.display()
            ))
        })?;
        file.sync_all().await.map_err(|err| {
            DistillError::io(format!(
                "failed to sync output file {}: {err}",
                path.display()
            ))
        })?;
        drop(file);

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|err| {
                DistillError::io(format!(
                    "failed to reopen output file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_owned(),
            fsync_interval: fsync_interval.max(1),
            lines_since_sync: 0,
            outputs_written: keep_lines,
        })
    }

    /// Write one output record as a JSONL line.
    pub async fn write_record(&mut self, record: &JsonObject) -> Result<()> {
        debug_assert!(
            GEN_METADATA_FIELDS
                .iter()
                .all(|field| record.contains_key(*field)),
            "output record is missing generation metadata"
        );
        let line = serde_json::to_string(record)
            .context("failed to serialize output record")?;
        let io_err = |err: std::io::Error| {
            anyhow::Error::from(DistillError::io(format!(
                "failed to write output file {}: {err}",
                self.path.display()
            )))
        };
        self.writer.write_all(line.as_bytes()).await.map_err(io_err)?;
        self.writer.write_all(b"\n").await.map_err(io_err)?;
        self.outputs_written += 1;
        self.lines_since_sync += 1;
        if self.lines_since_sync >= self.fsync_interval {
            self.sync().await?;
        }
        Ok(())
    }

    /// Flush buffered lines and fsync the file.
    pub async fn sync(&mut self) -> Result<()> {
        let io_err = |err: std::io::Error| {
            anyhow::Error::from(DistillError::io(format!(
                "failed to sync output file {}: {err}",
                self.path.display()
            )))
        };
        self.writer.flush().await.map_err(io_err)?;
        self.writer.get_ref().sync_all().await.map_err(io_err)?;
        self.lines_since_sync = 0;
        Ok(())
    }

    /// Total lines in the file, including lines kept from before a resume.
    pub fn outputs_written(&self) -> u64 {
        self.outputs_written
    }
}

/// Byte offset just past line `count` (1-based counting of complete,
/// newline-terminated lines). Errors if the file holds fewer complete
/// lines than `count`.
async fn byte_offset_of_line(path: &Path, count: u64) -> Result<u64> {
    let mut file = tokio::fs::File::open(path).await.map_err(|err| {
        DistillError::io(format!(
            "failed to open output file {}: {err}",
            path.display()
        ))
    })?;
    let mut remaining = count;
    let mut offset = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let read = file.read(&mut buffer).await.map_err(|err| {
            DistillError::io(format!(
                "failed to scan output file {}: {err}",
                path.display()
            ))
        })?;
        if read == 0 {
            return Err(DistillError::io(format!(
                "output file {} has fewer complete lines than the checkpoint claims",
                path.display()
            ))
            .into());
        }
        for (position, byte) in buffer[..read].iter().enumerate() {
            if *byte == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(offset + position as u64 + 1);
                }
            }
        }
        offset += read as u64;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(index: u64, seq: u32) -> JsonObject {
        let mut input = JsonObject::new();
        input.insert("q".into(), json!("why?"));
        build_output_record(
            &input,
            format!("answer {index}/{seq}"),
            None,
            "output",
            StrategyKind::QToA,
            "stub",
            index,
            seq,
            12,
        )
    }

    fn read_lines(path: &Path) -> Vec<JsonObject> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_output_record_has_all_metadata() {
        let record = sample_record(3, 1);
        for field in GEN_METADATA_FIELDS {
            assert!(record.contains_key(field), "missing {field}");
        }
        assert_eq!(record.get("_gen_index"), Some(&json!(3)));
        assert_eq!(record.get("_gen_seq"), Some(&json!(1)));
        assert_eq!(record.get("q"), Some(&json!("why?")));
        assert_eq!(record.get("output"), Some(&json!("answer 3/1")));
    }

    #[test]
    fn test_question_field_is_recorded() {
        let record = build_output_record(
            &JsonObject::new(),
            "a".into(),
            Some(("instruction", "the question".into())),
            "output",
            StrategyKind::QToA,
            "stub",
            0,
            0,
            1,
        );
        assert_eq!(record.get("instruction"), Some(&json!("the question")));
    }

    #[tokio::test]
    async fn test_write_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut writer = OutputWriter::create(&path, 2).await.unwrap();
        for seq in 0..3 {
            writer.write_record(&sample_record(0, seq)).await.unwrap();
        }
        writer.sync().await.unwrap();
        assert_eq!(writer.outputs_written(), 3);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].get("_gen_seq"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_resume_truncates_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        {
            let mut writer = OutputWriter::create(&path, 100).await.unwrap();
            writer.write_record(&sample_record(0, 0)).await.unwrap();
            writer.write_record(&sample_record(1, 0)).await.unwrap();
            writer.sync().await.unwrap();
        }
        // Simulate a torn write after the last checkpoint.
        {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            file.write_all(b"{\"_gen_index\": 2, \"truncat").unwrap();
        }

        let mut writer = OutputWriter::resume(&path, 100, 2).await.unwrap();
        assert_eq!(writer.outputs_written(), 2);
        writer.write_record(&sample_record(2, 0)).await.unwrap();
        writer.sync().await.unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].get("_gen_index"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_resume_drops_lines_beyond_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        {
            let mut writer = OutputWriter::create(&path, 100).await.unwrap();
            for index in 0..5 {
                writer.write_record(&sample_record(index, 0)).await.unwrap();
            }
            writer.sync().await.unwrap();
        }
        // Checkpoint only vouches for the first 3 lines.
        let writer = OutputWriter::resume(&path, 100, 3).await.unwrap();
        assert_eq!(writer.outputs_written(), 3);
        assert_eq!(read_lines(&path).len(), 3);
    }

    #[tokio::test]
    async fn test_resume_missing_file_with_claimed_lines_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let err = OutputWriter::resume(&path, 100, 2).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }
}
