//! The quality report produced when a task completes.
//!
//! The report combines one walk over the output file (line counts,
//! distinct input indices, metadata sanity) with the run counters from
//! the task state (quality failures never produce output lines, so the
//! file alone can't account for them).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt as _, BufReader};

use crate::{
    error::DistillError,
    output::GEN_METADATA_FIELDS,
    prelude::*,
    state::TaskState,
};

/// File name, next to the output file.
pub const QUALITY_REPORT_FILE: &str = "quality_report.json";

/// Final accounting for a distillation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub task_id: String,

    /// Records in the input dataset.
    pub total_input_items: u64,

    /// Generations produced, including ones rejected by validation.
    pub total_generated_items: u64,

    /// Generations that passed validation and were written.
    pub quality_passed_items: u64,

    /// `quality_passed_items / total_generated_items`.
    pub quality_pass_rate: f64,

    /// Input indices with at least one output line, over the input total.
    pub generation_success_rate: f64,

    /// Output lines per input record.
    pub average_generations_per_input: f64,

    /// Job failures of any kind (fatal model errors + quality failures).
    pub failures: u64,

    /// Malformed input records skipped.
    pub input_errors: u64,

    pub generated_at: DateTime<Utc>,
}

/// Walk the output file and combine with the task counters.
#[instrument(level = "debug", skip_all, fields(task_id = %state.task_id))]
pub async fn build_report(state: &TaskState) -> Result<QualityReport> {
    let (lines, distinct_indices) = scan_output(&state.output_path).await?;

    let generated = lines + state.quality_failures;
    let ratio = |numerator: u64, denominator: u64| {
        if denominator == 0 {
            0.0
        } else {
            numerator as f64 / denominator as f64
        }
    };
    Ok(QualityReport {
        task_id: state.task_id.clone(),
        total_input_items: state.input_total,
        total_generated_items: generated,
        quality_passed_items: lines,
        quality_pass_rate: ratio(lines, generated),
        generation_success_rate: ratio(distinct_indices, state.input_total),
        average_generations_per_input: ratio(lines, state.input_total),
        failures: state.failures,
        input_errors: state.input_errors,
        generated_at: Utc::now(),
    })
}

/// Persist the report next to the output file.
pub async fn write_report(report: &QualityReport, output_path: &Path) -> Result<PathBuf> {
    let dir = output_path.parent().unwrap_or_else(|| Path::new("."));
    let path = dir.join(QUALITY_REPORT_FILE);
    let data = serde_json::to_vec_pretty(report)
        .context("failed to serialize quality report")?;
    tokio::fs::write(&path, data).await.map_err(|err| {
        DistillError::io(format!(
            "failed to write quality report {}: {err}",
            path.display()
        ))
    })?;
    info!(
        pass_rate = report.quality_pass_rate,
        "Wrote quality report to {}",
        path.display()
    );
    Ok(path)
}

/// Count output lines and distinct `_gen_index` values, checking that
/// every line carries the mandatory generation metadata.
async fn scan_output(path: &Path) -> Result<(u64, u64)> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((0, 0));
        }
        Err(err) => {
            return Err(DistillError::io(format!(
                "failed to open output file {}: {err}",
                path.display()
            ))
            .into());
        }
    };
    let mut lines = BufReader::new(file).lines();
    let mut count = 0u64;
    let mut indices = BTreeSet::new();
    let mut line_number = 0u64;
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("failed to read output file {}", path.display()))?
    {
        line_number += 1;
        let record: JsonObject = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line_number, "Unparseable output line: {err}");
                continue;
            }
        };
        let missing: Vec<&str> = GEN_METADATA_FIELDS
            .iter()
            .copied()
            .filter(|field| !record.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            warn!(line_number, "Output line missing metadata: {missing:?}");
        }
        if let Some(index) = record.get("_gen_index").and_then(Value::as_u64) {
            indices.insert(index);
        }
        count += 1;
    }
    Ok((count, indices.len() as u64))
}
