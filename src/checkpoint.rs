//! Durable progress checkpoints.
//!
//! A checkpoint records which input indices have had all their outputs
//! written and fsynced: a contiguous prefix `[0, last_committed_index)`
//! plus a set of completed indices at or beyond it (out-of-order
//! completions under unordered writes, or gaps left by a pause). The
//! file is rewritten atomically: write `checkpoint.json.tmp`, fsync,
//! rename over `checkpoint.json`.

use std::collections::BTreeSet;

use tokio::io::AsyncWriteExt as _;

use crate::{error::DistillError, prelude::*};

/// Bumped when the on-disk layout changes. A mismatched checkpoint is
/// ignored rather than misread.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// File name, next to the output file.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Progress marker sufficient to resume without duplicate or lost work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,

    /// Every index below this is fully written and fsynced.
    pub last_committed_index: u64,

    /// Completed indices at or beyond `last_committed_index`.
    pub completed: BTreeSet<u64>,

    /// Output lines durable at the time this checkpoint was saved.
    pub outputs_written: u64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            last_committed_index: 0,
            completed: BTreeSet::new(),
            outputs_written: 0,
        }
    }
}

impl Checkpoint {
    /// Has `index` already been fully processed?
    pub fn is_completed(&self, index: u64) -> bool {
        index < self.last_committed_index || self.completed.contains(&index)
    }

    /// Record `index` as fully written, advancing the contiguous prefix
    /// past any now-adjacent completed indices.
    pub fn mark_completed(&mut self, index: u64) {
        if index < self.last_committed_index {
            return;
        }
        self.completed.insert(index);
        while self.completed.remove(&self.last_committed_index) {
            self.last_committed_index += 1;
        }
    }

    /// How many indices have been completed in total.
    pub fn completed_count(&self) -> u64 {
        self.last_committed_index + self.completed.len() as u64
    }
}

/// Owns the checkpoint file handle and the save protocol.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store for the checkpoint next to `output_path`.
    pub fn for_output(output_path: &Path) -> Self {
        let dir = output_path.parent().unwrap_or_else(|| Path::new("."));
        Self {
            path: dir.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, if one exists and its schema matches.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => {
                return Err(DistillError::io(format!(
                    "failed to read checkpoint {}: {err}",
                    self.path.display()
                ))
                .into());
            }
        };
        let checkpoint: Checkpoint = serde_json::from_str(&data).map_err(|err| {
            DistillError::io(format!(
                "corrupt checkpoint {}: {err}",
                self.path.display()
            ))
        })?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            warn!(
                found = checkpoint.schema_version,
                expected = CHECKPOINT_SCHEMA_VERSION,
                "Ignoring checkpoint with unknown schema version"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Atomically persist `checkpoint`. The caller must already have
    /// fsynced every output byte the checkpoint claims as committed.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)
            .context("failed to serialize checkpoint")?;

        let io_err = |err: std::io::Error| {
            anyhow::Error::from(DistillError::io(format!(
                "failed to save checkpoint {}: {err}",
                self.path.display()
            )))
        };
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&data).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_err)?;
        trace!(
            last_committed_index = checkpoint.last_committed_index,
            outputs_written = checkpoint.outputs_written,
            "Saved checkpoint"
        );
        Ok(())
    }
}
