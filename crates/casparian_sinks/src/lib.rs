//! Sink fan-out with staging & commit (§4.8).
//!
//! A job's output is a set of Arrow batches destined for one or more
//! [`SinkTarget`]s. Every destination is written to a staging area first and
//! only promoted to its live location once the whole batch set has been
//! accepted. Two sink kinds are supported: a columnar file sink (Parquet,
//! staged as `<path>.stg.<job_id>`, promoted by rename) and a relational
//! table sink (a `T_stg_<job_id>` staging table, promoted by a transaction).
//!
//! Fan-out commit is deliberately NOT all-or-nothing: once a destination's
//! staging data has been promoted, a later failure committing a sibling
//! destination does not roll it back. A destination is either fully
//! committed or left untouched in staging; retrying the job re-runs staging
//! and promotion for every destination, which is a no-op for the ones
//! already live.

mod file_sink;
mod relational_sink;

pub use file_sink::FileSink;
pub use relational_sink::RelationalSink;

use arrow::array::{ArrayRef, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use casparian_ids::{FileVersionId, JobId};
use casparian_protocol::{SinkMode, SinkTarget};
use std::sync::Arc;
use thiserror::Error;

/// The lineage columns every sink output row carries (§4.6, §4.8).
pub const LINEAGE_JOB_ID_COLUMN: &str = "_cf_job_id";
pub const LINEAGE_FILE_VERSION_ID_COLUMN: &str = "_cf_file_version_id";
const RESERVED_PREFIX: &str = "_cf_";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("column '{0}' uses the reserved '_cf_' prefix and cannot be supplied by a plugin")]
    ReservedColumn(String),

    #[error("schema mismatch for output '{output}': batch schema does not match the first batch's schema")]
    SchemaMismatch { output: String },

    #[error("no sink registered for output '{0}'")]
    UnknownOutput(String),

    #[error("sink not initialized: call init() before write_batch()")]
    NotInitialized,

    #[error("unsupported sink uri scheme: '{0}'")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Rejects any plugin-supplied column that forges a `_cf_`-prefixed lineage
/// name. Called once at publish time (fast feedback to the plugin) and again
/// by [`inject_lineage_columns`] as a final guard; a batch that already
/// carries real lineage columns (i.e. was published through
/// `WorkerContext::publish`) is rejected by this same check, so callers must
/// not inject lineage twice onto the same batch.
pub fn reject_reserved_columns(batch: &RecordBatch) -> Result<()> {
    for field in batch.schema().fields() {
        if field.name().starts_with(RESERVED_PREFIX) {
            return Err(SinkError::ReservedColumn(field.name().clone()));
        }
    }
    Ok(())
}

/// Reject any plugin-supplied column that forges lineage metadata, then
/// append the real `_cf_job_id` / `_cf_file_version_id` columns (§4.8 "no
/// forgery", §8 "no-forgery" testable property).
pub fn inject_lineage_columns(
    batch: &RecordBatch,
    job_id: JobId,
    file_version_id: FileVersionId,
) -> Result<RecordBatch> {
    reject_reserved_columns(batch)?;

    let num_rows = batch.num_rows();
    let job_id_str = job_id.to_string();
    let file_version_id_str = file_version_id.to_string();

    let job_id_array: ArrayRef = Arc::new(StringArray::from(vec![job_id_str.as_str(); num_rows]));
    let file_version_id_array: ArrayRef =
        Arc::new(StringArray::from(vec![file_version_id_str.as_str(); num_rows]));

    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(LINEAGE_JOB_ID_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(LINEAGE_FILE_VERSION_ID_COLUMN, DataType::Utf8, false));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns.push(job_id_array);
    columns.push(file_version_id_array);

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn validate_batch_schema(batch: &RecordBatch, expected: &Schema, output: &str) -> Result<()> {
    if batch.schema().as_ref() != expected {
        return Err(SinkError::SchemaMismatch { output: output.to_string() });
    }
    Ok(())
}

/// The capability every sink kind implements: stage batches, then promote
/// staging to the live destination. `init`/`commit` are self-healing: a sink
/// destroys any stale staging artifact left by a prior crashed attempt
/// before it starts staging new data (§4.8 "self-healing").
#[async_trait::async_trait]
pub trait OutputSink: Send {
    async fn init(&mut self, schema: &Schema) -> Result<()>;
    async fn write_batch(&mut self, batch: &RecordBatch) -> Result<u64>;
    /// Flush/close the staging writer. Called once, before `commit`.
    async fn prepare(&mut self) -> Result<()>;
    /// Promote staged data to the live destination. Idempotent: calling
    /// `commit` again after a successful commit (e.g. on retry) is a no-op.
    async fn commit(&mut self) -> Result<()>;
}

/// One destination this job fans out to, resolved into a live [`OutputSink`].
pub struct ResolvedOutput {
    pub target: SinkTarget,
    pub sink: Box<dyn OutputSink>,
}

/// Per-destination outcome of a fan-out commit pass.
#[derive(Debug)]
pub struct CommitOutcome {
    pub topic: String,
    pub committed: bool,
    pub error: Option<String>,
}

/// Drives staging + promotion across every destination a job writes to.
///
/// Per the fixed fan-out contract: destinations are committed independently.
/// A failure committing one destination does not roll back destinations
/// already committed in this pass or in a previous attempt.
pub struct FanOutWriter {
    outputs: Vec<ResolvedOutput>,
}

impl FanOutWriter {
    pub fn new(outputs: Vec<ResolvedOutput>) -> Self {
        Self { outputs }
    }

    /// Stage every destination with the batches for its named output.
    /// Batches are expected to already carry lineage columns (callers
    /// publish through `WorkerContext::publish`, which injects them once);
    /// this only validates that every batch for an output shares the first
    /// batch's schema.
    pub async fn write_all(
        &mut self,
        batches_by_output: &std::collections::HashMap<String, Vec<RecordBatch>>,
    ) -> Result<()> {
        for resolved in &mut self.outputs {
            let Some(batches) = batches_by_output.get(&resolved.target.topic) else {
                continue;
            };
            let Some(first) = batches.first() else { continue };
            resolved.sink.init(first.schema().as_ref()).await?;
            let expected_schema = first.schema();
            resolved.sink.write_batch(first).await?;
            for batch in &batches[1..] {
                validate_batch_schema(batch, expected_schema.as_ref(), &resolved.target.topic)?;
                resolved.sink.write_batch(batch).await?;
            }
        }
        Ok(())
    }

    /// Prepare (flush) every destination, then commit each independently.
    /// Returns one [`CommitOutcome`] per destination; destinations after a
    /// failed one are still attempted, since they are independent.
    pub async fn finish(mut self) -> Vec<CommitOutcome> {
        for resolved in &mut self.outputs {
            if let Err(err) = resolved.sink.prepare().await {
                tracing::warn!(topic = %resolved.target.topic, error = %err, "sink prepare failed");
            }
        }

        let mut outcomes = Vec::with_capacity(self.outputs.len());
        for resolved in &mut self.outputs {
            match resolved.sink.commit().await {
                Ok(()) => outcomes.push(CommitOutcome {
                    topic: resolved.target.topic.clone(),
                    committed: true,
                    error: None,
                }),
                Err(err) => {
                    tracing::warn!(topic = %resolved.target.topic, error = %err, "sink commit failed; leaving staging in place");
                    outcomes.push(CommitOutcome {
                        topic: resolved.target.topic.clone(),
                        committed: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        outcomes
    }
}

pub fn sink_mode_overwrites(mode: SinkMode) -> bool {
    matches!(mode, SinkMode::Overwrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Int32, false)]));
        let values: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
        RecordBatch::try_new(schema, vec![values]).unwrap()
    }

    #[test]
    fn injects_lineage_columns() {
        let batch = sample_batch();
        let out = inject_lineage_columns(&batch, JobId::new(7), FileVersionId::new(42)).unwrap();
        assert_eq!(out.num_columns(), 3);
        assert!(out.schema().field_with_name(LINEAGE_JOB_ID_COLUMN).is_ok());
        assert!(out.schema().field_with_name(LINEAGE_FILE_VERSION_ID_COLUMN).is_ok());
    }

    #[test]
    fn rejects_forged_lineage_column() {
        let schema = Arc::new(Schema::new(vec![Field::new(LINEAGE_JOB_ID_COLUMN, DataType::Int32, false)]));
        let values: ArrayRef = Arc::new(Int32Array::from(vec![1]));
        let batch = RecordBatch::try_new(schema, vec![values]).unwrap();
        let err = inject_lineage_columns(&batch, JobId::new(1), FileVersionId::new(1)).unwrap_err();
        assert!(matches!(err, SinkError::ReservedColumn(_)));
    }
}
