//! WorkerContext — the handle table a job's streamed batches are published
//! through (§4.7). `register_topic` is the only place a topic name is ever
//! looked up by string; `publish` dispatches by dense integer index, which
//! keeps the hot path O(1) and immune to name-based injection.

use crate::error::{Result, WorkerError};
use arrow::record_batch::RecordBatch;
use casparian_db::TopicConfig;
use casparian_ids::{FileVersionId, JobId};
use casparian_protocol::SinkTarget;
use casparian_sinks::{FanOutWriter, ResolvedOutput};
use std::collections::HashMap;

const MAX_TOPIC_NAME_LEN: usize = 128;

/// Validates a topic name against §4.7's grammar: ASCII letters/digits/
/// underscores, must start with a letter, bounded length.
pub fn validate_topic_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let starts_with_letter = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic());
    let rest_ok = chars.clone().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if name.is_empty() || name.len() > MAX_TOPIC_NAME_LEN || !starts_with_letter || !rest_ok {
        return Err(WorkerError::InvalidTopicName(name.to_string()));
    }
    Ok(())
}

struct TopicSlot {
    name: String,
    sink_targets: Vec<SinkTarget>,
}

/// One job's handle table, owned by the host for the job's lifetime.
pub struct WorkerContext {
    job_id: JobId,
    file_version_id: FileVersionId,
    slots: Vec<TopicSlot>,
    by_name: HashMap<String, usize>,
    batches: HashMap<usize, Vec<RecordBatch>>,
}

impl WorkerContext {
    pub fn new(job_id: JobId, file_version_id: FileVersionId) -> Self {
        Self { job_id, file_version_id, slots: Vec::new(), by_name: HashMap::new(), batches: HashMap::new() }
    }

    /// Pre-populates one handle per configured topic for this plugin, so the
    /// sandbox's subscribed topics are known before any DATA frame arrives
    /// (§4.7 "configured topic resolution"). Used on the poll/claim path,
    /// where sink targets are looked up from the store.
    pub fn register_configured_topics(&mut self, topics: &[TopicConfig]) -> Result<()> {
        let targets: Vec<SinkTarget> = topics
            .iter()
            .map(|topic| SinkTarget {
                topic: topic.topic_name.clone(),
                uri: topic.sink_uri.clone(),
                mode: match topic.mode {
                    casparian_db::SinkWriteMode::Append => casparian_protocol::SinkMode::Append,
                    casparian_db::SinkWriteMode::Overwrite => casparian_protocol::SinkMode::Overwrite,
                },
            })
            .collect();
        self.register_sink_targets(&targets)
    }

    /// Same as [`Self::register_configured_topics`] but from already-resolved
    /// [`SinkTarget`]s, as carried directly on a DISPATCH payload's `sinks`
    /// field on the broker-pushed path.
    pub fn register_sink_targets(&mut self, targets: &[SinkTarget]) -> Result<()> {
        let mut by_topic: HashMap<&str, Vec<SinkTarget>> = HashMap::new();
        for target in targets {
            by_topic.entry(target.topic.as_str()).or_default().push(target.clone());
        }
        for (name, targets) in by_topic {
            self.register_topic_with_targets(name, targets)?;
        }
        Ok(())
    }

    /// `register_topic(name) -> handle` (§4.7). Idempotent: registering the
    /// same name twice returns the same handle.
    pub fn register_topic(&mut self, name: &str) -> Result<usize> {
        self.register_topic_with_targets(name, Vec::new())
    }

    fn register_topic_with_targets(&mut self, name: &str, targets: Vec<SinkTarget>) -> Result<usize> {
        validate_topic_name(name)?;
        if let Some(&handle) = self.by_name.get(name) {
            return Ok(handle);
        }
        let handle = self.slots.len();
        self.slots.push(TopicSlot { name: name.to_string(), sink_targets: targets });
        self.by_name.insert(name.to_string(), handle);
        self.batches.insert(handle, Vec::new());
        Ok(handle)
    }

    /// `publish(handle, batch)` (§4.7): O(1) hot path, no string lookup.
    /// Lineage injection and reserved-column rejection happen here, before
    /// the batch is buffered for staging.
    pub fn publish(&mut self, handle: usize, batch: RecordBatch) -> Result<()> {
        if handle >= self.slots.len() {
            return Err(WorkerError::UnknownHandle(handle));
        }
        let lineage_batch = casparian_sinks::inject_lineage_columns(&batch, self.job_id, self.file_version_id)?;
        self.batches.get_mut(&handle).expect("handle validated above").push(lineage_batch);
        Ok(())
    }

    pub fn handle_for(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Row counts per topic, for the COMPLETE summary (§4.5 step 8).
    pub fn rows_per_topic(&self) -> HashMap<String, u64> {
        self.slots
            .iter()
            .enumerate()
            .map(|(handle, slot)| {
                let rows: u64 = self.batches.get(&handle).map(|b| b.iter().map(|rb| rb.num_rows() as u64).sum()).unwrap_or(0);
                (slot.name.clone(), rows)
            })
            .collect()
    }

    /// Resolves every registered topic's buffered batches against its sink
    /// targets and builds a [`FanOutWriter`], ready to stage and commit.
    pub fn into_fan_out<F>(self, mut make_sink: F) -> Result<(FanOutWriter, HashMap<String, Vec<RecordBatch>>)>
    where
        F: FnMut(&SinkTarget) -> Box<dyn casparian_sinks::OutputSink>,
    {
        let mut outputs = Vec::new();
        let mut batches_by_output = HashMap::new();
        for (handle, slot) in self.slots.iter().enumerate() {
            let batches = self.batches.get(&handle).cloned().unwrap_or_default();
            if batches.is_empty() {
                continue;
            }
            batches_by_output.insert(slot.name.clone(), batches);
            for target in &slot.sink_targets {
                outputs.push(ResolvedOutput { target: target.clone(), sink: make_sink(target) });
            }
        }
        Ok((FanOutWriter::new(outputs), batches_by_output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Int32, false)]));
        let values: ArrayRef = Arc::new(Int32Array::from(vec![1, 2]));
        RecordBatch::try_new(schema, vec![values]).unwrap()
    }

    #[test]
    fn register_topic_is_idempotent() {
        let mut ctx = WorkerContext::new(JobId::new(1), FileVersionId::new(1));
        let a = ctx.register_topic("out").unwrap();
        let b = ctx.register_topic("out").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_topic_name_not_starting_with_letter() {
        let mut ctx = WorkerContext::new(JobId::new(1), FileVersionId::new(1));
        assert!(ctx.register_topic("1out").is_err());
    }

    #[test]
    fn rejects_topic_name_with_invalid_characters() {
        let mut ctx = WorkerContext::new(JobId::new(1), FileVersionId::new(1));
        assert!(ctx.register_topic("out-put").is_err());
    }

    #[test]
    fn publish_rejects_unknown_handle() {
        let mut ctx = WorkerContext::new(JobId::new(1), FileVersionId::new(1));
        assert!(matches!(ctx.publish(0, sample_batch()), Err(WorkerError::UnknownHandle(0))));
    }

    #[test]
    fn publish_injects_lineage_and_counts_rows() {
        let mut ctx = WorkerContext::new(JobId::new(7), FileVersionId::new(9));
        let handle = ctx.register_topic("out").unwrap();
        ctx.publish(handle, sample_batch()).unwrap();
        let rows = ctx.rows_per_topic();
        assert_eq!(rows.get("out"), Some(&2));
    }

    #[test]
    fn publish_rejects_forged_lineage_column() {
        let mut ctx = WorkerContext::new(JobId::new(1), FileVersionId::new(1));
        let handle = ctx.register_topic("out").unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("_cf_job_id", DataType::Int32, false)]));
        let values: ArrayRef = Arc::new(Int32Array::from(vec![1]));
        let forged = RecordBatch::try_new(schema, vec![values]).unwrap();
        assert!(ctx.publish(handle, forged).is_err());
    }
}
