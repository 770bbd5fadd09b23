//! Columnar-file sink: Parquet, staged next to its final path and promoted
//! by atomic rename (§4.8).
//!
//! Staging path is `<final_path>.stg.<job_id>`. Overwrite mode renames
//! straight onto the final path; append mode renames into a job-id-tagged
//! sibling so concurrent/retried jobs never clobber each other's committed
//! part files, and readers treat the output as the union of all parts.

use crate::{OutputSink, Result, SinkError};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use casparian_protocol::SinkMode;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn staging_path(final_path: &Path, job_id: &str) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(format!(".stg.{job_id}"));
    PathBuf::from(name)
}

fn part_path(final_path: &Path, job_id: &str) -> PathBuf {
    let stem = final_path.file_stem().and_then(|s| s.to_str()).unwrap_or("part");
    let ext = final_path.extension().and_then(|s| s.to_str()).unwrap_or("parquet");
    let filename = format!("{stem}.part-{job_id}.{ext}");
    final_path.with_file_name(filename)
}

/// Writes one Parquet file per (output, job) pair, staged and then promoted.
pub struct FileSink {
    final_path: PathBuf,
    job_id: String,
    mode: SinkMode,
    staging_path: PathBuf,
    writer: Option<ArrowWriter<File>>,
    rows_written: u64,
    committed: bool,
}

impl FileSink {
    pub fn new(final_path: PathBuf, job_id: impl Into<String>, mode: SinkMode) -> Self {
        let job_id = job_id.into();
        let staging_path = staging_path(&final_path, &job_id);
        Self {
            final_path,
            job_id,
            mode,
            staging_path,
            writer: None,
            rows_written: 0,
            committed: false,
        }
    }

    fn promoted_path(&self) -> PathBuf {
        match self.mode {
            SinkMode::Overwrite => self.final_path.clone(),
            SinkMode::Append => part_path(&self.final_path, &self.job_id),
        }
    }

    /// Self-healing: destroy any staging artifact a crashed prior attempt
    /// left behind before writing begins (§4.8 "self-healing").
    fn destroy_stale_staging(&self) -> Result<()> {
        if self.staging_path.exists() {
            warn!(path = %self.staging_path.display(), "destroying stale staging file");
            std::fs::remove_file(&self.staging_path)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutputSink for FileSink {
    async fn init(&mut self, schema: &Schema) -> Result<()> {
        self.destroy_stale_staging()?;
        if let Some(parent) = self.final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.staging_path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, std::sync::Arc::new(schema.clone()), Some(props))?;
        self.writer = Some(writer);
        debug!(staging = %self.staging_path.display(), "initialized Parquet staging file");
        Ok(())
    }

    async fn write_batch(&mut self, batch: &RecordBatch) -> Result<u64> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotInitialized)?;
        writer.write(batch)?;
        let rows = batch.num_rows() as u64;
        self.rows_written += rows;
        Ok(rows)
    }

    async fn prepare(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        let promoted = self.promoted_path();
        std::fs::rename(&self.staging_path, &promoted)?;
        info!(path = %promoted.display(), rows = self.rows_written, "committed file sink");
        self.committed = true;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.committed && self.staging_path.exists() {
            let _ = std::fs::remove_file(&self.staging_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::{DataType, Field};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("value", DataType::Int32, false)]));
        let values: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
        RecordBatch::try_new(schema, vec![values]).unwrap()
    }

    #[tokio::test]
    async fn overwrite_commit_renames_onto_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.parquet");
        let batch = sample_batch();
        let mut sink = FileSink::new(final_path.clone(), "job-1", SinkMode::Overwrite);
        sink.init(batch.schema().as_ref()).await.unwrap();
        sink.write_batch(&batch).await.unwrap();
        sink.prepare().await.unwrap();
        sink.commit().await.unwrap();
        assert!(final_path.exists());
        assert!(!sink.staging_path.exists());
    }

    #[tokio::test]
    async fn append_commit_creates_job_tagged_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.parquet");
        let batch = sample_batch();
        let mut sink = FileSink::new(final_path.clone(), "job-2", SinkMode::Append);
        sink.init(batch.schema().as_ref()).await.unwrap();
        sink.write_batch(&batch).await.unwrap();
        sink.prepare().await.unwrap();
        sink.commit().await.unwrap();
        assert!(!final_path.exists());
        assert!(dir.path().join("out.part-job-2.parquet").exists());
    }

    #[tokio::test]
    async fn commit_is_idempotent_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.parquet");
        let batch = sample_batch();
        let mut sink = FileSink::new(final_path.clone(), "job-3", SinkMode::Overwrite);
        sink.init(batch.schema().as_ref()).await.unwrap();
        sink.write_batch(&batch).await.unwrap();
        sink.prepare().await.unwrap();
        sink.commit().await.unwrap();
        sink.commit().await.unwrap();
    }

    #[tokio::test]
    async fn init_destroys_stale_staging_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.parquet");
        let stale_staging = staging_path(&final_path, "job-4");
        std::fs::write(&stale_staging, b"stale").unwrap();
        let batch = sample_batch();
        let mut sink = FileSink::new(final_path, "job-4", SinkMode::Overwrite);
        sink.init(batch.schema().as_ref()).await.unwrap();
        let contents = std::fs::read(&sink.staging_path).unwrap();
        assert_ne!(contents, b"stale");
    }
}
