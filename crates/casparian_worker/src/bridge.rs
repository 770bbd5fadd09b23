//! Bridge: spawns the Sandbox subprocess and streams its output over the
//! wire protocol (§4.5 step 6-7, §4.6).
//!
//! The host listens on an ephemeral loopback port and passes its address to
//! the child via `CASPARIAN_BRIDGE_ADDR`; the guest connects back and speaks
//! the same framed protocol as the broker ↔ worker leg (§6), just over a
//! private per-job socket instead of the broker's shared one. Each emitted
//! batch is one self-contained Arrow IPC stream (schema + one batch) framed
//! as a single DATA message; the originating topic name travels in the
//! stream's schema metadata under the `_cf_topic` key, since the wire header
//! itself only carries a job id, not a topic. `register_topic` is called the
//! first time a topic name is seen in this job's stream.

use crate::cancel::CancellationToken;
use crate::error::{Result, WorkerError};
use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamReader as ArrowStreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::record_batch::RecordBatch;
use casparian_ids::{FileVersionId, JobId};
use casparian_protocol::{CancelPayload, ConcludePayload, ContentType, ErrorPayload, Message, OpCode};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct SandboxConfig {
    pub executable: PathBuf,
    pub interpreter_root: PathBuf,
    pub source_code: String,
    pub file_path: String,
    pub job_id: JobId,
    pub file_version_id: FileVersionId,
    pub timeout: Option<Duration>,
}

/// Every batch the Sandbox published, grouped by topic name (§4.7).
pub struct SandboxOutcome {
    pub batches_by_topic: HashMap<String, Vec<RecordBatch>>,
}

const TOPIC_METADATA_KEY: &str = "_cf_topic";

/// Encodes one batch as a self-contained Arrow IPC stream carrying its topic
/// name in schema metadata, then frames it as a DATA message (§4.6 step 4).
pub fn encode_data_frame(topic: &str, batch: &RecordBatch, job_id: JobId) -> Result<Message> {
    let mut metadata = HashMap::new();
    metadata.insert(TOPIC_METADATA_KEY.to_string(), topic.to_string());
    let schema = Schema::new(batch.schema().fields().clone()).with_metadata(metadata);
    let schema = std::sync::Arc::new(schema);
    let batch = RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?;

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new_with_options(&mut buf, &schema, IpcWriteOptions::default())?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(Message::new(OpCode::Data, ContentType::Arrow, job_id, buf)?)
}

fn decode_data_frame(payload: &[u8]) -> Result<(String, RecordBatch)> {
    let cursor = Cursor::new(payload);
    let mut reader = ArrowStreamReader::try_new(cursor, None)?;
    let topic = reader
        .schema()
        .metadata()
        .get(TOPIC_METADATA_KEY)
        .cloned()
        .ok_or_else(|| WorkerError::Protocol(casparian_protocol::ProtocolError::InvalidFrameCount { expected: 1, got: 0 }))?;
    let batch = reader
        .next()
        .ok_or_else(|| WorkerError::Protocol(casparian_protocol::ProtocolError::InvalidFrameCount { expected: 1, got: 0 }))??;
    Ok((topic, batch))
}

async fn read_message(stream: &mut TcpStream) -> std::io::Result<Option<Message>> {
    let mut header_buf = [0u8; casparian_protocol::HEADER_SIZE];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let header = casparian_protocol::Header::unpack(&header_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    let msg = Message::unpack(&[header_buf.to_vec(), payload])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

async fn write_message(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let (header, payload) = msg.pack().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&header).await?;
    stream.write_all(&payload).await?;
    Ok(())
}

fn write_source_file(dir: &Path, job_id: JobId, source_code: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("job-{job_id}.plugin"));
    std::fs::write(&path, source_code)?;
    Ok(path)
}

/// Spawns the sandbox, accepts its connection, and streams its output to
/// completion. Returns `SandboxOutcome` on clean CONCLUDE; any other
/// termination (non-zero exit, protocol violation, timeout, ERROR frame) is
/// a `WorkerError`.
pub async fn run_sandbox(config: SandboxConfig, cancel: CancellationToken) -> Result<SandboxOutcome> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let source_dir = std::env::temp_dir().join("casparian_jobs");
    std::fs::create_dir_all(&source_dir)?;
    let source_path = write_source_file(&source_dir, config.job_id, &config.source_code)?;

    let mut child: Child = Command::new(&config.executable)
        .env("CASPARIAN_BRIDGE_ADDR", addr.to_string())
        .env("CASPARIAN_JOB_ID", config.job_id.to_string())
        .env("CASPARIAN_FILE_VERSION_ID", config.file_version_id.to_string())
        .env("CASPARIAN_FILE_PATH", &config.file_path)
        .env("CASPARIAN_SOURCE_PATH", &source_path)
        .env("CASPARIAN_INTERPRETER_ROOT", &config.interpreter_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let job_timeout = config.timeout.unwrap_or(DEFAULT_JOB_TIMEOUT);
    let deadline = tokio::time::Instant::now() + job_timeout;

    let mut stream = match timeout(CONNECT_TIMEOUT, listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e.into());
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(WorkerError::Timeout);
        }
    };

    let mut outcome = SandboxOutcome { batches_by_topic: HashMap::new() };

    loop {
        if cancel.is_cancelled() {
            let cancel_msg = Message::json(
                OpCode::Cancel,
                config.job_id,
                &CancelPayload { reason: "lease revoked".to_string() },
            )?;
            if let Err(e) = write_message(&mut stream, &cancel_msg).await {
                warn!(job_id = %config.job_id, error = %e, "failed to forward CANCEL to sandbox, killing directly");
            }
            terminate(&mut child).await;
            return Err(WorkerError::LeaseLost("cancellation requested".to_string()));
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            terminate(&mut child).await;
            return Err(WorkerError::Timeout);
        }

        let msg = match timeout(remaining.min(Duration::from_millis(500)), read_message(&mut stream)).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                terminate(&mut child).await;
                return Err(e.into());
            }
            Err(_) => continue,
        };

        match msg.header.opcode {
            OpCode::Data => {
                let (topic, batch) = decode_data_frame(&msg.payload)?;
                outcome.batches_by_topic.entry(topic).or_default().push(batch);
            }
            OpCode::Conclude => {
                let _summary: ConcludePayload = msg.json_body()?;
                debug!(job_id = %config.job_id, "received CONCLUDE");
                break;
            }
            OpCode::Error => {
                let err: ErrorPayload = msg.json_body()?;
                terminate(&mut child).await;
                return Err(WorkerError::SandboxFailed(1, err.message));
            }
            other => {
                warn!(job_id = %config.job_id, opcode = ?other, "unexpected opcode from sandbox");
            }
        }
    }

    let status = match timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            terminate(&mut child).await;
            return Err(WorkerError::Timeout);
        }
    };

    if !status.success() {
        return Err(WorkerError::SandboxFailed(status.code().unwrap_or(-1), "sandbox exited without CONCLUDE".to_string()));
    }

    info!(job_id = %config.job_id, topics = outcome.batches_by_topic.len(), "sandbox concluded cleanly");
    Ok(outcome)
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to send termination signal to sandbox");
    }
    let _ = timeout(Duration::from_secs(5), child.wait()).await;
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

    #[test]
    fn data_frame_roundtrips_topic_and_batch() {
        let batch = sample_batch();
        let msg = encode_data_frame("out", &batch, JobId::new(1)).unwrap();
        let (topic, decoded) = decode_data_frame(&msg.payload).unwrap();
        assert_eq!(topic, "out");
        assert_eq!(decoded.num_rows(), 3);
    }
}
