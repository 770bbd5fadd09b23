//! DEALER client for the Sentinel-pushed dispatch path (§4.4, §6). Connects
//! once at startup, sends IDENTIFY, then loops receiving DISPATCH/HEARTBEAT/
//! CANCEL/RELOAD and running each DISPATCH through [`Worker::run_dispatched`].
//!
//! Grounded on the teacher's `worker.rs` DEALER loop, adapted to our shared
//! `casparian_protocol::Message` framing instead of its bespoke payload
//! types, and to send heartbeats to the Sentinel on their own timer
//! independent of the per-job store heartbeat in `heartbeat.rs`.

use crate::error::{Result, WorkerError};
use crate::worker::Worker;
use casparian_ids::JobId;
use casparian_protocol::{
    ConcludePayload, ContentType, DispatchPayload, ErrorPayload, HeartbeatPayload, HeartbeatStatus, IdentifyPayload, Message, OpCode,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

async fn send(socket: &mut DealerSocket, msg: &Message) -> Result<()> {
    let (header, payload) = msg.pack()?;
    let mut multipart = ZmqMessage::from(header);
    multipart.push_back(payload.into());
    socket.send(multipart).await.map_err(|e| WorkerError::SandboxFailed(-1, format!("zmq send failed: {e}")))?;
    Ok(())
}

async fn recv(socket: &mut DealerSocket) -> Result<Option<Message>> {
    let multipart = match tokio::time::timeout(RECV_POLL_INTERVAL, socket.recv()).await {
        Ok(Ok(m)) => m,
        Ok(Err(e)) => return Err(WorkerError::SandboxFailed(-1, format!("zmq recv failed: {e}"))),
        Err(_) => return Ok(None),
    };
    let frames: Vec<Vec<u8>> = multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
    if frames.len() != 2 {
        warn!(frames = frames.len(), "dropping malformed multipart frame from sentinel");
        return Ok(None);
    }
    Ok(Some(Message::unpack(&frames)?))
}

/// Connects to the Sentinel at `addr`, identifies with `worker_id` and
/// `capabilities`, then serves DISPATCH until `shutdown` fires.
pub async fn run(worker: &Worker, addr: &str, worker_id: String, capabilities: Vec<String>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut socket = DealerSocket::new();
    socket.connect(addr).await.map_err(|e| WorkerError::SandboxFailed(-1, format!("failed to connect to sentinel {addr}: {e}")))?;
    info!(%addr, %worker_id, "connected to sentinel");

    let identify = IdentifyPayload { worker_id: worker_id.clone(), capabilities, current_job_id: None };
    send(&mut socket, &Message::json(OpCode::Identify, JobId::new(0), &identify)?).await?;

    let heartbeat_interval = worker.heartbeat_interval();
    let mut next_heartbeat = tokio::time::Instant::now() + heartbeat_interval;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        if tokio::time::Instant::now() >= next_heartbeat {
            let status = HeartbeatPayload { status: HeartbeatStatus::Idle, current_job_id: None };
            if let Err(e) = send(&mut socket, &Message::json(OpCode::Heartbeat, JobId::new(0), &status)?).await {
                warn!(error = %e, "failed to send heartbeat to sentinel");
            }
            next_heartbeat = tokio::time::Instant::now() + heartbeat_interval;
        }

        let msg = tokio::select! {
            result = recv(&mut socket) => result?,
            _ = shutdown.changed() => return Ok(()),
        };

        let Some(msg) = msg else { continue };

        match msg.header.opcode {
            OpCode::Dispatch => {
                let job_id = msg.header.job_id;
                let payload: DispatchPayload = match msg.json_body() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(%job_id, error = %e, "malformed DISPATCH payload");
                        continue;
                    }
                };
                info!(%job_id, plugin = %payload.plugin_name, "DISPATCH received");
                match worker.run_dispatched(job_id, &payload).await {
                    Ok(summary) => {
                        let rows_per_topic = summary
                            .get("rows_per_topic")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default();
                        send(&mut socket, &Message::json(OpCode::Conclude, job_id, &ConcludePayload { rows_per_topic })?).await?;
                    }
                    Err(e) => {
                        let (kind, _) = e.classify();
                        let err_payload = ErrorPayload { kind, message: e.to_string(), stack: None };
                        send(&mut socket, &Message::json(OpCode::Error, job_id, &err_payload)?).await?;
                    }
                }
            }
            OpCode::Reload => {
                info!("RELOAD acknowledged (routing table is store-owned, worker holds no cached copy)");
            }
            other => {
                warn!(opcode = ?other, "unhandled opcode from sentinel");
            }
        }
    }
}
