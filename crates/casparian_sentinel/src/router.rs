//! The ZMQ ROUTER loop (§4.4, §6): one task owns the socket end to end, so
//! no locking is needed between receiving control frames and sending
//! DISPATCH — everything that touches the wire happens on this task.

use crate::dispatch::{self, PendingDispatch};
use crate::error::{Result, SentinelError};
use crate::registry::WorkerRegistry;
use crate::routing::RoutingTable;
use casparian_db::CasparianDb;
use casparian_protocol::{ConcludePayload, ErrorPayload, HeartbeatPayload, IdentifyPayload, Message, OpCode};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use zeromq::{RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

pub struct SentinelConfig {
    pub bind_addr: String,
    pub dispatch_tick: Duration,
    pub supervisor_tick: Duration,
    /// A worker is dropped from the registry if its ZMQ HEARTBEAT goes
    /// silent for longer than this.
    pub worker_timeout: Duration,
    /// A job's store lease is reclaimed to PENDING if its heartbeat column
    /// goes stale for longer than this (§8 scenario 4: "after 3*I").
    pub lease_timeout: chrono::Duration,
}

async fn send_to(socket: &mut RouterSocket, identity: &[u8], msg: &Message) -> Result<()> {
    let (header, payload) = msg.pack()?;
    let mut multipart = ZmqMessage::from(identity.to_vec());
    multipart.push_back(header.into());
    multipart.push_back(payload.into());
    socket.send(multipart).await.map_err(|e| SentinelError::Zmq(e.to_string()))
}

/// Splits a ROUTER-received multipart into (identity, Message). ROUTER
/// prepends the peer's envelope identity ahead of the two wire frames every
/// DEALER sends, so a well-formed frame here is always three parts.
fn split_envelope(multipart: ZmqMessage) -> Result<(Vec<u8>, Message)> {
    let frames: Vec<Vec<u8>> = multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
    if frames.len() != 3 {
        return Err(SentinelError::Zmq(format!("expected 3 frames (identity, header, payload), got {}", frames.len())));
    }
    let identity = frames[0].clone();
    let message = Message::unpack(&frames[1..])?;
    Ok((identity, message))
}

pub async fn run(db: CasparianDb, config: SentinelConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut socket = RouterSocket::new();
    socket.bind(&config.bind_addr).await.map_err(|e| SentinelError::Zmq(e.to_string()))?;
    info!(addr = %config.bind_addr, "sentinel listening");

    let routing = RoutingTable::new();
    routing.reload(&db).await?;
    let mut registry = WorkerRegistry::new();

    let mut dispatch_interval = tokio::time::interval(config.dispatch_tick);
    let mut supervisor_interval = tokio::time::interval(config.supervisor_tick);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        tokio::select! {
            recv = socket.recv() => {
                let multipart = match recv {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "zmq recv failed");
                        continue;
                    }
                };
                if let Err(e) = handle_frame(&mut socket, &db, &routing, &mut registry, multipart).await {
                    warn!(error = %e, "failed to handle incoming frame");
                }
            }
            _ = dispatch_interval.tick() => {
                match dispatch::tick(&db, &routing, &registry).await {
                    Ok(ready) => send_dispatches(&mut socket, &mut registry, ready).await,
                    Err(e) => warn!(error = %e, "dispatch tick failed"),
                }
            }
            _ = supervisor_interval.tick() => {
                supervise(&db, &config, &mut registry).await;
            }
            _ = shutdown.changed() => {
                return Ok(());
            }
        }
    }
}

async fn handle_frame(
    socket: &mut RouterSocket,
    db: &CasparianDb,
    routing: &RoutingTable,
    registry: &mut WorkerRegistry,
    multipart: ZmqMessage,
) -> Result<()> {
    let (identity, msg) = split_envelope(multipart)?;

    match msg.header.opcode {
        OpCode::Identify => {
            let payload: IdentifyPayload = msg.json_body()?;
            info!(worker_id = %payload.worker_id, capabilities = ?payload.capabilities, "worker identified");
            registry.identify(payload.worker_id.clone(), identity, payload.capabilities.clone());
            let env_signature = payload.capabilities.first().cloned().unwrap_or_default();
            db.upsert_worker_heartbeat(&payload.worker_id, &env_signature).await?;
        }
        OpCode::Heartbeat => {
            let _payload: HeartbeatPayload = msg.json_body()?;
            if let Some(worker_id) = registry.worker_id_for_identity(&identity) {
                let _ = registry.heartbeat(&worker_id);
            }
        }
        OpCode::Conclude => {
            let _payload: ConcludePayload = msg.json_body()?;
            if let Some(worker_id) = registry.worker_id_for_identity(&identity) {
                info!(%worker_id, job_id = %msg.header.job_id, "CONCLUDE received, worker idle again");
                let _ = registry.clear_current_job(&worker_id);
            }
        }
        OpCode::Error => {
            let payload: ErrorPayload = msg.json_body()?;
            if let Some(worker_id) = registry.worker_id_for_identity(&identity) {
                warn!(%worker_id, job_id = %msg.header.job_id, kind = ?payload.kind, message = %payload.message, "ERROR received, worker idle again");
                let _ = registry.clear_current_job(&worker_id);
            }
        }
        OpCode::Reload => {
            let count = routing.reload(db).await?;
            info!(plugins = count, "routing table rehydrated on RELOAD");
        }
        other => {
            warn!(opcode = ?other, "unexpected opcode at sentinel");
        }
    }
    Ok(())
}

async fn send_dispatches(socket: &mut RouterSocket, registry: &mut WorkerRegistry, ready: Vec<PendingDispatch>) {
    for pending in ready {
        let Some(identity) = registry.identity_of(&pending.worker_id) else {
            warn!(worker_id = %pending.worker_id, "worker vanished before dispatch could be sent");
            continue;
        };
        let msg = match Message::json(OpCode::Dispatch, pending.job_id, &pending.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to encode DISPATCH payload");
                continue;
            }
        };
        if let Err(e) = send_to(socket, &identity, &msg).await {
            warn!(worker_id = %pending.worker_id, error = %e, "failed to send DISPATCH");
            continue;
        }
        if let Err(e) = registry.mark_dispatched(&pending.worker_id, pending.job_id) {
            warn!(worker_id = %pending.worker_id, error = %e, "failed to mark worker dispatched");
        }
    }
}

/// Recovery pass (§4.9, §8 scenario 4): reclaims store leases whose
/// heartbeat has gone stale, marks workers offline in the store's worker
/// table, and drops any worker from the in-memory registry that has stopped
/// sending ZMQ heartbeats.
async fn supervise(db: &CasparianDb, config: &SentinelConfig, registry: &mut WorkerRegistry) {
    match db.reclaim_stalled(config.lease_timeout).await {
        Ok(0) => {}
        Ok(n) => info!(reclaimed = n, "reclaimed stalled job leases"),
        Err(e) => warn!(error = %e, "reclaim_stalled failed"),
    }

    if let Err(e) = db.mark_stale_workers_offline(config.lease_timeout).await {
        warn!(error = %e, "mark_stale_workers_offline failed");
    }

    let dropped = registry.prune_stale(config.worker_timeout);
    if !dropped.is_empty() {
        warn!(workers = ?dropped, "dropped workers with no recent heartbeat");
    }
}
