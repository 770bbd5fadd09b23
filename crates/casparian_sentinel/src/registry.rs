//! The registry of identified workers (§4.4): `worker_id -> env_signature,
//! last_heartbeat, current_job`. This is the in-memory half of the ordering
//! guarantee — a worker with `current_job.is_some()` is never offered to the
//! dispatcher again until its CONCLUDE/ERROR clears it.

use crate::error::{Result, SentinelError};
use casparian_ids::JobId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct WorkerEntry {
    /// The ZMQ ROUTER envelope identity for this DEALER peer; opaque bytes
    /// that must be echoed verbatim as the first frame of any reply.
    pub identity: Vec<u8>,
    pub capabilities: Vec<String>,
    pub last_heartbeat: Instant,
    pub current_job: Option<JobId>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records IDENTIFY. Re-identifying an already-known worker (e.g. after
    /// a reconnect) refreshes its identity frame and capabilities but
    /// preserves `current_job` — a reconnect mid-dispatch does not forget
    /// the in-flight job.
    pub fn identify(&mut self, worker_id: String, identity: Vec<u8>, capabilities: Vec<String>) {
        match self.workers.get_mut(&worker_id) {
            Some(entry) => {
                entry.identity = identity;
                entry.capabilities = capabilities;
                entry.last_heartbeat = Instant::now();
            }
            None => {
                self.workers.insert(worker_id, WorkerEntry { identity, capabilities, last_heartbeat: Instant::now(), current_job: None });
            }
        }
    }

    pub fn heartbeat(&mut self, worker_id: &str) -> Result<()> {
        let entry = self.workers.get_mut(worker_id).ok_or_else(|| SentinelError::UnknownWorker(worker_id.to_string()))?;
        entry.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn mark_dispatched(&mut self, worker_id: &str, job_id: JobId) -> Result<()> {
        let entry = self.workers.get_mut(worker_id).ok_or_else(|| SentinelError::UnknownWorker(worker_id.to_string()))?;
        entry.current_job = Some(job_id);
        Ok(())
    }

    /// Clears the in-flight job on CONCLUDE/ERROR, making the worker eligible
    /// for dispatch again.
    pub fn clear_current_job(&mut self, worker_id: &str) -> Result<()> {
        let entry = self.workers.get_mut(worker_id).ok_or_else(|| SentinelError::UnknownWorker(worker_id.to_string()))?;
        entry.current_job = None;
        entry.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn identity_of(&self, worker_id: &str) -> Option<Vec<u8>> {
        self.workers.get(worker_id).map(|e| e.identity.clone())
    }

    /// Reverse lookup from a ROUTER envelope identity back to the worker_id
    /// that IDENTIFYed with it, regardless of whether that worker is
    /// currently idle or has a job in flight.
    pub fn worker_id_for_identity(&self, identity: &[u8]) -> Option<String> {
        self.workers.iter().find(|(_, e)| e.identity == identity).map(|(id, _)| id.clone())
    }

    /// Workers with no in-flight job, in a stable order (insertion-independent
    /// iteration is fine here; the dispatcher bounds how many it visits per tick).
    pub fn idle_workers(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.workers.iter().filter(|(_, e)| e.current_job.is_none()).map(|(id, e)| (id.as_str(), e.capabilities.as_slice()))
    }

    /// Drops any worker whose last heartbeat is older than `timeout`,
    /// returning the dropped worker ids. Does not touch the store — a
    /// dropped worker's claimed job is recovered independently by
    /// `reclaim_stalled` once its store-level heartbeat lease also expires.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> =
            self.workers.iter().filter(|(_, e)| now.duration_since(e.last_heartbeat) > timeout).map(|(id, _)| id.clone()).collect();
        for id in &stale {
            self.workers.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(tag: &str) -> Vec<u8> {
        tag.as_bytes().to_vec()
    }

    #[test]
    fn idle_workers_excludes_dispatched() {
        let mut reg = WorkerRegistry::new();
        reg.identify("w1".into(), identity("id1"), vec!["env1".into()]);
        reg.identify("w2".into(), identity("id2"), vec!["env1".into()]);
        reg.mark_dispatched("w1", JobId::new(7)).unwrap();

        let idle: Vec<&str> = reg.idle_workers().map(|(id, _)| id).collect();
        assert_eq!(idle, vec!["w2"]);
    }

    #[test]
    fn clear_current_job_makes_worker_idle_again() {
        let mut reg = WorkerRegistry::new();
        reg.identify("w1".into(), identity("id1"), vec!["env1".into()]);
        reg.mark_dispatched("w1", JobId::new(7)).unwrap();
        assert_eq!(reg.idle_workers().count(), 0);

        reg.clear_current_job("w1").unwrap();
        assert_eq!(reg.idle_workers().count(), 1);
    }

    #[test]
    fn prune_stale_removes_workers_past_timeout() {
        let mut reg = WorkerRegistry::new();
        reg.identify("w1".into(), identity("id1"), vec!["env1".into()]);
        let dropped = reg.prune_stale(Duration::from_secs(0));
        assert_eq!(dropped, vec!["w1".to_string()]);
        assert!(reg.is_empty());
    }

    #[test]
    fn worker_id_for_identity_resolves_busy_and_idle_workers() {
        let mut reg = WorkerRegistry::new();
        reg.identify("w1".into(), identity("id1"), vec!["env1".into()]);
        reg.mark_dispatched("w1", JobId::new(1)).unwrap();
        reg.identify("w2".into(), identity("id2"), vec!["env1".into()]);

        assert_eq!(reg.worker_id_for_identity(&identity("id1")), Some("w1".to_string()));
        assert_eq!(reg.worker_id_for_identity(&identity("id2")), Some("w2".to_string()));
        assert_eq!(reg.worker_id_for_identity(&identity("unknown")), None);
    }

    #[test]
    fn reidentify_preserves_in_flight_job() {
        let mut reg = WorkerRegistry::new();
        reg.identify("w1".into(), identity("id1"), vec!["env1".into()]);
        reg.mark_dispatched("w1", JobId::new(3)).unwrap();
        reg.identify("w1".into(), identity("id1-reconnected"), vec!["env1".into()]);
        assert_eq!(reg.idle_workers().count(), 0);
    }
}
