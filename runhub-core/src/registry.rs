use crate::types::{RunnerProfile, Timestamp};
use crate::wire::ServerMessage;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One live gateway session. The sender feeds the session's outbound pump;
/// sends are non-blocking and fire-and-forget.
pub struct ConnectedRunner {
    pub runner_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub sender: mpsc::UnboundedSender<ServerMessage>,
    pub profile: RunnerProfile,
    pub max_concurrent_jobs: usize,
    pub current_jobs: Vec<Uuid>,
    pub last_heartbeat: Timestamp,
    pub connected_at: Timestamp,
    pub draining: bool,
}

/// Assignment-relevant snapshot taken under the read lock. The dispatcher
/// works from snapshots so the lock is never held across store calls.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub profile: RunnerProfile,
    pub session_id: Uuid,
    pub free_slots: usize,
}

/// In-memory table of connected runner sessions, shared between the gateway
/// sessions, the dispatcher and the lifecycle engine (control messages).
///
/// Guarded by a reader-writer mutex; all operations are synchronous and the
/// lock is never held across an await.
pub struct RunnerRegistry {
    inner: RwLock<HashMap<Uuid, ConnectedRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, ConnectedRunner>> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, ConnectedRunner>> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a session. If the runner is already connected the older
    /// session is replaced (kick-old) and its sender is returned so the
    /// caller can tell it to shut down.
    pub fn register(&self, conn: ConnectedRunner) -> Option<mpsc::UnboundedSender<ServerMessage>> {
        let mut w = self.write();
        w.insert(conn.runner_id, conn).map(|old| old.sender)
    }

    /// Remove a session, but only if `session_id` still owns the slot — a
    /// kicked session racing its own cleanup must not tear down its
    /// replacement. Returns the orphaned job ids when the removal happened.
    pub fn unregister(&self, runner_id: Uuid, session_id: Uuid) -> Option<Vec<Uuid>> {
        let mut w = self.write();
        match w.get(&runner_id) {
            Some(conn) if conn.session_id == session_id => {
                w.remove(&runner_id).map(|conn| conn.current_jobs)
            }
            _ => None,
        }
    }

    pub fn is_connected(&self, runner_id: Uuid) -> bool {
        self.read().contains_key(&runner_id)
    }

    pub fn connected_count(&self) -> usize {
        self.read().len()
    }

    /// Runners eligible for assignment: not draining, below capacity.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.read()
            .values()
            .filter(|c| !c.draining && c.current_jobs.len() < c.max_concurrent_jobs)
            .map(|c| Candidate {
                profile: c.profile.clone(),
                session_id: c.session_id,
                free_slots: c.max_concurrent_jobs - c.current_jobs.len(),
            })
            .collect()
    }

    /// Record a job on a session. Returns false if the runner vanished.
    pub fn assign_job(&self, runner_id: Uuid, run_id: Uuid) -> bool {
        let mut w = self.write();
        match w.get_mut(&runner_id) {
            Some(conn) => {
                if !conn.current_jobs.contains(&run_id) {
                    conn.current_jobs.push(run_id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a finished job. Returns `Some(idle)` when the runner is
    /// connected, telling the caller whether it just went idle.
    pub fn finish_job(&self, runner_id: Uuid, run_id: Uuid) -> Option<bool> {
        let mut w = self.write();
        w.get_mut(&runner_id).map(|conn| {
            conn.current_jobs.retain(|id| *id != run_id);
            conn.current_jobs.is_empty()
        })
    }

    pub fn owns_job(&self, runner_id: Uuid, run_id: Uuid) -> bool {
        self.read()
            .get(&runner_id)
            .is_some_and(|conn| conn.current_jobs.contains(&run_id))
    }

    pub fn job_count(&self, runner_id: Uuid) -> usize {
        self.read()
            .get(&runner_id)
            .map_or(0, |conn| conn.current_jobs.len())
    }

    pub fn at_capacity(&self, runner_id: Uuid) -> bool {
        self.read()
            .get(&runner_id)
            .is_some_and(|conn| conn.current_jobs.len() >= conn.max_concurrent_jobs)
    }

    pub fn touch_heartbeat(&self, runner_id: Uuid, at: Timestamp) {
        if let Some(conn) = self.write().get_mut(&runner_id) {
            conn.last_heartbeat = at;
        }
    }

    pub fn set_draining(&self, runner_id: Uuid, draining: bool) {
        if let Some(conn) = self.write().get_mut(&runner_id) {
            conn.draining = draining;
        }
    }

    /// Fire-and-forget control message. Returns false when the runner has no
    /// live session (caller decides whether that matters).
    pub fn send(&self, runner_id: Uuid, message: ServerMessage) -> bool {
        match self.read().get(&runner_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Sessions whose last heartbeat predates `cutoff`.
    pub fn stale_sessions(&self, cutoff: Timestamp) -> Vec<(Uuid, Uuid)> {
        self.read()
            .values()
            .filter(|c| c.last_heartbeat < cutoff)
            .map(|c| (c.runner_id, c.session_id))
            .collect()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use std::collections::BTreeMap;

    fn conn(runner_id: Uuid, max_jobs: usize) -> (ConnectedRunner, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tenant_id = Uuid::now_v7();
        (
            ConnectedRunner {
                runner_id,
                tenant_id,
                session_id: Uuid::now_v7(),
                sender: tx,
                profile: RunnerProfile {
                    runner_id,
                    tenant_id,
                    labels: BTreeMap::new(),
                    capabilities: vec![],
                },
                max_concurrent_jobs: max_jobs,
                current_jobs: Vec::new(),
                last_heartbeat: now_ms(),
                connected_at: now_ms(),
                draining: false,
            },
            rx,
        )
    }

    #[test]
    fn register_kicks_older_session() {
        let registry = RunnerRegistry::new();
        let runner_id = Uuid::now_v7();

        let (old, _old_rx) = conn(runner_id, 1);
        let old_session = old.session_id;
        assert!(registry.register(old).is_none());

        let (new, _new_rx) = conn(runner_id, 1);
        let new_session = new.session_id;
        let kicked = registry.register(new);
        assert!(kicked.is_some());

        // The kicked session's late unregister must not remove the new one.
        assert!(registry.unregister(runner_id, old_session).is_none());
        assert!(registry.is_connected(runner_id));
        assert!(registry.unregister(runner_id, new_session).is_some());
    }

    #[test]
    fn capacity_gates_candidates() {
        let registry = RunnerRegistry::new();
        let runner_id = Uuid::now_v7();
        let (c, _rx) = conn(runner_id, 2);
        registry.register(c);

        assert_eq!(registry.candidates().len(), 1);
        registry.assign_job(runner_id, Uuid::now_v7());
        assert_eq!(registry.candidates()[0].free_slots, 1);
        registry.assign_job(runner_id, Uuid::now_v7());
        assert!(registry.candidates().is_empty());
        assert!(registry.at_capacity(runner_id));
    }

    #[test]
    fn draining_runner_is_skipped_but_keeps_jobs() {
        let registry = RunnerRegistry::new();
        let runner_id = Uuid::now_v7();
        let (c, _rx) = conn(runner_id, 2);
        registry.register(c);
        let job = Uuid::now_v7();
        registry.assign_job(runner_id, job);

        registry.set_draining(runner_id, true);
        assert!(registry.candidates().is_empty());
        assert!(registry.owns_job(runner_id, job));

        registry.set_draining(runner_id, false);
        assert_eq!(registry.candidates().len(), 1);
    }

    #[test]
    fn unregister_returns_orphans() {
        let registry = RunnerRegistry::new();
        let runner_id = Uuid::now_v7();
        let (c, _rx) = conn(runner_id, 3);
        let session_id = c.session_id;
        registry.register(c);

        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        registry.assign_job(runner_id, a);
        registry.assign_job(runner_id, b);

        let orphans = registry.unregister(runner_id, session_id).unwrap();
        assert_eq!(orphans, vec![a, b]);
    }
}
