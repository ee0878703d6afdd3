//! Client sessions and the resource leases bound to them.
//!
//! Every resource lease is acquired on behalf of a session. A session stays
//! alive while its holder keeps the `SessionHandle` and heartbeats it; the
//! reaper task releases everything held by sessions whose handle was dropped
//! without unregistering or whose heartbeat lapsed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ondisk::LeaderRecord;
use crate::paxos::{PaxosGrant, PaxosResource, Proposer};
use crate::utils::SectorlockError;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Session identifier, unique within one daemon.
pub type SessionId = u64;

/// Resource key: (lockspace name, resource name).
pub type ResourceKey = (String, String);

/// A resource lease held on behalf of a session.
#[derive(Debug, Clone)]
pub struct HeldLease {
    pub resource: PaxosResource,
    pub proposer: Proposer,
    pub grant: PaxosGrant,
}

impl HeldLease {
    pub fn key(&self) -> ResourceKey {
        (
            self.resource.space_name.clone(),
            self.resource.resource_name.clone(),
        )
    }

    /// Releases the lease on disk.
    pub async fn release(&self) -> Result<LeaderRecord, SectorlockError> {
        self.resource.release(self.proposer, &self.grant).await
    }
}

/// Opaque handle of a registered session. Dropping it without
/// unregistering ends the session and releases what it holds.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx_dropped: mpsc::UnboundedSender<SessionId>,
}

impl SessionHandle {
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // the reaper may already be gone at shutdown
        let _ = self.tx_dropped.send(self.id);
    }
}

#[derive(Debug)]
struct Session {
    last_beat: Instant,
    held: HashMap<ResourceKey, HeldLease>,
    acquiring: bool,
}

/// Table of live sessions and their held leases.
#[derive(Debug)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
    tx_dropped: mpsc::UnboundedSender<SessionId>,
}

impl SessionTable {
    /// Creates an empty table. The receiver yields ids of dropped handles
    /// and belongs to the reaper.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionId>) {
        let (tx_dropped, rx_dropped) = mpsc::unbounded_channel();
        (
            Arc::new(SessionTable {
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                tx_dropped,
            }),
            rx_dropped,
        )
    }

    fn lock(
        &self,
    ) -> Result<MutexGuard<HashMap<SessionId, Session>>, SectorlockError> {
        self.sessions
            .lock()
            .map_err(|e| SectorlockError::msg(format!("session table: {}", e)))
    }

    fn not_found(id: SessionId) -> SectorlockError {
        SectorlockError::not_found(format!("session {} not registered", id))
    }

    /// Registers a new session.
    pub fn register(&self) -> Result<SessionHandle, SectorlockError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()?.insert(
            id,
            Session {
                last_beat: Instant::now(),
                held: HashMap::new(),
                acquiring: false,
            },
        );
        pf_debug!("session {} registered", id);
        Ok(SessionHandle {
            id,
            tx_dropped: self.tx_dropped.clone(),
        })
    }

    /// Looks up a session for an operation by its holder, which also counts
    /// as a heartbeat.
    fn touch<'a>(
        sessions: &'a mut HashMap<SessionId, Session>,
        id: SessionId,
    ) -> Result<&'a mut Session, SectorlockError> {
        let session = sessions.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        session.last_beat = Instant::now();
        Ok(session)
    }

    /// Records a heartbeat from the session holder.
    pub fn heartbeat(&self, id: SessionId) -> Result<(), SectorlockError> {
        Self::touch(&mut *self.lock()?, id)?;
        Ok(())
    }

    /// Marks an acquire of `key` in flight for the session. Only one may be
    /// in flight at a time, and a held resource cannot be acquired again.
    pub fn begin_acquire(
        &self,
        id: SessionId,
        key: &ResourceKey,
    ) -> Result<(), SectorlockError> {
        let mut sessions = self.lock()?;
        let session = Self::touch(&mut sessions, id)?;
        if session.acquiring {
            return Err(SectorlockError::busy(format!(
                "session {} already has an acquire in flight",
                id
            )));
        }
        if session.held.contains_key(key) {
            return Err(SectorlockError::busy(format!(
                "session {} already holds {}:{}",
                id, key.0, key.1
            )));
        }
        session.acquiring = true;
        Ok(())
    }

    /// Ends the in-flight acquire. A successful lease is recorded if the
    /// session is still alive; otherwise it is handed back for release.
    pub fn finish_acquire(
        &self,
        id: SessionId,
        lease: Option<HeldLease>,
    ) -> Result<Option<HeldLease>, SectorlockError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(&id) {
            Some(session) => {
                session.acquiring = false;
                session.last_beat = Instant::now();
                if let Some(lease) = lease {
                    session.held.insert(lease.key(), lease);
                }
                Ok(None)
            }
            None => Ok(lease),
        }
    }

    /// Removes one held lease from the session for release.
    pub fn take(
        &self,
        id: SessionId,
        key: &ResourceKey,
    ) -> Result<HeldLease, SectorlockError> {
        let mut sessions = self.lock()?;
        let session = Self::touch(&mut sessions, id)?;
        session.held.remove(key).ok_or_else(|| {
            SectorlockError::not_found(format!(
                "session {} does not hold {}:{}",
                id, key.0, key.1
            ))
        })
    }

    /// Puts back a lease taken with `take` whose release failed, leaving
    /// any in-flight acquire alone. Hands the lease back if the session
    /// ended meanwhile.
    pub fn restore(
        &self,
        id: SessionId,
        lease: HeldLease,
    ) -> Result<Option<HeldLease>, SectorlockError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(&id) {
            Some(session) => {
                session.held.insert(lease.key(), lease);
                Ok(None)
            }
            None => Ok(Some(lease)),
        }
    }

    /// Removes every lease held by the session, keeping the session.
    pub fn take_all(
        &self,
        id: SessionId,
    ) -> Result<Vec<HeldLease>, SectorlockError> {
        let mut sessions = self.lock()?;
        let session = Self::touch(&mut sessions, id)?;
        Ok(session.held.drain().map(|(_, lease)| lease).collect())
    }

    /// Resources currently held by the session, sorted.
    pub fn inquire(
        &self,
        id: SessionId,
    ) -> Result<Vec<ResourceKey>, SectorlockError> {
        let mut sessions = self.lock()?;
        let session = Self::touch(&mut sessions, id)?;
        let mut keys: Vec<ResourceKey> = session.held.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Ends the session, returning what it still held.
    pub fn remove(
        &self,
        id: SessionId,
    ) -> Result<Option<Vec<HeldLease>>, SectorlockError> {
        Ok(self
            .lock()?
            .remove(&id)
            .map(|session| session.held.into_values().collect()))
    }

    /// Removes every lease held in lockspace `space_name`, across sessions.
    pub fn take_in_lockspace(
        &self,
        space_name: &str,
    ) -> Result<Vec<(SessionId, HeldLease)>, SectorlockError> {
        let mut sessions = self.lock()?;
        let mut taken = vec![];
        for (&id, session) in sessions.iter_mut() {
            let keys: Vec<ResourceKey> = session
                .held
                .keys()
                .filter(|key| key.0 == space_name)
                .cloned()
                .collect();
            for key in keys {
                if let Some(lease) = session.held.remove(&key) {
                    taken.push((id, lease));
                }
            }
        }
        Ok(taken)
    }

    /// Sessions whose last heartbeat is older than `timeout`.
    pub fn expired(
        &self,
        timeout: Duration,
        now: Instant,
    ) -> Result<Vec<SessionId>, SectorlockError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_beat) > timeout)
            .map(|(&id, _)| id)
            .collect())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases every lease in `leases`, logging failures.
pub async fn release_leases(leases: Vec<HeldLease>, why: &str) {
    for lease in leases {
        match lease.release().await {
            Ok(_) => pf_info!("released {} ({})", lease.resource, why),
            Err(e) => {
                pf_error!("error releasing {} ({}): {}", lease.resource, why, e)
            }
        }
    }
}

/// Supervisory task that reaps dead sessions.
pub struct SessionReaper {
    tx_stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SessionReaper {
    /// Spawns the reaper. Sessions are checked every `check_interval` and
    /// reaped once their heartbeat is older than `timeout`.
    pub fn spawn(
        table: Arc<SessionTable>,
        rx_dropped: mpsc::UnboundedReceiver<SessionId>,
        timeout: Duration,
        check_interval: Duration,
    ) -> Result<Self, SectorlockError> {
        if check_interval.is_zero() || timeout < check_interval {
            return logged_err!(
                InvalidArgument => "invalid session timeout {:?} / check interval {:?}",
                timeout,
                check_interval
            );
        }
        let (tx_stop, rx_stop) = watch::channel(false);
        let handle = tokio::spawn(Self::reaper_task(
            table,
            rx_dropped,
            timeout,
            check_interval,
            rx_stop,
        ));
        Ok(SessionReaper { tx_stop, handle })
    }

    /// Stops the reaper task.
    pub async fn stop(self) -> Result<(), SectorlockError> {
        let _ = self.tx_stop.send(true);
        Ok(self.handle.await?)
    }

    async fn reap(table: &SessionTable, id: SessionId, why: &str) {
        match table.remove(id) {
            Ok(Some(leases)) => {
                pf_warn!(
                    "session {} {}, releasing {} lease(s)",
                    id,
                    why,
                    leases.len()
                );
                release_leases(leases, why).await;
            }
            Ok(None) => {} // unregistered already
            Err(e) => pf_error!("error reaping session {}: {}", id, e),
        }
    }

    /// Reaper task function.
    async fn reaper_task(
        table: Arc<SessionTable>,
        mut rx_dropped: mpsc::UnboundedReceiver<SessionId>,
        timeout: Duration,
        check_interval: Duration,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!("session reaper spawned, every {:?}", check_interval);
        let mut ticker = time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                res = rx_stop.changed() => {
                    if res.is_err() || *rx_stop.borrow() {
                        break;
                    }
                },

                id = rx_dropped.recv() => {
                    match id {
                        Some(id) => Self::reap(&table, id, "handle dropped").await,
                        None => break,
                    }
                },

                _ = ticker.tick() => {
                    match table.expired(timeout, Instant::now()) {
                        Ok(ids) => {
                            for id in ids {
                                Self::reap(&table, id, "heartbeat lapsed").await;
                            }
                        }
                        Err(e) => pf_error!("error scanning sessions: {}", e),
                    }
                },
            }
        }
        pf_debug!("session reaper exited");
    }
}
