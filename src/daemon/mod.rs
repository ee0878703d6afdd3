//! The lease daemon: the operation surface tying lockspaces, resources, and
//! sessions together on one host.

mod config;
mod lockspace;

pub use config::DaemonConfig;
pub use lockspace::{LockspaceState, LockspaceStatus};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::delta::{
    init_lockspace, read_first_leader, DeltaSlot, FenceNotice, HostRecord,
    Renewer, DEFAULT_IO_TIMEOUT,
};
use crate::disk::{
    check_io_timeout, check_name, DiskLocation, Geometry, SectorIo, MAX_HOSTS,
};
use crate::ondisk::LeaderRecord;
use crate::paxos::{
    init_resource, read_resource, AcquireOpts, OwnerRecord, PaxosResource,
    Proposer,
};
use crate::session::{
    release_leases, HeldLease, ResourceKey, SessionHandle, SessionReaper,
    SessionTable,
};
use crate::utils::SectorlockError;
use crate::ME;

use lockspace::{Joined, LockspaceEntry, LockspaceHosts};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Lockspace identity as recorded on disk.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LockspaceInfo {
    pub space_name: String,
    pub io_timeout: u16,
}

/// Resource identity and version as recorded on disk.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResourceInfo {
    pub space_name: String,
    pub resource_name: String,
    pub version: u64,
}

/// Checks a leader's recorded geometry against the caller's explicit one.
fn check_geometry(
    leader: &LeaderRecord,
    align: Option<u64>,
    sector: Option<u32>,
) -> Result<(), SectorlockError> {
    if align.is_none() && sector.is_none() {
        return Ok(());
    }
    let expected = Geometry::new(align, sector)?;
    let found = leader.geometry()?;
    if found != expected {
        return Err(SectorlockError::invalid(format!(
            "area was written with {} but read as {}",
            found, expected
        )));
    }
    Ok(())
}

/// State shared between the daemon handle and its background tasks.
struct DaemonCore {
    config: DaemonConfig,
    io: Arc<dyn SectorIo>,
    lockspaces: Mutex<HashMap<String, Arc<LockspaceEntry>>>,
    sessions: Arc<SessionTable>,
    tx_fence: mpsc::UnboundedSender<FenceNotice>,
}

impl DaemonCore {
    fn lock_spaces(
        &self,
    ) -> Result<MutexGuard<HashMap<String, Arc<LockspaceEntry>>>, SectorlockError>
    {
        self.lockspaces
            .lock()
            .map_err(|e| SectorlockError::msg(format!("lockspace map: {}", e)))
    }

    fn entry(&self, space_name: &str) -> Result<Option<Arc<LockspaceEntry>>, SectorlockError> {
        Ok(self.lock_spaces()?.get(space_name).cloned())
    }

    /// Drops `entry` from the map unless it was already replaced.
    fn forget(&self, entry: &Arc<LockspaceEntry>) {
        match self.lock_spaces() {
            Ok(mut spaces) => {
                if spaces
                    .get(&entry.space_name)
                    .is_some_and(|cur| Arc::ptr_eq(cur, entry))
                {
                    spaces.remove(&entry.space_name);
                }
            }
            Err(e) => pf_error!("error forgetting '{}': {}", entry.space_name, e),
        }
    }

    /// An entry in Acquired state with its slot, generation, and status
    /// source, or `NotFound`.
    fn joined_entry(
        &self,
        space_name: &str,
    ) -> Result<(Arc<LockspaceEntry>, DeltaSlot, u64), SectorlockError> {
        let entry = self.entry(space_name)?.ok_or_else(|| {
            SectorlockError::not_found(format!(
                "lockspace '{}' not joined",
                space_name
            ))
        })?;
        let joined = entry
            .with_joined(|j| (j.slot.clone(), j.generation))?
            .filter(|_| entry.state() == LockspaceState::Acquired);
        match joined {
            Some((slot, generation)) => Ok((entry, slot, generation)),
            None => Err(SectorlockError::not_found(format!(
                "lockspace '{}' not joined",
                space_name
            ))),
        }
    }

    /// Claims our slot and starts renewing it. On failure the entry is
    /// marked Released and forgotten.
    async fn join(
        self: Arc<Self>,
        entry: Arc<LockspaceEntry>,
    ) -> Result<(), SectorlockError> {
        let res = async {
            let slot = DeltaSlot::open(
                self.io.clone(),
                entry.disk.clone(),
                &entry.space_name,
                entry.host_id,
                entry.io_timeout,
            )
            .await?;
            let leader = slot.acquire(&self.config.host_name).await?;
            let generation = leader.owner_generation;
            let renewer = Renewer::spawn(
                slot.clone(),
                leader,
                self.config.renewal_fraction,
                self.tx_fence.clone(),
            )?;
            entry.install(Joined {
                slot,
                generation,
                renewer,
            })?;
            Ok::<u64, SectorlockError>(generation)
        }
        .await;

        match res {
            Ok(generation) => {
                entry.set_state(LockspaceState::Acquired);
                pf_info!(
                    "joined lockspace '{}' as host {} gen {}",
                    entry.space_name,
                    entry.host_id,
                    generation
                );
                Ok(())
            }
            Err(e) => {
                pf_error!(
                    "error joining lockspace '{}': {}",
                    entry.space_name,
                    e
                );
                // gone from the map before waiters see the end state
                self.forget(&entry);
                entry.set_state(LockspaceState::Released);
                Err(e)
            }
        }
    }

    /// Releases the resources held in the lockspace, stops renewing, and
    /// frees our slot if the lease was still healthy.
    async fn leave(
        self: Arc<Self>,
        entry: Arc<LockspaceEntry>,
    ) -> Result<(), SectorlockError> {
        let held = self.sessions.take_in_lockspace(&entry.space_name)?;
        release_leases(
            held.into_iter().map(|(_, lease)| lease).collect(),
            "leaving lockspace",
        )
        .await;

        let mut result = Ok(());
        if let Some(joined) = entry.take_joined()? {
            match joined.renewer.stop().await {
                Ok(Some(last)) => {
                    if let Err(e) = joined.slot.release(&last).await {
                        pf_error!(
                            "error freeing slot in '{}': {}",
                            entry.space_name,
                            e
                        );
                        result = Err(e);
                    }
                }
                Ok(None) => pf_warn!(
                    "lockspace '{}' lease already lost, slot left as is",
                    entry.space_name
                ),
                Err(e) => result = Err(e),
            }
        }

        self.forget(&entry);
        entry.set_state(LockspaceState::Released);
        pf_info!("left lockspace '{}'", entry.space_name);
        result
    }

    /// Handles a renewal failure: everything under that lease is dropped.
    async fn fence(self: Arc<Self>, notice: FenceNotice) {
        let entry = match self.entry(&notice.space_name) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                pf_error!("error looking up fenced lockspace: {}", e);
                return;
            }
        };
        let current = entry.with_joined(|j| j.generation).ok().flatten();
        if current != Some(notice.generation)
            || entry.state() != LockspaceState::Acquired
        {
            pf_debug!("stale fence notice for '{}'", notice.space_name);
            return;
        }

        pf_error!(
            "lockspace '{}' fenced: {}",
            notice.space_name,
            notice.reason
        );
        entry.set_state(LockspaceState::Releasing);
        if let Err(e) = self.leave(entry).await {
            pf_error!("error cleaning up fenced lockspace: {}", e);
        }
    }

    /// Fence notice handler task function.
    async fn fence_task(
        self: Arc<Self>,
        mut rx_fence: mpsc::UnboundedReceiver<FenceNotice>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                res = rx_stop.changed() => {
                    if res.is_err() || *rx_stop.borrow() {
                        break;
                    }
                },

                notice = rx_fence.recv() => {
                    match notice {
                        Some(notice) => self.clone().fence(notice).await,
                        None => break,
                    }
                },
            }
        }
        pf_debug!("fence handler exited");
    }

    fn acquire_opts(&self, nowait: bool) -> AcquireOpts {
        AcquireOpts {
            nowait,
            retry_max_us: self.config.acquire_retry_max_us,
            owner_poll: Duration::from_millis(self.config.owner_poll_ms),
            max_owner_polls: self.config.max_owner_polls,
        }
    }

    /// Runs one acquire for `session_id`, whose in-flight mark is already
    /// set, and records the outcome.
    async fn run_acquire(
        self: Arc<Self>,
        session_id: u64,
        space_name: String,
        resource_name: String,
        disks: Vec<DiskLocation>,
        nowait: bool,
    ) -> Result<LeaderRecord, SectorlockError> {
        let res = async {
            let (entry, slot, generation) = self.joined_entry(&space_name)?;
            let resource = PaxosResource::open(
                self.io.clone(),
                &space_name,
                &resource_name,
                disks,
                slot.io_timeout,
            )
            .await?;
            let proposer = Proposer {
                host_id: slot.host_id,
                generation,
            };
            let hosts = LockspaceHosts {
                entry: entry.clone(),
                slot,
            };
            let grant = resource
                .acquire(proposer, &hosts, &self.acquire_opts(nowait))
                .await?;
            Ok::<_, SectorlockError>((entry, generation, HeldLease {
                resource,
                proposer,
                grant,
            }))
        }
        .await;

        match res {
            Ok((entry, generation, lease)) => {
                let leader = lease.grant.leader.clone();
                let still_joined = entry.state() == LockspaceState::Acquired
                    && entry.with_joined(|j| j.generation)? == Some(generation);
                if !still_joined {
                    self.sessions.finish_acquire(session_id, None)?;
                    release_leases(vec![lease], "lockspace lost").await;
                    return Err(SectorlockError::conflict(format!(
                        "lockspace '{}' lost during acquire",
                        space_name
                    )));
                }
                if let Some(orphan) =
                    self.sessions.finish_acquire(session_id, Some(lease))?
                {
                    release_leases(vec![orphan], "session ended").await;
                    return Err(SectorlockError::not_found(format!(
                        "session {} ended during acquire",
                        session_id
                    )));
                }
                Ok(leader)
            }
            Err(e) => {
                self.sessions.finish_acquire(session_id, None)?;
                Err(e)
            }
        }
    }
}

/// Lease manager of one host.
pub struct LeaseDaemon {
    core: Arc<DaemonCore>,
    reaper: SessionReaper,
    tx_stop: watch::Sender<bool>,
    fence_handle: JoinHandle<()>,
}

impl LeaseDaemon {
    /// Creates the daemon and spawns its session reaper and fence handler.
    /// Must run inside a tokio runtime.
    pub async fn new_and_setup(
        io: Arc<dyn SectorIo>,
        config_str: Option<&str>,
    ) -> Result<Self, SectorlockError> {
        let config = DaemonConfig::from_toml(config_str)?;
        if ME.set(config.host_name.clone()).is_err() {
            pf_debug!("log prefix already set");
        }

        let (sessions, rx_dropped) = SessionTable::new();
        let reaper = SessionReaper::spawn(
            sessions.clone(),
            rx_dropped,
            Duration::from_millis(config.session_timeout_ms),
            Duration::from_millis(config.session_check_ms),
        )?;

        let (tx_fence, rx_fence) = mpsc::unbounded_channel();
        let core = Arc::new(DaemonCore {
            config,
            io,
            lockspaces: Mutex::new(HashMap::new()),
            sessions,
            tx_fence,
        });

        let (tx_stop, rx_stop) = watch::channel(false);
        let fence_handle =
            tokio::spawn(core.clone().fence_task(rx_fence, rx_stop));

        pf_info!("lease daemon '{}' started", core.config.host_name);
        Ok(LeaseDaemon {
            core,
            reaper,
            tx_stop,
            fence_handle,
        })
    }

    /// Host name written into claimed lockspace slots.
    pub fn host_name(&self) -> &str {
        &self.core.config.host_name
    }

    /// Leaves every lockspace and stops the background tasks.
    pub async fn shutdown(self) -> Result<(), SectorlockError> {
        let entries: Vec<Arc<LockspaceEntry>> =
            self.core.lock_spaces()?.values().cloned().collect();
        for entry in entries {
            if entry.settled().await == LockspaceState::Acquired {
                entry.set_state(LockspaceState::Releasing);
                if let Err(e) = self.core.clone().leave(entry).await {
                    pf_error!("error leaving lockspace at shutdown: {}", e);
                }
            }
        }
        let _ = self.tx_stop.send(true);
        self.fence_handle.await?;
        self.reaper.stop().await
    }

    /// Writes a fresh lockspace area at `disk`.
    pub async fn write_lockspace(
        &self,
        space_name: &str,
        disk: &DiskLocation,
        io_timeout: u64,
        align: Option<u64>,
        sector: Option<u32>,
    ) -> Result<(), SectorlockError> {
        let geometry = Geometry::new(align, sector)?;
        check_name("lockspace", space_name)?;
        let io_timeout = check_io_timeout(io_timeout)?;
        disk.check_offset(geometry.sector_bytes())?;
        init_lockspace(
            self.core.io.as_ref(),
            disk,
            &geometry,
            space_name,
            io_timeout,
        )
        .await
    }

    /// Reads the identity of the lockspace area at `disk`. An explicit
    /// geometry must match the one the area was written with.
    pub async fn read_lockspace(
        &self,
        disk: &DiskLocation,
        align: Option<u64>,
        sector: Option<u32>,
    ) -> Result<LockspaceInfo, SectorlockError> {
        if align.is_some() || sector.is_some() {
            let geometry = Geometry::new(align, sector)?;
            disk.check_offset(geometry.sector_bytes())?;
        }
        let leader =
            read_first_leader(self.core.io.as_ref(), disk, DEFAULT_IO_TIMEOUT)
                .await?;
        check_geometry(&leader, align, sector)?;
        Ok(LockspaceInfo {
            space_name: leader.space_name,
            io_timeout: leader.io_timeout,
        })
    }

    /// Joins lockspace `space_name` as `host_id`. With `async_` set, returns
    /// as soon as the join is under way; `inq_lockspace` reports progress.
    pub async fn add_lockspace(
        &self,
        space_name: &str,
        host_id: u64,
        disk: &DiskLocation,
        io_timeout: u64,
        async_: bool,
    ) -> Result<(), SectorlockError> {
        check_name("lockspace", space_name)?;
        if host_id == 0 || host_id > MAX_HOSTS {
            return Err(SectorlockError::invalid(format!(
                "host_id {} out of range 1..={}",
                host_id, MAX_HOSTS
            )));
        }
        let io_timeout = check_io_timeout(io_timeout)?;

        let entry = {
            let mut spaces = self.core.lock_spaces()?;
            if let Some(cur) = spaces.get(space_name) {
                return Err(SectorlockError::busy(format!(
                    "lockspace '{}' is {:?} as host {}",
                    space_name,
                    cur.state(),
                    cur.host_id
                )));
            }
            let entry = Arc::new(LockspaceEntry::new(
                space_name,
                host_id,
                disk.clone(),
                io_timeout,
            ));
            entry.set_state(LockspaceState::Acquiring);
            spaces.insert(space_name.into(), entry.clone());
            entry
        };

        if async_ {
            let core = self.core.clone();
            tokio::spawn(async move {
                let space_name = entry.space_name.clone();
                if let Err(e) = core.join(entry).await {
                    pf_warn!(
                        "async join of '{}' settled as not held: {}",
                        space_name,
                        e
                    );
                }
            });
            Ok(())
        } else {
            self.core.clone().join(entry).await
        }
    }

    /// Leaves lockspace `space_name`, releasing resources held in it first.
    pub async fn rem_lockspace(
        &self,
        space_name: &str,
        host_id: u64,
        disk: &DiskLocation,
        async_: bool,
    ) -> Result<(), SectorlockError> {
        let entry = self
            .core
            .entry(space_name)?
            .filter(|entry| entry.matches(host_id, disk))
            .ok_or_else(|| {
                SectorlockError::not_found(format!(
                    "lockspace '{}' host {} at {} not joined",
                    space_name, host_id, disk
                ))
            })?;
        if entry.state() != LockspaceState::Acquired {
            return Err(SectorlockError::busy(format!(
                "lockspace '{}' is {:?}",
                space_name,
                entry.state()
            )));
        }
        entry.set_state(LockspaceState::Releasing);

        if async_ {
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = core.leave(entry).await {
                    pf_error!("error leaving lockspace: {}", e);
                }
            });
            Ok(())
        } else {
            self.core.clone().leave(entry).await
        }
    }

    /// Whether we hold lockspace `space_name` as `host_id` at `disk`. With
    /// `wait` set, an in-progress join or leave is awaited first.
    pub async fn inq_lockspace(
        &self,
        space_name: &str,
        host_id: u64,
        disk: &DiskLocation,
        wait: bool,
    ) -> Result<LockspaceStatus, SectorlockError> {
        let Some(entry) = self
            .core
            .entry(space_name)?
            .filter(|entry| entry.matches(host_id, disk))
        else {
            return Ok(LockspaceStatus::NotHeld);
        };
        let state = if wait {
            entry.settled().await
        } else {
            entry.state()
        };
        Ok(state.status())
    }

    /// Names and states of all lockspaces known to the daemon.
    pub fn lockspaces(
        &self,
    ) -> Result<Vec<(String, LockspaceStatus)>, SectorlockError> {
        let mut list: Vec<(String, LockspaceStatus)> = self
            .core
            .lock_spaces()?
            .values()
            .map(|entry| (entry.space_name.clone(), entry.state().status()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(list)
    }

    /// Host records of lockspace `space_name`: all of them if `host_id` is
    /// 0, else just that host's. Not available before our first renewal.
    pub fn get_hosts(
        &self,
        space_name: &str,
        host_id: u64,
    ) -> Result<Vec<HostRecord>, SectorlockError> {
        let (entry, slot, _) = self.core.joined_entry(space_name)?;
        let hosts = entry
            .with_joined(|j| j.renewer.hosts().all())?
            .unwrap_or_default();
        if !hosts.iter().any(|h| h.host_id == slot.host_id) {
            return Err(SectorlockError::not_yet(format!(
                "host status of '{}' not available yet",
                space_name
            )));
        }
        Ok(hosts
            .into_iter()
            .filter(|h| host_id == 0 || h.host_id == host_id)
            .collect())
    }

    /// Writes a fresh resource area to every disk in `disks`.
    pub async fn write_resource(
        &self,
        space_name: &str,
        resource_name: &str,
        disks: &[DiskLocation],
        align: Option<u64>,
        sector: Option<u32>,
    ) -> Result<(), SectorlockError> {
        let geometry = Geometry::new(align, sector)?;
        check_name("lockspace", space_name)?;
        check_name("resource", resource_name)?;
        init_resource(
            self.core.io.as_ref(),
            disks,
            &geometry,
            space_name,
            resource_name,
            DEFAULT_IO_TIMEOUT,
        )
        .await
    }

    /// Reads the identity and version of the resource area at `disk`. An
    /// explicit geometry must match the one the area was written with.
    pub async fn read_resource(
        &self,
        disk: &DiskLocation,
        align: Option<u64>,
        sector: Option<u32>,
    ) -> Result<ResourceInfo, SectorlockError> {
        if align.is_some() || sector.is_some() {
            let geometry = Geometry::new(align, sector)?;
            disk.check_offset(geometry.sector_bytes())?;
        }
        let leader =
            read_resource(self.core.io.as_ref(), disk, DEFAULT_IO_TIMEOUT)
                .await?;
        check_geometry(&leader, align, sector)?;
        Ok(ResourceInfo {
            space_name: leader.space_name,
            resource_name: leader.resource_name,
            version: leader.lver,
        })
    }

    /// Committed owners of a resource; empty if it is not held.
    pub async fn read_resource_owners(
        &self,
        space_name: &str,
        resource_name: &str,
        disks: &[DiskLocation],
    ) -> Result<Vec<OwnerRecord>, SectorlockError> {
        let resource = PaxosResource::open(
            self.core.io.clone(),
            space_name,
            resource_name,
            disks.to_vec(),
            DEFAULT_IO_TIMEOUT,
        )
        .await?;
        resource.read_owners().await
    }

    /// Registers a new client session.
    pub fn register(&self) -> Result<SessionHandle, SectorlockError> {
        self.core.sessions.register()
    }

    /// Ends a session, releasing everything it holds.
    pub async fn unregister(
        &self,
        session: SessionHandle,
    ) -> Result<(), SectorlockError> {
        if let Some(leases) = self.core.sessions.remove(session.id())? {
            release_leases(leases, "session unregistered").await;
        }
        pf_debug!("session {} unregistered", session.id());
        Ok(())
    }

    /// Keeps a session alive.
    pub fn heartbeat(&self, session: &SessionHandle) -> Result<(), SectorlockError> {
        self.core.sessions.heartbeat(session.id())
    }

    /// Resources held by a session.
    pub fn inquire(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<ResourceKey>, SectorlockError> {
        self.core.sessions.inquire(session.id())
    }

    /// Acquires a resource for `session`, returning the committed leader.
    /// Our lockspace must be joined. Only one acquire per session may be in
    /// flight.
    pub async fn acquire(
        &self,
        session: &SessionHandle,
        space_name: &str,
        resource_name: &str,
        disks: &[DiskLocation],
        nowait: bool,
    ) -> Result<LeaderRecord, SectorlockError> {
        let key: ResourceKey = (space_name.into(), resource_name.into());
        self.core.sessions.begin_acquire(session.id(), &key)?;
        self.core
            .clone()
            .run_acquire(
                session.id(),
                key.0,
                key.1,
                disks.to_vec(),
                nowait,
            )
            .await
    }

    /// Starts an acquire and returns at once; the outcome shows up through
    /// `inquire` and `read_resource_owners`. Argument and session errors are
    /// still reported synchronously.
    pub fn acquire_async(
        &self,
        session: &SessionHandle,
        space_name: &str,
        resource_name: &str,
        disks: &[DiskLocation],
        nowait: bool,
    ) -> Result<JoinHandle<Result<LeaderRecord, SectorlockError>>, SectorlockError>
    {
        check_name("lockspace", space_name)?;
        check_name("resource", resource_name)?;
        let key: ResourceKey = (space_name.into(), resource_name.into());
        self.core.sessions.begin_acquire(session.id(), &key)?;
        Ok(tokio::spawn(self.core.clone().run_acquire(
            session.id(),
            key.0,
            key.1,
            disks.to_vec(),
            nowait,
        )))
    }

    /// Releases a resource held by `session`. The version is preserved. If
    /// the disk release fails the lease stays with the session.
    pub async fn release(
        &self,
        session: &SessionHandle,
        space_name: &str,
        resource_name: &str,
        disks: &[DiskLocation],
    ) -> Result<LeaderRecord, SectorlockError> {
        let key: ResourceKey = (space_name.into(), resource_name.into());
        let lease = self.core.sessions.take(session.id(), &key)?;
        if !disks.is_empty() && disks != lease.resource.disks.as_slice() {
            pf_warn!(
                "releasing {} on the disks it was acquired on",
                lease.resource
            );
        }
        let res = lease.release().await;
        match res {
            Ok(leader) => Ok(leader),
            Err(e) => {
                // the owner record may still be on disk
                if let Some(orphan) =
                    self.core.sessions.restore(session.id(), lease)?
                {
                    release_leases(vec![orphan], "session ended").await;
                }
                Err(e)
            }
        }
    }

    /// Releases everything held by `session`; returns how many leases.
    pub async fn release_all(
        &self,
        session: &SessionHandle,
    ) -> Result<usize, SectorlockError> {
        let leases = self.core.sessions.take_all(session.id())?;
        let count = leases.len();
        release_leases(leases, "release_all").await;
        Ok(count)
    }
}
