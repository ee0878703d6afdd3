//! Per-lockspace bookkeeping of the lease daemon.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::delta::{DeltaSlot, HostFlag, HostRecord, Renewer};
use crate::disk::DiskLocation;
use crate::paxos::OwnerStatus;
use crate::utils::SectorlockError;

use async_trait::async_trait;

use tokio::sync::watch;

/// Lifecycle of our membership in one lockspace.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LockspaceState {
    Unknown,
    Acquiring,
    Acquired,
    Releasing,
    Released,
}

impl LockspaceState {
    #[inline]
    pub fn status(self) -> LockspaceStatus {
        match self {
            Self::Acquired => LockspaceStatus::Held,
            Self::Acquiring | Self::Releasing => LockspaceStatus::InProgress,
            Self::Unknown | Self::Released => LockspaceStatus::NotHeld,
        }
    }
}

/// Answer of a lockspace inquiry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LockspaceStatus {
    Held,
    NotHeld,
    InProgress,
}

impl fmt::Display for LockspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Held => write!(f, "held"),
            Self::NotHeld => write!(f, "not held"),
            Self::InProgress => write!(f, "in progress"),
        }
    }
}

/// Everything that exists while our delta lease is held.
pub(crate) struct Joined {
    pub(crate) slot: DeltaSlot,
    pub(crate) generation: u64,
    pub(crate) renewer: Renewer,
}

/// One lockspace we joined or are joining.
pub(crate) struct LockspaceEntry {
    pub(crate) space_name: String,
    pub(crate) host_id: u64,
    pub(crate) disk: DiskLocation,
    pub(crate) io_timeout: u16,
    tx_state: watch::Sender<LockspaceState>,
    joined: Mutex<Option<Joined>>,
}

impl LockspaceEntry {
    pub(crate) fn new(
        space_name: &str,
        host_id: u64,
        disk: DiskLocation,
        io_timeout: u16,
    ) -> Self {
        let (tx_state, _) = watch::channel(LockspaceState::Unknown);
        LockspaceEntry {
            space_name: space_name.into(),
            host_id,
            disk,
            io_timeout,
            tx_state,
            joined: Mutex::new(None),
        }
    }

    /// True if this entry is about the given host slot.
    pub(crate) fn matches(&self, host_id: u64, disk: &DiskLocation) -> bool {
        self.host_id == host_id && &self.disk == disk
    }

    pub(crate) fn state(&self) -> LockspaceState {
        *self.tx_state.borrow()
    }

    pub(crate) fn set_state(&self, state: LockspaceState) {
        pf_debug!("lockspace '{}' -> {:?}", self.space_name, state);
        self.tx_state.send_replace(state);
    }

    /// Waits until the state leaves the in-progress states.
    pub(crate) async fn settled(&self) -> LockspaceState {
        let mut rx_state = self.tx_state.subscribe();
        let state = match rx_state
            .wait_for(|s| s.status() != LockspaceStatus::InProgress)
            .await
        {
            Ok(state) => *state,
            Err(_) => LockspaceState::Released,
        };
        state
    }

    pub(crate) fn install(&self, joined: Joined) -> Result<(), SectorlockError> {
        let mut slot = self
            .joined
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?;
        *slot = Some(joined);
        Ok(())
    }

    pub(crate) fn take_joined(&self) -> Result<Option<Joined>, SectorlockError> {
        Ok(self
            .joined
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?
            .take())
    }

    /// Runs `f` on the joined state, if any.
    pub(crate) fn with_joined<T>(
        &self,
        f: impl FnOnce(&Joined) -> T,
    ) -> Result<Option<T>, SectorlockError> {
        Ok(self
            .joined
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?
            .as_ref()
            .map(f))
    }
}

/// Owner status as this host sees it in one joined lockspace: the monitor's
/// table first, and for hosts the monitor never saw, their slot on disk.
pub(crate) struct LockspaceHosts {
    pub(crate) entry: Arc<LockspaceEntry>,
    pub(crate) slot: DeltaSlot,
}

#[async_trait]
impl OwnerStatus for LockspaceHosts {
    async fn host_status(
        &self,
        host_id: u64,
    ) -> Result<Option<HostRecord>, SectorlockError> {
        let seen = self
            .entry
            .with_joined(|joined| joined.renewer.hosts().get(host_id))?
            .flatten();
        if let Some(record) = seen {
            return Ok(Some(record));
        }
        let leader = self.slot.read_host(host_id).await?;
        if leader.owner_generation == 0 || leader.is_free() {
            return Ok(Some(HostRecord {
                host_id,
                generation: leader.owner_generation,
                flags: HostFlag::Free,
                timestamp: leader.timestamp,
                io_timeout: leader.io_timeout,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod lockspace_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[test]
    fn state_to_status() {
        assert_eq!(LockspaceState::Unknown.status(), LockspaceStatus::NotHeld);
        assert_eq!(
            LockspaceState::Acquiring.status(),
            LockspaceStatus::InProgress
        );
        assert_eq!(LockspaceState::Acquired.status(), LockspaceStatus::Held);
        assert_eq!(
            LockspaceState::Releasing.status(),
            LockspaceStatus::InProgress
        );
        assert_eq!(LockspaceState::Released.status(), LockspaceStatus::NotHeld);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settled_waits() -> Result<(), SectorlockError> {
        let entry = Arc::new(LockspaceEntry::new(
            "ls",
            1,
            DiskLocation::new("/mem/ls", 0),
            1,
        ));
        assert_eq!(entry.settled().await, LockspaceState::Unknown);

        entry.set_state(LockspaceState::Acquiring);
        let setter = entry.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            setter.set_state(LockspaceState::Acquired);
        });
        assert_eq!(entry.state(), LockspaceState::Acquiring);
        assert_eq!(entry.settled().await, LockspaceState::Acquired);
        assert!(entry.matches(1, &DiskLocation::new("/mem/ls", 0)));
        assert!(!entry.matches(2, &DiskLocation::new("/mem/ls", 0)));
        Ok(())
    }
}
