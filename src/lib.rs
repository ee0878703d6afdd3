//! Sectorlock: host-exclusive leases on shared block storage.
//!
//! Hosts join a lockspace through a delta lease on their own slot and keep
//! it renewed; resources inside a joined lockspace are leased through disk
//! Paxos ballots over one or more replicas.

#[macro_use]
mod utils;

pub mod daemon;
pub mod delta;
pub mod disk;
pub mod ondisk;
pub mod paxos;
pub mod session;

pub use crate::utils::{
    logger_init, now_secs, Deadline, DiskSet, ErrorKind, SectorlockError, ME,
};

pub use crate::daemon::{
    DaemonConfig, LeaseDaemon, LockspaceInfo, LockspaceState,
    LockspaceStatus, ResourceInfo,
};
pub use crate::delta::{FenceNotice, HostFlag, HostRecord};
pub use crate::disk::{DiskLocation, Fault, FileIo, Geometry, MemDisk, SectorIo};
pub use crate::ondisk::LeaderRecord;
pub use crate::paxos::OwnerRecord;
pub use crate::session::{ResourceKey, SessionHandle, SessionId};
