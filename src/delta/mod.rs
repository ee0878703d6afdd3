//! Delta leases: lockspace membership and host liveness.

mod lease;
mod monitor;
mod renewal;

pub use lease::{
    host_dead_secs, init_lockspace, read_all_slots, read_first_leader,
    DeltaSlot, DEFAULT_IO_TIMEOUT,
};
pub use monitor::{HostFlag, HostMonitor, HostRecord, HostTable};
pub use renewal::{FenceNotice, Renewer};
