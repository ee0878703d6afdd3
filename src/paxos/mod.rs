//! Paxos leases: single-owner resources decided by disk Paxos.

mod ballot;
mod lease;

pub use ballot::{
    committed_leader, initial_mbal, judge_owner, Ballot, BallotAbort,
    OwnerVerdict,
};
pub use lease::{
    init_resource, read_resource, AcquireOpts, OwnerRecord, OwnerStatus,
    PaxosGrant, PaxosResource, Proposer, MAX_DISKS,
};
