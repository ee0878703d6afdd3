//! Disk Paxos ballot logic, free of any I/O.
//!
//! A ballot for lease version `lver` runs two phases. In each phase the
//! proposer publishes its dblock to every disk, then inspects every host's
//! dblock on every disk. Any block for a newer version, or with a larger
//! `mbal`, aborts the ballot. Between the phases the proposer adopts the
//! input of the highest-`bal` block it saw, or its own if none carried one.
//! The I/O driver in `paxos::lease` feeds blocks in; this module decides.

use std::fmt;

use crate::delta::{HostFlag, HostRecord};
use crate::ondisk::{LeaderRecord, PaxosDblock, LFL_SHORT_HOLD};

/// Why a ballot was abandoned. Both cases are retried with a larger `mbal`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BallotAbort {
    /// Host `q + 1` already works on a later lease version.
    LargerLver { q: u64, lver: u64 },
    /// Host `q + 1` runs a ballot with a larger number.
    LargerMbal { q: u64, mbal: u64 },
}

impl BallotAbort {
    /// The competing ballot number, if that is why we lost.
    #[inline]
    pub fn seen_mbal(&self) -> u64 {
        match self {
            Self::LargerMbal { mbal, .. } => *mbal,
            Self::LargerLver { .. } => 0,
        }
    }
}

impl fmt::Display for BallotAbort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LargerLver { q, lver } => {
                write!(f, "larger lver {} in bk[{}]", lver, q)
            }
            Self::LargerMbal { q, mbal } => {
                write!(f, "larger mbal {} in bk[{}]", mbal, q)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Phase {
    One,
    Two,
}

/// First ballot number for `host_id`: its own id if no ballot was ever run,
/// else the next round above the largest `mbal` seen on disk.
pub fn initial_mbal(max_mbal_seen: u64, max_hosts: u64, host_id: u64) -> u64 {
    if max_mbal_seen == 0 {
        host_id
    } else {
        max_mbal_seen - (max_mbal_seen % max_hosts) + max_hosts + host_id
    }
}

/// State of one ballot attempt.
#[derive(Debug, Clone)]
pub struct Ballot {
    dblock: PaxosDblock,
    phase: Phase,
    best: Option<PaxosDblock>,
}

impl Ballot {
    pub fn new(next_lver: u64, mbal: u64) -> Self {
        Ballot {
            dblock: PaxosDblock {
                mbal,
                lver: next_lver,
                ..Default::default()
            },
            phase: Phase::One,
            best: None,
        }
    }

    /// Our dblock as it should be written in the current phase.
    #[inline]
    pub fn dblock(&self) -> PaxosDblock {
        self.dblock
    }

    #[inline]
    pub fn in_phase2(&self) -> bool {
        self.phase == Phase::Two
    }

    /// Inspects host `q + 1`'s dblock as read back from one disk.
    pub fn examine(
        &mut self,
        q: u64,
        bk: &PaxosDblock,
    ) -> Result<(), BallotAbort> {
        if bk.lver < self.dblock.lver {
            return Ok(());
        }
        if bk.lver > self.dblock.lver {
            return Err(BallotAbort::LargerLver { q, lver: bk.lver });
        }
        if bk.mbal > self.dblock.mbal {
            return Err(BallotAbort::LargerMbal { q, mbal: bk.mbal });
        }

        if self.phase == Phase::One && bk.inp != 0 {
            if bk.bal == 0 {
                pf_warn!("zero bal with inp {} in bk[{}]", bk.inp, q);
                return Ok(());
            }
            if self.best.map_or(true, |best| bk.bal > best.bal) {
                self.best = Some(*bk);
            }
        }
        Ok(())
    }

    /// Ends phase 1: adopts the highest-`bal` input seen, or `own` given as
    /// `(host_id, generation, timestamp)`, and moves to phase 2.
    pub fn choose(&mut self, own: (u64, u64, u64)) -> PaxosDblock {
        let (inp, inp2, inp3) = match self.best {
            Some(best) => (best.inp, best.inp2, best.inp3),
            None => own,
        };
        self.dblock.inp = inp;
        self.dblock.inp2 = inp2;
        self.dblock.inp3 = inp3;
        self.dblock.bal = self.dblock.mbal;
        self.phase = Phase::Two;
        self.dblock
    }

    /// Restarts as a fresh ballot for `host_id` in the first round above
    /// both our last ballot and `seen_mbal`.
    pub fn retry(&mut self, max_hosts: u64, host_id: u64, seen_mbal: u64) {
        let next_lver = self.dblock.lver;
        let highest = self.dblock.mbal.max(seen_mbal);
        *self = Ballot::new(next_lver, initial_mbal(highest, max_hosts, host_id));
    }
}

/// Leader to commit after a successful ballot, written by `writer` as
/// `(host_id, generation)` at time `now`.
pub fn committed_leader(
    cur: &LeaderRecord,
    dblock: &PaxosDblock,
    writer: (u64, u64),
    now: u64,
) -> LeaderRecord {
    let mut leader = cur.clone();
    leader.lver = dblock.lver;
    leader.owner_id = dblock.inp;
    leader.owner_generation = dblock.inp2;
    leader.timestamp = dblock.inp3;
    leader.write_id = writer.0;
    leader.write_generation = writer.1;
    leader.write_timestamp = now;
    if leader.owner_id == writer.0 {
        leader.flags &= !LFL_SHORT_HOLD;
    }
    leader
}

/// What to do about a resource's current owner before running a ballot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OwnerVerdict {
    /// Free, ours, or the owner is gone: run a ballot.
    Run,
    /// The owner is alive and renewing.
    Live,
    /// Not enough observations yet to decide.
    Wait,
}

/// Decides whether `me` as `(host_id, generation)` may contend for a lease
/// whose leader is `leader`, given the owner's status in the lockspace.
pub fn judge_owner(
    leader: &LeaderRecord,
    me: (u64, u64),
    owner_status: Option<&HostRecord>,
) -> OwnerVerdict {
    if leader.is_free() {
        return OwnerVerdict::Run;
    }
    if leader.owner_id == me.0 && leader.owner_generation <= me.1 {
        // held by this or an earlier incarnation of us
        return OwnerVerdict::Run;
    }

    let Some(status) = owner_status else {
        return OwnerVerdict::Wait;
    };
    if status.generation > leader.owner_generation {
        return OwnerVerdict::Run;
    }
    match status.flags {
        HostFlag::Free | HostFlag::Dead => OwnerVerdict::Run,
        HostFlag::Live => OwnerVerdict::Live,
        HostFlag::Unknown | HostFlag::Fail => OwnerVerdict::Wait,
    }
}

#[cfg(test)]
mod ballot_tests {
    use super::*;
    use crate::disk::Geometry;
    use crate::ondisk::LeaseKind;

    fn bk(mbal: u64, bal: u64, inp: u64, lver: u64) -> PaxosDblock {
        PaxosDblock {
            mbal,
            bal,
            inp,
            inp2: if inp > 0 { 1 } else { 0 },
            inp3: if inp > 0 { 100 + inp } else { 0 },
            lver,
            ..Default::default()
        }
    }

    #[test]
    fn mbal_numbering() {
        assert_eq!(initial_mbal(0, 2000, 3), 3);
        assert_eq!(initial_mbal(3, 2000, 1), 2001);
        assert_eq!(initial_mbal(2001, 2000, 2), 4002);
        assert_eq!(initial_mbal(14002, 2000, 1), 16001);
    }

    #[test]
    fn uncontended_ballot_chooses_own() {
        let mut ballot = Ballot::new(1, 2);
        assert!(!ballot.in_phase2());
        // our own block and a blank one
        assert_eq!(ballot.examine(1, &ballot.dblock()), Ok(()));
        assert_eq!(ballot.examine(0, &PaxosDblock::default()), Ok(()));
        let chosen = ballot.choose((2, 5, 999));
        assert!(ballot.in_phase2());
        assert_eq!((chosen.inp, chosen.inp2, chosen.inp3), (2, 5, 999));
        assert_eq!(chosen.bal, 2);
        assert_eq!(chosen.mbal, 2);
        assert_eq!(chosen.lver, 1);
        assert_eq!(ballot.examine(1, &chosen), Ok(()));
    }

    #[test]
    fn adopts_highest_bal_input() {
        let mut ballot = Ballot::new(5, 6003);
        assert_eq!(ballot.examine(0, &bk(4001, 4001, 1, 5)), Ok(()));
        assert_eq!(ballot.examine(1, &bk(2002, 2002, 2, 5)), Ok(()));
        // stale version is ignored entirely
        assert_eq!(ballot.examine(3, &bk(9999, 9999, 4, 4)), Ok(()));
        let chosen = ballot.choose((3, 1, 7));
        assert_eq!(chosen.inp, 1);
        assert_eq!(chosen.inp3, 101);
        assert_eq!(chosen.bal, 6003);
    }

    #[test]
    fn aborts() {
        let mut ballot = Ballot::new(5, 2001);
        assert_eq!(
            ballot.examine(1, &bk(2002, 0, 0, 5)),
            Err(BallotAbort::LargerMbal { q: 1, mbal: 2002 })
        );
        assert_eq!(
            ballot.examine(2, &bk(1, 0, 0, 6)),
            Err(BallotAbort::LargerLver { q: 2, lver: 6 })
        );
        ballot.retry(2000, 1, 0);
        assert_eq!(ballot.dblock().mbal, 4001);
        assert_eq!(ballot.dblock().lver, 5);
        assert_eq!(ballot.examine(1, &bk(2002, 0, 0, 5)), Ok(()));
    }

    #[test]
    fn retry_jumps_past_competitor() {
        let mut ballot = Ballot::new(3, 1);
        let abort = ballot.examine(4, &bk(40005, 0, 0, 3)).unwrap_err();
        assert_eq!(abort.seen_mbal(), 40005);
        ballot.retry(2000, 1, abort.seen_mbal());
        // one retry lands above the competitor, not 2001
        assert_eq!(ballot.dblock().mbal, 42001);
        assert_eq!(ballot.dblock().lver, 3);
        assert_eq!(ballot.examine(4, &bk(40005, 0, 0, 3)), Ok(()));

        // a later version carries no ballot number to jump past
        let abort = ballot.examine(2, &bk(1, 0, 0, 4)).unwrap_err();
        assert_eq!(abort.seen_mbal(), 0);
        ballot.retry(2000, 1, abort.seen_mbal());
        assert_eq!(ballot.dblock().mbal, 44001);
    }

    #[test]
    fn phase2_does_not_change_choice() {
        let mut ballot = Ballot::new(1, 1);
        ballot.choose((1, 1, 50));
        assert_eq!(ballot.examine(1, &bk(1, 1, 2, 1)), Ok(()));
        assert_eq!(ballot.dblock().inp, 1);
    }

    fn held_leader(owner: u64, gen: u64) -> LeaderRecord {
        let mut leader = LeaderRecord::new_free(
            LeaseKind::Paxos,
            &Geometry::DEFAULT,
            "ls",
            "res",
        );
        leader.owner_id = owner;
        leader.owner_generation = gen;
        leader.timestamp = 77;
        leader.lver = 3;
        leader
    }

    fn status(host_id: u64, generation: u64, flags: HostFlag) -> HostRecord {
        HostRecord {
            host_id,
            generation,
            flags,
            timestamp: 10,
            io_timeout: 1,
        }
    }

    #[test]
    fn owner_judgement() {
        let mut free = held_leader(2, 1);
        free.timestamp = 0;
        assert_eq!(judge_owner(&free, (1, 1), None), OwnerVerdict::Run);

        let ours_old = held_leader(1, 1);
        assert_eq!(judge_owner(&ours_old, (1, 2), None), OwnerVerdict::Run);

        let theirs = held_leader(2, 4);
        assert_eq!(judge_owner(&theirs, (1, 1), None), OwnerVerdict::Wait);
        for (flag, verdict) in [
            (HostFlag::Live, OwnerVerdict::Live),
            (HostFlag::Dead, OwnerVerdict::Run),
            (HostFlag::Free, OwnerVerdict::Run),
            (HostFlag::Unknown, OwnerVerdict::Wait),
        ] {
            let st = status(2, 4, flag);
            assert_eq!(judge_owner(&theirs, (1, 1), Some(&st)), verdict);
        }
        let rebooted = status(2, 5, HostFlag::Live);
        assert_eq!(
            judge_owner(&theirs, (1, 1), Some(&rebooted)),
            OwnerVerdict::Run
        );
    }

    #[test]
    fn commit_record() {
        let cur = held_leader(2, 4);
        let dblock = PaxosDblock {
            mbal: 2001,
            bal: 2001,
            inp: 1,
            inp2: 9,
            inp3: 555,
            lver: 4,
            ..Default::default()
        };
        let mut shorthold = cur.clone();
        shorthold.flags |= LFL_SHORT_HOLD;
        let leader = committed_leader(&shorthold, &dblock, (1, 9), 556);
        assert_eq!(leader.lver, 4);
        assert_eq!((leader.owner_id, leader.owner_generation), (1, 9));
        assert_eq!(leader.timestamp, 555);
        assert_eq!((leader.write_id, leader.write_timestamp), (1, 556));
        assert_eq!(leader.flags & LFL_SHORT_HOLD, 0);
        assert_eq!(leader.io_timeout, cur.io_timeout);
    }
}
