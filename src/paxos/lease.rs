//! Paxos lease on a resource area replicated over one or more disks.
//!
//! Every replica holds the same layout: the leader in sector 0, the request
//! record in sector 1, and host `N`'s dblock in sector `2 + N - 1`. Rounds
//! issue their per-replica I/O concurrently and need a strict majority of
//! replicas to answer, so a minority of broken disks never blocks progress.

use std::fmt;
use std::sync::Arc;

use crate::delta::HostRecord;
use crate::disk::{
    check_name, read_sectors, write_sectors, DiskLocation, Geometry, SectorIo,
    SectorSize,
};
use crate::ondisk::{
    LeaderRecord, LeaseKind, PaxosDblock, RequestRecord, DBLOCK_FL_RELEASED,
    LEASE_FREE, LFL_SHORT_HOLD,
};
use crate::paxos::{
    committed_leader, initial_mbal, judge_owner, Ballot, BallotAbort,
    OwnerVerdict,
};
use crate::utils::{now_secs, DiskSet, SectorlockError};

use async_trait::async_trait;

use bytes::{Bytes, BytesMut};

use futures::future::join_all;

use rand::Rng;

use tokio::time::{self, Duration};

/// Maximum number of replicas of one resource.
pub const MAX_DISKS: usize = 4;

/// Source of the current status of a resource owner in its lockspace.
#[async_trait]
pub trait OwnerStatus: Send + Sync {
    /// Status of `host_id`, or `None` if it cannot be judged yet.
    async fn host_status(
        &self,
        host_id: u64,
    ) -> Result<Option<HostRecord>, SectorlockError>;
}

/// Identity a host proposes itself under: its host id and its current
/// generation in the resource's lockspace.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Proposer {
    pub host_id: u64,
    pub generation: u64,
}

/// Knobs of one acquire attempt.
#[derive(Debug, Clone)]
pub struct AcquireOpts {
    /// Fail with `Busy` instead of waiting on an owner of unknown status.
    pub nowait: bool,
    /// Upper bound of the random back-off after an aborted ballot.
    pub retry_max_us: u64,
    /// Interval between owner status checks.
    pub owner_poll: Duration,
    /// Checks before giving up on an owner of unknown status.
    pub max_owner_polls: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            nowait: false,
            retry_max_us: 1_000_000,
            owner_poll: Duration::from_secs(1),
            max_owner_polls: 60,
        }
    }
}

/// Committed owner of a resource as reported to callers.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OwnerRecord {
    pub host_id: u64,
    pub generation: u64,
    pub flags: u32,
    pub io_timeout: u16,
    pub timestamp: u64,
}

/// What a successful acquire holds on to until release.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaxosGrant {
    pub leader: LeaderRecord,
    pub dblock: PaxosDblock,
}

/// Writes a fresh resource area to every replica: a free leader at version
/// 0, an empty request record, and zeroed dblocks, as one `align_size`
/// write per replica. All replicas must succeed.
pub async fn init_resource(
    io: &dyn SectorIo,
    disks: &[DiskLocation],
    geometry: &Geometry,
    space_name: &str,
    resource_name: &str,
    io_timeout: u16,
) -> Result<(), SectorlockError> {
    check_disks(disks, geometry)?;
    let sector_size = geometry.sector_bytes();
    let mut area = BytesMut::zeroed(geometry.align_bytes() as usize);
    let mut leader = LeaderRecord::new_free(
        LeaseKind::Paxos,
        geometry,
        space_name,
        resource_name,
    );
    let ss = sector_size as usize;
    area[..ss].copy_from_slice(&leader.encode_sector(sector_size));
    area[ss..2 * ss]
        .copy_from_slice(&RequestRecord::default().encode_sector(sector_size));

    let io_dur = Duration::from_secs(io_timeout as u64);
    let results = join_all(disks.iter().map(|disk| {
        write_sectors(io, disk, sector_size, 0, &area, io_dur)
    }))
    .await;
    for (disk, res) in disks.iter().zip(results) {
        if let Err(e) = res {
            pf_error!("error initializing resource area at {}: {}", disk, e);
            return Err(e);
        }
    }

    pf_debug!(
        "initialized resource '{}:{}' on {} disk(s) ({})",
        space_name,
        resource_name,
        disks.len(),
        geometry
    );
    Ok(())
}

/// Reads and verifies the leader of a resource area without knowing its
/// geometry in advance.
pub async fn read_resource(
    io: &dyn SectorIo,
    disk: &DiskLocation,
    io_timeout: u16,
) -> Result<LeaderRecord, SectorlockError> {
    let buf = read_sectors(
        io,
        disk,
        SectorSize::S4K.bytes(),
        0,
        1,
        Duration::from_secs(io_timeout as u64),
    )
    .await?;
    LeaderRecord::decode(&buf, LeaseKind::Paxos)
}

fn check_disks(
    disks: &[DiskLocation],
    geometry: &Geometry,
) -> Result<(), SectorlockError> {
    if disks.is_empty() || disks.len() > MAX_DISKS {
        return Err(SectorlockError::invalid(format!(
            "resource needs 1 to {} disks, got {}",
            MAX_DISKS,
            disks.len()
        )));
    }
    for disk in disks {
        disk.check_offset(geometry.sector_bytes())?;
    }
    Ok(())
}

/// One replica's decoded area: its leader and every host's dblock.
struct AreaView {
    leader: Result<LeaderRecord, SectorlockError>,
    dblocks: Vec<Result<PaxosDblock, SectorlockError>>,
}

/// Handle to a resource's replicated paxos lease.
#[derive(Debug, Clone)]
pub struct PaxosResource {
    io: Arc<dyn SectorIo>,
    pub space_name: String,
    pub resource_name: String,
    pub disks: Vec<DiskLocation>,
    pub geometry: Geometry,
    pub io_timeout: u16,
}

impl fmt::Display for PaxosResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.space_name, self.resource_name)
    }
}

impl PaxosResource {
    /// Opens the resource, learning its geometry from the first replica
    /// whose leader decodes and checking it carries the expected names.
    pub async fn open(
        io: Arc<dyn SectorIo>,
        space_name: &str,
        resource_name: &str,
        disks: Vec<DiskLocation>,
        io_timeout: u16,
    ) -> Result<Self, SectorlockError> {
        check_name("lockspace", space_name)?;
        check_name("resource", resource_name)?;
        check_disks(&disks, &Geometry::DEFAULT)?;

        let mut last_err = None;
        let mut found = None;
        for disk in &disks {
            match read_resource(io.as_ref(), disk, io_timeout).await {
                Ok(leader) => {
                    found = Some(leader);
                    break;
                }
                Err(e) => {
                    pf_warn!("error probing resource at {}: {}", disk, e);
                    last_err = Some(e);
                }
            }
        }
        let leader = match (found, last_err) {
            (Some(leader), _) => leader,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(SectorlockError::invalid("no resource disks"))
            }
        };

        if leader.space_name != space_name
            || leader.resource_name != resource_name
        {
            return Err(SectorlockError::format(format!(
                "resource area holds '{}:{}' not '{}:{}'",
                leader.space_name,
                leader.resource_name,
                space_name,
                resource_name
            )));
        }
        let geometry = leader.geometry()?;
        check_disks(&disks, &geometry)?;

        Ok(PaxosResource {
            io,
            space_name: space_name.into(),
            resource_name: resource_name.into(),
            disks,
            geometry,
            io_timeout,
        })
    }

    #[inline]
    fn io_dur(&self) -> Duration {
        Duration::from_secs(self.io_timeout as u64)
    }

    /// Writes the same sectors to every replica concurrently; returns which
    /// replicas acknowledged.
    async fn write_all(
        &self,
        first: u64,
        data: &[u8],
    ) -> Result<DiskSet, SectorlockError> {
        let sector_size = self.geometry.sector_bytes();
        let results = join_all(self.disks.iter().map(|disk| {
            write_sectors(
                self.io.as_ref(),
                disk,
                sector_size,
                first,
                data,
                self.io_dur(),
            )
        }))
        .await;

        let mut acks = DiskSet::empty(self.disks.len());
        for (d, res) in results.into_iter().enumerate() {
            match res {
                Ok(()) => acks.insert(d)?,
                Err(e) => pf_warn!(
                    "{} write sector {} to {} failed: {}",
                    self,
                    first,
                    self.disks[d],
                    e
                ),
            }
        }
        Ok(acks)
    }

    /// Writes to every replica and requires a majority to acknowledge.
    async fn write_majority(
        &self,
        first: u64,
        data: &[u8],
        what: &str,
    ) -> Result<(), SectorlockError> {
        let acks = self.write_all(first, data).await?;
        if !acks.is_majority() {
            return Err(SectorlockError::io(format!(
                "{} {} write reached only {} disks, missing {:?}",
                self,
                what,
                acks,
                acks.missing().collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// Reads the leader and `num_hosts` dblocks from every replica
    /// concurrently. Unreadable replicas come back as `None`.
    async fn read_views(&self, num_hosts: u64) -> Vec<Option<AreaView>> {
        let sector_size = self.geometry.sector_bytes();
        let results: Vec<Result<Bytes, SectorlockError>> =
            join_all(self.disks.iter().map(|disk| {
                read_sectors(
                    self.io.as_ref(),
                    disk,
                    sector_size,
                    0,
                    2 + num_hosts,
                    self.io_dur(),
                )
            }))
            .await;

        let ss = sector_size as usize;
        results
            .into_iter()
            .enumerate()
            .map(|(d, res)| match res {
                Ok(buf) => Some(AreaView {
                    leader: LeaderRecord::decode(&buf[..ss], LeaseKind::Paxos),
                    dblocks: buf[2 * ss..]
                        .chunks_exact(ss)
                        .map(PaxosDblock::decode)
                        .collect(),
                }),
                Err(e) => {
                    pf_warn!(
                        "{} read of {} failed: {}",
                        self,
                        self.disks[d],
                        e
                    );
                    None
                }
            })
            .collect()
    }

    /// Picks the leader a majority of replicas agree on.
    fn agreed_leader(
        &self,
        views: &[Option<AreaView>],
    ) -> Result<LeaderRecord, SectorlockError> {
        let leaders: Vec<Option<&LeaderRecord>> = views
            .iter()
            .map(|view| view.as_ref().and_then(|v| v.leader.as_ref().ok()))
            .collect();

        for candidate in leaders.iter().flatten() {
            let mut agree = DiskSet::empty(self.disks.len());
            for (d, leader) in leaders.iter().enumerate() {
                if let Some(leader) = leader {
                    if leader.same_lease(candidate)
                        && leader.timestamp == candidate.timestamp
                    {
                        agree.insert(d)?;
                    }
                }
            }
            if agree.is_majority() {
                return self.check_leader((*candidate).clone());
            }
        }

        let readable = leaders.iter().flatten().count();
        if readable == 0 {
            // surface the decode error itself when every replica answered
            if let Some(Err(e)) =
                views.iter().flatten().map(|v| &v.leader).next()
            {
                return Err(e.clone());
            }
        }
        if readable * 2 <= self.disks.len() {
            return Err(SectorlockError::io(format!(
                "{} leader readable on only {} of {} disks",
                self,
                readable,
                self.disks.len()
            )));
        }
        Err(SectorlockError::corrupt(format!(
            "{} leaders disagree across disks",
            self
        )))
    }

    fn check_leader(
        &self,
        leader: LeaderRecord,
    ) -> Result<LeaderRecord, SectorlockError> {
        if leader.space_name != self.space_name
            || leader.resource_name != self.resource_name
        {
            return Err(SectorlockError::format(format!(
                "leader names '{}:{}' instead of {}",
                leader.space_name, leader.resource_name, self
            )));
        }
        if leader.num_hosts == 0 || leader.num_hosts > self.geometry.max_hosts()
        {
            return Err(SectorlockError::format(format!(
                "{} leader has num_hosts {}",
                self, leader.num_hosts
            )));
        }
        Ok(leader)
    }

    /// Reads the leader agreed on by a majority of replicas.
    pub async fn read_leader(&self) -> Result<LeaderRecord, SectorlockError> {
        let views = self.read_views(0).await;
        self.agreed_leader(&views)
    }

    /// Whether host `owner_id` has flagged its dblock as released on any
    /// readable replica.
    fn owner_released(views: &[Option<AreaView>], owner_id: u64) -> bool {
        if owner_id == 0 {
            return false;
        }
        views.iter().flatten().any(|view| {
            matches!(
                view.dblocks.get(owner_id as usize - 1),
                Some(Ok(bk)) if bk.is_released()
            )
        })
    }

    /// Currently committed owners: empty if the resource is free or its
    /// owner already flagged its release.
    pub async fn read_owners(
        &self,
    ) -> Result<Vec<OwnerRecord>, SectorlockError> {
        let first = self.read_leader().await?;
        if first.is_free() {
            return Ok(vec![]);
        }
        let views = self.read_views(first.num_hosts).await;
        let leader = self.agreed_leader(&views)?;
        if leader.is_free() || Self::owner_released(&views, leader.owner_id) {
            return Ok(vec![]);
        }
        Ok(vec![OwnerRecord {
            host_id: leader.owner_id,
            generation: leader.owner_generation,
            flags: leader.flags & LFL_SHORT_HOLD,
            io_timeout: leader.io_timeout,
            timestamp: leader.timestamp,
        }])
    }

    /// Reads leader and dblocks, returning the agreed leader, the largest
    /// `mbal` seen, and whether the leader's owner flagged its release.
    async fn read_state(
        &self,
    ) -> Result<(LeaderRecord, u64, bool), SectorlockError> {
        let views = self.read_views(self.geometry.max_hosts()).await;
        let leader = self.agreed_leader(&views)?;
        let max_mbal = views
            .iter()
            .flatten()
            .flat_map(|view| view.dblocks.iter())
            .filter_map(|bk| bk.as_ref().ok())
            .map(|bk| bk.mbal)
            .max()
            .unwrap_or(0);
        let released = Self::owner_released(&views, leader.owner_id);
        Ok((leader, max_mbal, released))
    }

    /// Waits until the current owner, if any, lets us contend. Returns the
    /// leader to build on and the largest `mbal` seen on disk.
    async fn await_contention(
        &self,
        me: Proposer,
        owners: &dyn OwnerStatus,
        opts: &AcquireOpts,
    ) -> Result<(LeaderRecord, u64), SectorlockError> {
        let mut polls = 0;
        loop {
            let (cur, max_mbal, released) = self.read_state().await?;
            if me.host_id > cur.num_hosts {
                return Err(SectorlockError::invalid(format!(
                    "host id {} beyond {} num_hosts {}",
                    me.host_id, self, cur.num_hosts
                )));
            }

            let status = if cur.is_free() || cur.owner_id == me.host_id {
                None
            } else {
                owners.host_status(cur.owner_id).await?
            };
            match judge_owner(&cur, (me.host_id, me.generation), status.as_ref())
            {
                OwnerVerdict::Run => return Ok((cur, max_mbal)),

                OwnerVerdict::Live => {
                    if cur.write_id != cur.owner_id && released {
                        pf_warn!(
                            "{} owner {} released, writer was {}",
                            self,
                            cur.owner_id,
                            cur.write_id
                        );
                        return Ok((cur, max_mbal));
                    }
                    return Err(SectorlockError::conflict(format!(
                        "{} held by live host {} gen {}",
                        self, cur.owner_id, cur.owner_generation
                    )));
                }

                OwnerVerdict::Wait => {
                    if opts.nowait {
                        return Err(SectorlockError::busy(format!(
                            "{} owner {} status unknown",
                            self, cur.owner_id
                        )));
                    }
                    polls += 1;
                    if polls > opts.max_owner_polls {
                        return Err(SectorlockError::busy(format!(
                            "{} owner {} undecided after {} checks",
                            self, cur.owner_id, opts.max_owner_polls
                        )));
                    }
                    pf_debug!(
                        "{} owner {} gen {} undecided, waiting",
                        self,
                        cur.owner_id,
                        cur.owner_generation
                    );
                    time::sleep(opts.owner_poll).await;
                }
            }
        }
    }

    /// Runs one phase of `ballot`: publish our dblock, then inspect every
    /// host's dblock on every replica. Returns the abort reason, if any.
    async fn ballot_phase(
        &self,
        ballot: &mut Ballot,
        me: Proposer,
        num_hosts: u64,
    ) -> Result<Option<BallotAbort>, SectorlockError> {
        let mut dblock = ballot.dblock();
        let buf = dblock.encode_sector(self.geometry.sector_bytes());
        self.write_majority(1 + me.host_id, &buf, "dblock").await?;

        let views = self.read_views(num_hosts).await;
        let mut reads = DiskSet::empty(self.disks.len());
        for (d, view) in views.iter().enumerate() {
            let Some(view) = view else {
                continue;
            };
            reads.insert(d)?;
            for (q, bk) in view.dblocks.iter().enumerate() {
                match bk {
                    Ok(bk) => {
                        if let Err(abort) = ballot.examine(q as u64, bk) {
                            return Ok(Some(abort));
                        }
                    }
                    Err(e) => pf_trace!(
                        "{} skipping bk[{}] on disk {}: {}",
                        self,
                        q,
                        d,
                        e
                    ),
                }
            }
        }
        if !reads.is_majority() {
            return Err(SectorlockError::io(format!(
                "{} dblocks readable on only {} disks",
                self,
                reads
            )));
        }
        Ok(None)
    }

    /// Runs both phases. On success returns the dblock chosen in phase 2.
    async fn run_ballot(
        &self,
        ballot: &mut Ballot,
        me: Proposer,
        num_hosts: u64,
    ) -> Result<Result<PaxosDblock, BallotAbort>, SectorlockError> {
        if let Some(abort) = self.ballot_phase(ballot, me, num_hosts).await? {
            return Ok(Err(abort));
        }
        let chosen = ballot.choose((me.host_id, me.generation, now_secs()));
        if let Some(abort) = self.ballot_phase(ballot, me, num_hosts).await? {
            return Ok(Err(abort));
        }
        Ok(Ok(chosen))
    }

    /// Acquires the lease for `me`, bumping its version by one. Fails with
    /// `Conflict` if a live host holds it or wins the round, and with `Busy`
    /// if the owner's status stays undecided.
    pub async fn acquire(
        &self,
        me: Proposer,
        owners: &dyn OwnerStatus,
        opts: &AcquireOpts,
    ) -> Result<PaxosGrant, SectorlockError> {
        'restart: loop {
            let (cur, max_mbal) =
                self.await_contention(me, owners, opts).await?;
            let next_lver = cur.lver + 1;
            let max_hosts = cur.max_hosts.max(1);
            let mut ballot = Ballot::new(
                next_lver,
                initial_mbal(max_mbal, max_hosts, me.host_id),
            );

            loop {
                let now_leader = self.read_leader().await?;
                if now_leader.lver == next_lver {
                    if now_leader.owner_id == me.host_id
                        && now_leader.owner_generation == me.generation
                    {
                        pf_debug!(
                            "{} committed for us by host {}",
                            self,
                            now_leader.write_id
                        );
                        return Ok(PaxosGrant {
                            leader: now_leader,
                            dblock: ballot.dblock(),
                        });
                    }
                    return Err(SectorlockError::conflict(format!(
                        "{} lver {} taken by host {} gen {}",
                        self,
                        next_lver,
                        now_leader.owner_id,
                        now_leader.owner_generation
                    )));
                }
                if now_leader.lver > next_lver
                    || !now_leader.same_lease(&cur)
                    || now_leader.timestamp != cur.timestamp
                {
                    pf_debug!("{} leader changed, restarting", self);
                    continue 'restart;
                }

                match self.run_ballot(&mut ballot, me, cur.num_hosts).await? {
                    Ok(chosen) => {
                        let mut new_leader = committed_leader(
                            &cur,
                            &chosen,
                            (me.host_id, me.generation),
                            now_secs(),
                        );
                        let buf = new_leader
                            .encode_sector(self.geometry.sector_bytes());
                        self.write_majority(0, &buf, "leader").await?;

                        if new_leader.owner_id != me.host_id
                            || new_leader.owner_generation != me.generation
                        {
                            return Err(SectorlockError::conflict(format!(
                                "{} lver {} committed to host {} gen {}",
                                self,
                                new_leader.lver,
                                new_leader.owner_id,
                                new_leader.owner_generation
                            )));
                        }
                        pf_info!(
                            "{} acquired lver {} gen {}",
                            self,
                            new_leader.lver,
                            me.generation
                        );
                        return Ok(PaxosGrant {
                            leader: new_leader,
                            dblock: chosen,
                        });
                    }

                    Err(abort) => {
                        let delay_us = rand::thread_rng()
                            .gen_range(0..=opts.retry_max_us);
                        pf_debug!(
                            "{} ballot {} aborted: {}, retry in {}us",
                            self,
                            ballot.dblock().mbal,
                            abort,
                            delay_us
                        );
                        time::sleep(Duration::from_micros(delay_us)).await;
                        ballot.retry(max_hosts, me.host_id, abort.seen_mbal());
                    }
                }
            }
        }
    }

    /// Releases a lease acquired through `grant`. Our dblock is flagged
    /// released first; the leader itself is freed only if we wrote it and
    /// it still describes our grant. The version is preserved.
    pub async fn release(
        &self,
        me: Proposer,
        grant: &PaxosGrant,
    ) -> Result<LeaderRecord, SectorlockError> {
        let mut dblock = grant.dblock;
        dblock.flags |= DBLOCK_FL_RELEASED;
        let buf = dblock.encode_sector(self.geometry.sector_bytes());
        if let Err(e) =
            self.write_majority(1 + me.host_id, &buf, "dblock").await
        {
            pf_warn!("{} release dblock: {}", self, e);
        }

        let leader = self.read_leader().await?;
        if leader.write_id != me.host_id {
            pf_warn!(
                "{} release skips leader written by host {}",
                self,
                leader.write_id
            );
            return Ok(leader);
        }
        let last = &grant.leader;
        if leader.lver != last.lver {
            return Err(SectorlockError::conflict(format!(
                "{} release at lver {} but disk has {}",
                self, last.lver, leader.lver
            )));
        }
        if leader.is_free() {
            pf_warn!("{} already free at lver {}", self, leader.lver);
            return Ok(leader);
        }
        if leader.owner_id != me.host_id
            || leader.owner_generation != me.generation
        {
            return Err(SectorlockError::conflict(format!(
                "{} owned by host {} gen {}, not us",
                self, leader.owner_id, leader.owner_generation
            )));
        }

        let now = now_secs();
        let mut new_leader = leader;
        new_leader.timestamp = LEASE_FREE;
        new_leader.write_id = me.host_id;
        new_leader.write_generation = me.generation;
        new_leader.write_timestamp = now;
        new_leader.flags &= !LFL_SHORT_HOLD;
        let buf = new_leader.encode_sector(self.geometry.sector_bytes());
        self.write_majority(0, &buf, "leader").await?;
        pf_info!("{} released at lver {}", self, new_leader.lver);
        Ok(new_leader)
    }
}
