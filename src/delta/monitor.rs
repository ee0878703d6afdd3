//! Host liveness tracking for one joined lockspace.
//!
//! The renewal task feeds every full read of the lockspace area into a
//! `HostMonitor`, which classifies each slot and publishes the result to a
//! `flashmap` table. Readers hold a cheap `HostTable` handle and never block
//! the renewal task.

use std::collections::HashMap;

use crate::delta::host_dead_secs;
use crate::ondisk::LeaderRecord;
use crate::utils::SectorlockError;

use tokio::time::{Duration, Instant};

/// Liveness status of a host slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HostFlag {
    /// Seen only once so far, or stale but not yet presumed dead.
    Unknown,
    /// Timestamp advanced within its io_timeout.
    Live,
    /// Our own host after a failed renewal.
    Fail,
    /// Timestamp unchanged for at least `host_dead_secs` of its io_timeout.
    Dead,
    /// Slot released (timestamp zero).
    Free,
}

/// Externally visible host record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HostRecord {
    pub host_id: u64,
    pub generation: u64,
    pub flags: HostFlag,
    pub timestamp: u64,
    pub io_timeout: u16,
}

/// Per-slot observation history, private to the monitor.
#[derive(Debug, Clone, Copy)]
struct Observation {
    timestamp: u64,
    generation: u64,
    last_change: Instant,
    flag: HostFlag,
}

/// Read side of a lockspace's host status table.
#[derive(Clone)]
pub struct HostTable(flashmap::ReadHandle<u64, HostRecord>);

impl HostTable {
    /// Status of one host, if its slot was ever used.
    pub fn get(&self, host_id: u64) -> Option<HostRecord> {
        self.0.guard().get(&host_id).cloned()
    }

    /// All known hosts, ordered by host id.
    pub fn all(&self) -> Vec<HostRecord> {
        let mut hosts: Vec<HostRecord> =
            self.0.guard().values().cloned().collect();
        hosts.sort_by_key(|h| h.host_id);
        hosts
    }
}

/// Write side: owned by the renewal task.
pub struct HostMonitor {
    me: u64,
    /// io_timeout assumed for slots that do not record their own.
    default_io_timeout: u16,
    observations: HashMap<u64, Observation>,
    table: flashmap::WriteHandle<u64, HostRecord>,
}

impl HostMonitor {
    /// Creates an empty monitor and the read handle to its table.
    pub fn new(me: u64, default_io_timeout: u16) -> (Self, HostTable) {
        let (table_write, table_read) = flashmap::new::<u64, HostRecord>();
        (
            HostMonitor {
                me,
                default_io_timeout,
                observations: HashMap::new(),
                table: table_write,
            },
            HostTable(table_read),
        )
    }

    /// Classifies another host's slot given its previous observation. A slot
    /// unchanged for one io_timeout turns from LIVE to UNKNOWN, and only
    /// after `host_dead_secs(io_timeout)` to DEAD.
    fn classify(
        prev: Option<&Observation>,
        leader: &LeaderRecord,
        io_timeout: u16,
        now: Instant,
    ) -> Observation {
        if leader.timestamp == 0 {
            return Observation {
                timestamp: 0,
                generation: leader.owner_generation,
                last_change: now,
                flag: HostFlag::Free,
            };
        }

        match prev {
            None => Observation {
                timestamp: leader.timestamp,
                generation: leader.owner_generation,
                last_change: now,
                flag: HostFlag::Unknown,
            },
            Some(prev)
                if prev.timestamp != leader.timestamp
                    || prev.generation != leader.owner_generation =>
            {
                let flag = if prev.flag == HostFlag::Free
                    || prev.generation != leader.owner_generation
                {
                    // a new incarnation gets the same benefit of the doubt
                    // as a first sighting
                    HostFlag::Unknown
                } else {
                    HostFlag::Live
                };
                Observation {
                    timestamp: leader.timestamp,
                    generation: leader.owner_generation,
                    last_change: now,
                    flag,
                }
            }
            Some(prev) => {
                let stale = now.duration_since(prev.last_change);
                let flag = if stale
                    >= Duration::from_secs(host_dead_secs(io_timeout))
                {
                    HostFlag::Dead
                } else if stale >= Duration::from_secs(io_timeout as u64)
                    && prev.flag == HostFlag::Live
                {
                    HostFlag::Unknown
                } else {
                    prev.flag
                };
                Observation { flag, ..*prev }
            }
        }
    }

    /// Folds one full read of the lockspace area into the table. `slots[i]`
    /// is host `i + 1`; undecodable slots keep their previous status. Our own
    /// slot is reported from `own` (the record we last wrote) as LIVE.
    pub fn observe(
        &mut self,
        slots: &[Result<LeaderRecord, SectorlockError>],
        own: &LeaderRecord,
        now: Instant,
    ) {
        let mut guard = self.table.guard();

        for (idx, slot) in slots.iter().enumerate() {
            let host_id = idx as u64 + 1;
            if host_id == self.me {
                continue;
            }
            let leader = match slot {
                Ok(leader) => leader,
                Err(e) => {
                    pf_trace!("slot {} unreadable: {}", host_id, e);
                    continue;
                }
            };
            if leader.owner_generation == 0 {
                // never claimed
                continue;
            }

            let io_timeout = if leader.io_timeout > 0 {
                leader.io_timeout
            } else {
                self.default_io_timeout
            };
            let obs = Self::classify(
                self.observations.get(&host_id),
                leader,
                io_timeout,
                now,
            );
            if self.observations.get(&host_id).map(|o| o.flag) != Some(obs.flag)
            {
                pf_debug!(
                    "host {} gen {} now {:?}",
                    host_id,
                    obs.generation,
                    obs.flag
                );
            }
            self.observations.insert(host_id, obs);
            guard.insert(
                host_id,
                HostRecord {
                    host_id,
                    generation: leader.owner_generation,
                    flags: obs.flag,
                    timestamp: leader.timestamp,
                    io_timeout: leader.io_timeout,
                },
            );
        }

        guard.insert(
            self.me,
            HostRecord {
                host_id: self.me,
                generation: own.owner_generation,
                flags: HostFlag::Live,
                timestamp: own.timestamp,
                io_timeout: own.io_timeout,
            },
        );
    }

    /// Marks our own host as failing; nothing else in the table changes.
    pub fn mark_self_failed(&mut self, own: &LeaderRecord) {
        self.table.guard().insert(
            self.me,
            HostRecord {
                host_id: self.me,
                generation: own.owner_generation,
                flags: HostFlag::Fail,
                timestamp: own.timestamp,
                io_timeout: own.io_timeout,
            },
        );
    }

    /// Marks our own slot as freed after a clean release.
    pub fn mark_self_free(&mut self) {
        let mut guard = self.table.guard();
        let record = guard.get(&self.me).cloned();
        if let Some(mut record) = record {
            record.flags = HostFlag::Free;
            record.timestamp = 0;
            guard.insert(self.me, record);
        }
    }
}

#[cfg(test)]
mod monitor_tests {
    use super::*;
    use crate::disk::Geometry;
    use crate::ondisk::LeaseKind;

    fn slot(host_id: u64, generation: u64, timestamp: u64) -> LeaderRecord {
        let mut leader = LeaderRecord::new_free(
            LeaseKind::Delta,
            &Geometry::DEFAULT,
            "ls",
            "h",
        );
        leader.owner_id = host_id;
        leader.owner_generation = generation;
        leader.timestamp = timestamp;
        leader.io_timeout = 1;
        leader
    }

    #[test]
    fn liveness_transitions() {
        let (mut monitor, table) = HostMonitor::new(1, 10);
        let own = slot(1, 1, 100);
        let t0 = Instant::now();

        // first sighting
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 50))], &own, t0);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Unknown));
        assert_eq!(table.get(1).map(|h| h.flags), Some(HostFlag::Live));

        // advanced
        let t1 = t0 + Duration::from_millis(500);
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 51))], &own, t1);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Live));

        // unchanged but within io_timeout
        let t2 = t1 + Duration::from_millis(500);
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 51))], &own, t2);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Live));

        // unchanged past io_timeout, not yet presumed dead
        let t3 = t1 + Duration::from_millis(1100);
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 51))], &own, t3);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Unknown));

        // unchanged for host_dead_secs
        let t3 = t1 + Duration::from_secs(host_dead_secs(1));
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 51))], &own, t3);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Dead));

        // released
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 1, 0))], &own, t3);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Free));

        // rejoined under a new generation
        monitor.observe(&[Ok(own.clone()), Ok(slot(2, 2, 80))], &own, t3);
        let rec = table.get(2);
        assert_eq!(rec.as_ref().map(|h| h.flags), Some(HostFlag::Unknown));
        assert_eq!(rec.map(|h| h.generation), Some(2));
    }

    #[test]
    fn unused_slots_and_self_fail() {
        let (mut monitor, table) = HostMonitor::new(2, 10);
        let own = slot(2, 4, 100);
        monitor.observe(
            &[Ok(slot(1, 0, 0)), Ok(own.clone()), Ok(slot(3, 0, 0))],
            &own,
            Instant::now(),
        );
        assert_eq!(table.all().len(), 1);
        assert!(table.get(1).is_none());
        assert_eq!(table.get(2).map(|h| h.generation), Some(4));

        monitor.mark_self_failed(&own);
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Fail));
        monitor.mark_self_free();
        assert_eq!(table.get(2).map(|h| h.flags), Some(HostFlag::Free));
    }
}
