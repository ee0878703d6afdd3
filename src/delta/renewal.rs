//! Per-lockspace renewal task: keeps our delta lease alive and refreshes the
//! host status table after every renewal.

use crate::delta::{DeltaSlot, HostMonitor, HostTable};
use crate::ondisk::LeaderRecord;
use crate::utils::{Deadline, SectorlockError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Raised by a renewal task that can no longer vouch for our lease. The
/// receiver must stop using everything acquired under that lockspace.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FenceNotice {
    pub space_name: String,
    pub generation: u64,
    pub reason: String,
}

/// Handle to a running renewal task.
pub struct Renewer {
    tx_stop: watch::Sender<bool>,
    hosts: HostTable,
    handle: JoinHandle<Option<LeaderRecord>>,
}

impl Renewer {
    /// Spawns the renewal task for a freshly acquired slot. Renewals happen
    /// every `io_timeout × renewal_fraction`.
    pub fn spawn(
        slot: DeltaSlot,
        leader: LeaderRecord,
        renewal_fraction: f64,
        tx_fence: mpsc::UnboundedSender<FenceNotice>,
    ) -> Result<Self, SectorlockError> {
        if !(renewal_fraction > 0.0 && renewal_fraction < 1.0) {
            return logged_err!(
                InvalidArgument => "invalid renewal_fraction {}",
                renewal_fraction
            );
        }
        let io_timeout = Duration::from_secs(slot.io_timeout as u64);
        let interval = io_timeout.mul_f64(renewal_fraction);
        if interval.is_zero() {
            return logged_err!(
                InvalidArgument => "renewal interval rounds to zero"
            );
        }

        // fires if no renewal succeeds within io_timeout of the last one
        let deadline = Deadline::start(io_timeout)?;

        let (monitor, hosts) = HostMonitor::new(slot.host_id, slot.io_timeout);
        let (tx_stop, rx_stop) = watch::channel(false);
        let handle = tokio::spawn(Self::renewal_task(
            slot, leader, interval, deadline, monitor, tx_fence, rx_stop,
        ));

        Ok(Renewer {
            tx_stop,
            hosts,
            handle,
        })
    }

    /// Read handle to this lockspace's host status table.
    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }

    /// True once the task has exited on its own (i.e., after fencing).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the task. Returns the last leader we wrote if the lease was
    /// still healthy, or `None` if the task had already fenced itself.
    pub async fn stop(self) -> Result<Option<LeaderRecord>, SectorlockError> {
        // the task may already be gone after fencing
        let _ = self.tx_stop.send(true);
        Ok(self.handle.await?)
    }

    /// Renewal task function.
    async fn renewal_task(
        slot: DeltaSlot,
        mut leader: LeaderRecord,
        interval: Duration,
        mut deadline: Deadline,
        mut monitor: HostMonitor,
        tx_fence: mpsc::UnboundedSender<FenceNotice>,
        mut rx_stop: watch::Receiver<bool>,
    ) -> Option<LeaderRecord> {
        pf_debug!(
            "renewal task for '{}' host {} spawned, every {:?}",
            slot.space_name,
            slot.host_id,
            interval
        );
        let io_timeout = Duration::from_secs(slot.io_timeout as u64);

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let failure = loop {
            tokio::select! {
                res = rx_stop.changed() => {
                    if res.is_err() || *rx_stop.borrow() {
                        pf_debug!(
                            "renewal task for '{}' stopping",
                            slot.space_name
                        );
                        return Some(leader);
                    }
                },

                _ = deadline.reached() => {
                    break format!(
                        "no successful renewal within {:?}",
                        io_timeout
                    );
                },

                _ = ticker.tick() => {
                    match time::timeout(io_timeout, slot.renew(&leader)).await {
                        Ok(Ok(new_leader)) => {
                            if deadline.passed() {
                                break "renewal completed too late".into();
                            }
                            leader = new_leader;
                            deadline.extend();
                            pf_trace!(
                                "renewed '{}' ts {}",
                                slot.space_name,
                                leader.timestamp
                            );
                        }
                        Ok(Err(e)) => break format!("renewal failed: {}", e),
                        Err(_) => break "renewal timed out".into(),
                    }

                    match slot.read_all().await {
                        Ok(slots) => monitor.observe(&slots, &leader, Instant::now()),
                        Err(e) => pf_warn!(
                            "error reading lockspace '{}' for host status: {}",
                            slot.space_name,
                            e
                        ),
                    }
                },
            }
        };

        pf_error!(
            "fencing lockspace '{}' host {} gen {}: {}",
            slot.space_name,
            slot.host_id,
            leader.owner_generation,
            failure
        );
        monitor.mark_self_failed(&leader);
        if let Err(e) = tx_fence.send(FenceNotice {
            space_name: slot.space_name.clone(),
            generation: leader.owner_generation,
            reason: failure,
        }) {
            pf_error!("error sending fence notice: {}", e);
        }
        None
    }
}

#[cfg(test)]
mod renewal_tests {
    use super::*;
    use crate::delta::{init_lockspace, HostFlag};
    use crate::disk::{DiskLocation, Fault, Geometry, MemDisk};
    use std::sync::Arc;

    async fn joined(
        mem: &MemDisk,
    ) -> Result<(DeltaSlot, LeaderRecord), SectorlockError> {
        let disk = DiskLocation::new("/mem/ls", 0);
        init_lockspace(mem, &disk, &Geometry::DEFAULT, "ls", 1).await?;
        let slot =
            DeltaSlot::open(Arc::new(mem.clone()), disk, "ls", 1, 1).await?;
        let leader = slot.acquire("me").await?;
        Ok((slot, leader))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn renews_and_stops() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let (slot, leader) = joined(&mem).await?;
        let (tx_fence, mut rx_fence) = mpsc::unbounded_channel();
        let renewer = Renewer::spawn(slot, leader.clone(), 0.5, tx_fence)?;

        assert!(renewer.hosts().get(1).is_none());
        time::sleep(Duration::from_millis(1200)).await;
        let me = renewer.hosts().get(1);
        assert_eq!(me.as_ref().map(|h| h.flags), Some(HostFlag::Live));
        assert!(me.map(|h| h.timestamp).unwrap_or(0) > leader.timestamp);

        let last = renewer.stop().await?;
        assert!(last.is_some());
        assert!(rx_fence.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fences_on_write_failure() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let (slot, leader) = joined(&mem).await?;
        let (tx_fence, mut rx_fence) = mpsc::unbounded_channel();
        let renewer = Renewer::spawn(slot, leader.clone(), 0.5, tx_fence)?;

        mem.inject("/mem/ls", Fault::ReadOnly);
        let notice = time::timeout(Duration::from_secs(3), rx_fence.recv())
            .await?
            .ok_or_else(|| SectorlockError::msg("fence channel closed"))?;
        assert_eq!(notice.space_name, "ls");
        assert_eq!(notice.generation, leader.owner_generation);
        assert!(renewer.stop().await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fences_on_hang() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let (slot, leader) = joined(&mem).await?;
        let (tx_fence, mut rx_fence) = mpsc::unbounded_channel();
        let renewer = Renewer::spawn(slot, leader, 0.5, tx_fence)?;

        mem.inject("/mem/ls", Fault::Hang);
        let notice = time::timeout(Duration::from_secs(3), rx_fence.recv())
            .await?;
        assert!(notice.is_some());
        assert_eq!(
            renewer.hosts().get(1).map(|h| h.flags),
            Some(HostFlag::Fail)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn bad_fraction_rejected() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let (slot, leader) = joined(&mem).await?;
        let (tx_fence, _rx_fence) = mpsc::unbounded_channel();
        assert!(Renewer::spawn(slot.clone(), leader.clone(), 1.0, tx_fence.clone()).is_err());
        assert!(Renewer::spawn(slot, leader, 0.0, tx_fence).is_err());
        Ok(())
    }
}
