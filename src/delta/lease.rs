//! Delta lease on one host slot of a lockspace area. A host proves it is
//! alive by rewriting its own slot with an advancing timestamp; nobody else
//! ever writes that slot while it is held.

use std::sync::Arc;

use crate::disk::{
    check_host_id, read_sectors, write_sectors, DiskLocation, Geometry,
    SectorIo, SectorSize,
};
use crate::ondisk::{LeaderRecord, LeaseKind, LEASE_FREE};
use crate::utils::{now_secs, SectorlockError};

use bytes::BytesMut;

use tokio::time::{self, Duration};

/// io_timeout in seconds used when none is given.
pub const DEFAULT_IO_TIMEOUT: u16 = 10;

/// Seconds a slot's timestamp must stay unchanged before its holder is
/// presumed gone and the slot may be taken over.
pub fn host_dead_secs(io_timeout: u16) -> u64 {
    8 * io_timeout as u64
}

/// Writes a fresh lockspace area: one free leader per host slot, written in
/// a single I/O spanning the whole alignment unit.
pub async fn init_lockspace(
    io: &dyn SectorIo,
    disk: &DiskLocation,
    geometry: &Geometry,
    space_name: &str,
    io_timeout: u16,
) -> Result<(), SectorlockError> {
    let sector_size = geometry.sector_bytes() as usize;
    let mut area = BytesMut::zeroed(geometry.align_bytes() as usize);

    for i in 0..geometry.max_hosts() as usize {
        let mut leader =
            LeaderRecord::new_free(LeaseKind::Delta, geometry, space_name, "");
        leader.owner_id = i as u64 + 1;
        leader.io_timeout = io_timeout;
        let start = i * sector_size;
        area[start..start + sector_size]
            .copy_from_slice(&leader.encode_sector(geometry.sector_bytes()));
    }

    write_sectors(
        io,
        disk,
        geometry.sector_bytes(),
        0,
        &area,
        Duration::from_secs(io_timeout as u64),
    )
    .await?;
    pf_debug!(
        "initialized lockspace '{}' at {} ({})",
        space_name,
        disk,
        geometry
    );
    Ok(())
}

/// Reads and verifies the first host slot of a lockspace area without
/// knowing its geometry in advance. A 4K read covers the first sector at
/// either sector size.
pub async fn read_first_leader(
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
    LeaderRecord::decode(&buf, LeaseKind::Delta)
}

/// Reads every host slot of a lockspace area in one I/O. Slots that fail
/// to decode are returned as errors in place.
pub async fn read_all_slots(
    io: &dyn SectorIo,
    disk: &DiskLocation,
    geometry: &Geometry,
    io_timeout: u16,
) -> Result<Vec<Result<LeaderRecord, SectorlockError>>, SectorlockError> {
    let sector_size = geometry.sector_bytes() as usize;
    let buf = read_sectors(
        io,
        disk,
        geometry.sector_bytes(),
        0,
        geometry.max_hosts(),
        Duration::from_secs(io_timeout as u64),
    )
    .await?;
    Ok(buf
        .chunks_exact(sector_size)
        .map(|sector| LeaderRecord::decode(sector, LeaseKind::Delta))
        .collect())
}

/// One host's slot in a joined lockspace.
#[derive(Debug, Clone)]
pub struct DeltaSlot {
    io: Arc<dyn SectorIo>,
    pub disk: DiskLocation,
    pub geometry: Geometry,
    pub space_name: String,
    pub host_id: u64,
    pub io_timeout: u16,
}

impl DeltaSlot {
    /// Locates the slot of `host_id` in the lockspace at `disk`, learning the
    /// geometry from the area's first leader.
    pub async fn open(
        io: Arc<dyn SectorIo>,
        disk: DiskLocation,
        space_name: &str,
        host_id: u64,
        io_timeout: u16,
    ) -> Result<Self, SectorlockError> {
        let first = read_first_leader(io.as_ref(), &disk, io_timeout).await?;
        if first.space_name != space_name {
            return Err(SectorlockError::format(format!(
                "lockspace at {} is '{}' not '{}'",
                disk, first.space_name, space_name
            )));
        }
        let geometry = first.geometry()?;
        check_host_id(host_id, &geometry)?;
        disk.check_offset(geometry.sector_bytes())?;

        Ok(DeltaSlot {
            io,
            disk,
            geometry,
            space_name: space_name.into(),
            host_id,
            io_timeout,
        })
    }

    #[inline]
    fn io_dur(&self) -> Duration {
        Duration::from_secs(self.io_timeout as u64)
    }

    /// Reads and verifies any host's slot in this lockspace.
    pub async fn read_host(
        &self,
        host_id: u64,
    ) -> Result<LeaderRecord, SectorlockError> {
        check_host_id(host_id, &self.geometry)?;
        let buf = read_sectors(
            self.io.as_ref(),
            &self.disk,
            self.geometry.sector_bytes(),
            host_id - 1,
            1,
            self.io_dur(),
        )
        .await?;
        let leader = LeaderRecord::decode(&buf, LeaseKind::Delta)?;
        if leader.space_name != self.space_name {
            return Err(SectorlockError::format(format!(
                "slot {} names lockspace '{}' not '{}'",
                host_id, leader.space_name, self.space_name
            )));
        }
        Ok(leader)
    }

    /// Reads and verifies our own slot.
    pub async fn read_leader(&self) -> Result<LeaderRecord, SectorlockError> {
        self.read_host(self.host_id).await
    }

    /// Reads all slots of this lockspace.
    pub async fn read_all(
        &self,
    ) -> Result<Vec<Result<LeaderRecord, SectorlockError>>, SectorlockError>
    {
        read_all_slots(
            self.io.as_ref(),
            &self.disk,
            &self.geometry,
            self.io_timeout,
        )
        .await
    }

    async fn write_leader(
        &self,
        leader: &mut LeaderRecord,
    ) -> Result<(), SectorlockError> {
        let buf = leader.encode_sector(self.geometry.sector_bytes());
        write_sectors(
            self.io.as_ref(),
            &self.disk,
            self.geometry.sector_bytes(),
            self.host_id - 1,
            &buf,
            self.io_dur(),
        )
        .await
    }

    /// Claims the slot under a fresh generation. If another host name holds
    /// it, waits out that holder's dead interval first. After writing, waits
    /// `2 × io_timeout` and re-reads to make sure nobody raced us.
    pub async fn acquire(
        &self,
        host_name: &str,
    ) -> Result<LeaderRecord, SectorlockError> {
        let mut leader = self.read_leader().await?;

        if leader.timestamp != LEASE_FREE && leader.resource_name != host_name
        {
            let their_timeout = if leader.io_timeout > 0 {
                leader.io_timeout
            } else {
                self.io_timeout
            };
            let wait = host_dead_secs(their_timeout);
            pf_info!(
                "slot {} of '{}' held by '{}' gen {}, waiting {}s",
                self.host_id,
                self.space_name,
                leader.resource_name,
                leader.owner_generation,
                wait
            );
            time::sleep(Duration::from_secs(wait)).await;

            let again = self.read_leader().await?;
            if again != leader {
                return Err(SectorlockError::busy(format!(
                    "slot {} of '{}' is still being renewed by '{}'",
                    self.host_id, self.space_name, again.resource_name
                )));
            }
            leader = again;
        }

        let now = now_secs();
        let mut new_leader = leader;
        new_leader.owner_id = self.host_id;
        new_leader.owner_generation += 1;
        new_leader.timestamp = now;
        new_leader.io_timeout = self.io_timeout;
        new_leader.resource_name = host_name.into();
        new_leader.write_id = self.host_id;
        new_leader.write_generation = new_leader.owner_generation;
        new_leader.write_timestamp = now;
        self.write_leader(&mut new_leader).await?;

        pf_debug!(
            "slot {} of '{}' written gen {}, settling",
            self.host_id,
            self.space_name,
            new_leader.owner_generation
        );
        time::sleep(2 * self.io_dur()).await;

        let check = self.read_leader().await?;
        if check != new_leader {
            return Err(SectorlockError::conflict(format!(
                "slot {} of '{}' overwritten by '{}' gen {}",
                self.host_id,
                self.space_name,
                check.resource_name,
                check.owner_generation
            )));
        }
        Ok(new_leader)
    }

    /// Rewrites the slot with a strictly advancing timestamp, provided it is
    /// still exactly what we last wrote.
    pub async fn renew(
        &self,
        last: &LeaderRecord,
    ) -> Result<LeaderRecord, SectorlockError> {
        let cur = self.read_leader().await?;
        if !cur.same_lease(last) || cur.timestamp != last.timestamp {
            return Err(SectorlockError::conflict(format!(
                "slot {} of '{}' changed since last renewal: {}",
                self.host_id, self.space_name, cur
            )));
        }

        let now = now_secs().max(last.timestamp + 1);
        let mut new_leader = cur;
        new_leader.timestamp = now;
        new_leader.write_timestamp = now;
        self.write_leader(&mut new_leader).await?;
        Ok(new_leader)
    }

    /// Frees the slot, keeping the generation for the next incarnation.
    pub async fn release(
        &self,
        last: &LeaderRecord,
    ) -> Result<LeaderRecord, SectorlockError> {
        let mut new_leader = last.clone();
        new_leader.timestamp = LEASE_FREE;
        new_leader.write_timestamp = now_secs();
        self.write_leader(&mut new_leader).await?;
        Ok(new_leader)
    }
}

#[cfg(test)]
mod lease_tests {
    use super::*;
    use crate::disk::{Fault, MemDisk};
    use crate::utils::ErrorKind;

    async fn setup(
        mem: &MemDisk,
        path: &str,
    ) -> Result<DiskLocation, SectorlockError> {
        let disk = DiskLocation::new(path, 1 << 20);
        init_lockspace(mem, &disk, &Geometry::DEFAULT, "ls_name", 1).await?;
        Ok(disk)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_then_read() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let disk = setup(&mem, "/mem/ls").await?;
        let first = read_first_leader(&mem, &disk, 1).await?;
        assert_eq!(first.space_name, "ls_name");
        assert_eq!(first.owner_id, 1);
        assert_eq!(first.io_timeout, 1);
        assert!(first.is_free());
        assert_eq!(first.geometry()?, Geometry::DEFAULT);

        let slots =
            read_all_slots(&mem, &disk, &Geometry::DEFAULT, 1).await?;
        assert_eq!(slots.len(), 2000);
        assert_eq!(slots[1999].as_ref().map(|l| l.owner_id), Ok(2000));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_renew_release() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let disk = setup(&mem, "/mem/ls").await?;
        let slot =
            DeltaSlot::open(Arc::new(mem.clone()), disk, "ls_name", 3, 1)
                .await?;

        let held = slot.acquire("host-a").await?;
        assert_eq!(held.owner_id, 3);
        assert_eq!(held.owner_generation, 1);
        assert_eq!(held.resource_name, "host-a");
        assert!(!held.is_free());

        let renewed = slot.renew(&held).await?;
        assert!(renewed.timestamp > held.timestamp);
        assert_eq!(renewed.owner_generation, 1);

        // renewing against a stale view fails
        let e = slot.renew(&held).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Conflict);

        let freed = slot.release(&renewed).await?;
        assert!(freed.is_free());
        assert_eq!(slot.read_leader().await?.owner_generation, 1);

        // next incarnation bumps generation without waiting
        let again = slot.acquire("host-a").await?;
        assert_eq!(again.owner_generation, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_checks() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let disk = setup(&mem, "/mem/ls").await?;
        let io: Arc<dyn SectorIo> = Arc::new(mem.clone());

        let e = DeltaSlot::open(io.clone(), disk.clone(), "other", 1, 1)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Format);
        let e = DeltaSlot::open(io.clone(), disk.clone(), "ls_name", 0, 1)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);

        mem.inject("/mem/ls", Fault::Error);
        let e = DeltaSlot::open(io, disk, "ls_name", 1, 1).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Io);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn renew_write_failure() -> Result<(), SectorlockError> {
        let mem = MemDisk::new();
        let disk = setup(&mem, "/mem/ls").await?;
        let slot =
            DeltaSlot::open(Arc::new(mem.clone()), disk, "ls_name", 1, 1)
                .await?;
        let held = slot.acquire("host-a").await?;
        mem.inject("/mem/ls", Fault::ReadOnly);
        assert_eq!(slot.renew(&held).await.unwrap_err().kind(), ErrorKind::Io);
        Ok(())
    }
}
