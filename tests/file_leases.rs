//! End-to-end lease scenarios against file-backed disks.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use sectorlock::{
    DiskLocation, ErrorKind, FileIo, HostFlag, LeaseDaemon, LockspaceStatus,
    SectorlockError,
};

use tempfile::NamedTempFile;

use tokio::time::{self, Duration};

const MIB: u64 = 1 << 20;

fn backing_file(len: u64) -> Result<NamedTempFile, SectorlockError> {
    let file = NamedTempFile::new()?;
    file.as_file().set_len(len)?;
    Ok(file)
}

fn read_bytes(
    path: &Path,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, SectorlockError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

async fn daemon(name: &str) -> Result<LeaseDaemon, SectorlockError> {
    let config = format!(
        "host_name = '{}'\nsession_timeout_ms = 2000\nsession_check_ms = 100",
        name
    );
    LeaseDaemon::new_and_setup(Arc::new(FileIo), Some(&config)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lockspace_and_resource_round_trip() -> Result<(), SectorlockError> {
    let file = backing_file(16 * MIB)?;
    let d = daemon("rt").await?;

    for (i, (align, sector)) in [
        (MIB, 512),
        (MIB, 4096),
        (2 * MIB, 4096),
        (4 * MIB, 4096),
        (8 * MIB, 4096),
    ]
    .into_iter()
    .enumerate()
    {
        let disk = DiskLocation::new(file.path(), 0);
        let name = format!("ls{}", i);
        d.write_lockspace(&name, &disk, i as u64 + 1, Some(align), Some(sector))
            .await?;
        let info = d.read_lockspace(&disk, Some(align), Some(sector)).await?;
        assert_eq!(info.space_name, name);
        assert_eq!(info.io_timeout, i as u16 + 1);

        d.write_resource(&name, "res", &[disk.clone()], Some(align), Some(sector))
            .await?;
        let info = d.read_resource(&disk, Some(align), Some(sector)).await?;
        assert_eq!(info.space_name, name);
        assert_eq!(info.resource_name, "res");
        assert_eq!(info.version, 0);
    }
    d.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_offset_leaves_guards() -> Result<(), SectorlockError> {
    let len = 8 * 1024 * MIB;
    let file = backing_file(len)?;
    let d = daemon("big").await?;
    let offset = len - 4 * MIB;
    let disk = DiskLocation::new(file.path(), offset);

    d.write_lockspace("big", &disk, 1, None, None).await?;
    let info = d.read_lockspace(&disk, None, None).await?;
    assert_eq!(info.space_name, "big");

    let magic = read_bytes(file.path(), offset, 4)?;
    assert_eq!(magic, 0x12212010u32.to_le_bytes());
    assert!(read_bytes(file.path(), offset - 4096, 4096)?
        .iter()
        .all(|&b| b == 0));
    assert!(read_bytes(file.path(), offset + MIB, 4096)?
        .iter()
        .all(|&b| b == 0));

    let res = DiskLocation::new(file.path(), offset + 2 * MIB);
    d.write_resource("big", "res", &[res.clone()], None, None).await?;
    assert_eq!(read_bytes(file.path(), res.offset, 4)?, 0x06152010u32.to_le_bytes());
    assert!(read_bytes(file.path(), res.offset + MIB, 4096)?
        .iter()
        .all(|&b| b == 0));
    assert_eq!(d.read_resource(&res, None, None).await?.version, 0);
    d.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_geometry_rejected() -> Result<(), SectorlockError> {
    let file = backing_file(16 * MIB)?;
    let d = daemon("geo").await?;
    let disk = DiskLocation::new(file.path(), 0);

    for (align, sector) in [
        (0, 512),
        (MIB, 0),
        (MIB, 1024),
        (2 * MIB, 512),
        (4 * MIB, 512),
        (8 * MIB, 512),
        (3 * MIB, 4096),
        (16 * MIB, 4096),
    ] {
        let e = d
            .write_lockspace("ls", &disk, 1, Some(align), Some(sector))
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = d
            .write_resource("ls", "res", &[disk.clone()], Some(align), Some(sector))
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }
    assert!(read_bytes(file.path(), 0, 4096)?.iter().all(|&b| b == 0));
    d.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inquiry_on_unjoined_lockspace() -> Result<(), SectorlockError> {
    let file = backing_file(4 * MIB)?;
    let d = daemon("inq").await?;
    let disk = DiskLocation::new(file.path(), 0);
    d.write_lockspace("ls", &disk, 1, None, None).await?;
    for wait in [false, true, false] {
        assert_eq!(
            d.inq_lockspace("ls", 1, &disk, wait).await?,
            LockspaceStatus::NotHeld
        );
    }
    d.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_add_and_rem() -> Result<(), SectorlockError> {
    let file = backing_file(4 * MIB)?;
    let d = daemon("async").await?;
    let disk = DiskLocation::new(file.path(), 0);
    d.write_lockspace("ls", &disk, 1, None, None).await?;

    d.add_lockspace("ls", 1, &disk, 1, true).await?;
    assert_eq!(
        d.inq_lockspace("ls", 1, &disk, false).await?,
        LockspaceStatus::InProgress
    );
    assert_eq!(
        d.inq_lockspace("ls", 1, &disk, true).await?,
        LockspaceStatus::Held
    );

    d.rem_lockspace("ls", 1, &disk, true).await?;
    assert_eq!(
        d.inq_lockspace("ls", 1, &disk, true).await?,
        LockspaceStatus::NotHeld
    );
    d.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hosts_then_exclusive_ownership() -> Result<(), SectorlockError> {
    let file = backing_file(8 * MIB)?;
    let d = daemon("owner").await?;
    let ls = DiskLocation::new(file.path(), 0);
    let disks = vec![DiskLocation::new(file.path(), MIB)];
    d.write_lockspace("ls", &ls, 1, None, None).await?;
    d.write_resource("ls", "res", &disks, None, None).await?;

    d.add_lockspace("ls", 1, &ls, 1, false).await?;
    assert_eq!(
        d.get_hosts("ls", 1).unwrap_err().kind(),
        ErrorKind::NotYetAvailable
    );
    time::sleep(Duration::from_millis(1000)).await;
    let hosts = d.get_hosts("ls", 1)?;
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].flags, HostFlag::Live);
    let generation = hosts[0].generation;

    let session = d.register()?;
    assert!(d.read_resource_owners("ls", "res", &disks).await?.is_empty());
    let before = d.read_resource(&disks[0], None, None).await?.version;
    d.acquire(&session, "ls", "res", &disks, false).await?;

    let owners = d.read_resource_owners("ls", "res", &disks).await?;
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].host_id, 1);
    assert_eq!(owners[0].generation, generation);
    assert_eq!(owners[0].flags, 0);
    let acquired = d.read_resource(&disks[0], None, None).await?.version;
    assert_eq!(acquired, before + 1);

    d.release(&session, "ls", "res", &disks).await?;
    assert!(d.read_resource_owners("ls", "res", &disks).await?.is_empty());
    assert_eq!(d.read_resource(&disks[0], None, None).await?.version, acquired);

    d.unregister(session).await?;
    d.rem_lockspace("ls", 1, &ls, false).await?;
    d.shutdown().await
}
