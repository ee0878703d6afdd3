//! Sector-granular storage I/O primitive and its file-backed implementation.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::utils::SectorlockError;

use async_trait::async_trait;

use bytes::{Bytes, BytesMut};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::{self, Duration};

/// One lease area location: a path plus a byte offset into it.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct DiskLocation {
    pub path: PathBuf,
    pub offset: u64,
}

impl DiskLocation {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        DiskLocation {
            path: path.into(),
            offset,
        }
    }

    /// Checks that the offset is sector aligned.
    pub fn check_offset(&self, sector_size: u32) -> Result<(), SectorlockError> {
        if self.offset % sector_size as u64 != 0 {
            return Err(SectorlockError::invalid(format!(
                "offset {} of '{}' not aligned to sector size {}",
                self.offset,
                self.path.display(),
                sector_size
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.offset)
    }
}

/// Reliable sector read/write primitive. Implementations need not bound
/// latency themselves; callers wrap every attempt in `io_timeout`.
#[async_trait]
pub trait SectorIo: fmt::Debug + Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`. Unwritten regions read
    /// back as zeros.
    async fn read_at(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, SectorlockError>;

    /// Writes all of `data` starting at `offset` and makes it durable before
    /// returning.
    async fn write_at(
        &self,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SectorlockError>;
}

/// File- or block-device-backed sector I/O. The target must already exist;
/// it is never created or grown here.
#[derive(Debug, Default, Clone)]
pub struct FileIo;

#[async_trait]
impl SectorIo for FileIo {
    async fn read_at(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, SectorlockError> {
        let mut file = OpenOptions::new().read(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        // a short file reads as zeros past its end
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf.freeze())
    }

    async fn write_at(
        &self,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SectorlockError> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Reads `count` whole sectors starting at sector index `first` of the lease
/// area at `disk`, bounded by `io_timeout`.
pub async fn read_sectors(
    io: &dyn SectorIo,
    disk: &DiskLocation,
    sector_size: u32,
    first: u64,
    count: u64,
    io_timeout: Duration,
) -> Result<Bytes, SectorlockError> {
    let offset = disk.offset + first * sector_size as u64;
    let len = (count * sector_size as u64) as usize;
    match time::timeout(io_timeout, io.read_at(&disk.path, offset, len)).await
    {
        Ok(res) => res,
        Err(_) => Err(SectorlockError::timeout(format!(
            "read of {} sectors at {} + {} timed out",
            count, disk, first
        ))),
    }
}

/// Writes whole sectors starting at sector index `first` of the lease area at
/// `disk`, bounded by `io_timeout`. `data` must span whole sectors.
pub async fn write_sectors(
    io: &dyn SectorIo,
    disk: &DiskLocation,
    sector_size: u32,
    first: u64,
    data: &[u8],
    io_timeout: Duration,
) -> Result<(), SectorlockError> {
    if data.is_empty() || data.len() % sector_size as usize != 0 {
        return Err(SectorlockError::invalid(format!(
            "write of {} bytes is not whole {}-byte sectors",
            data.len(),
            sector_size
        )));
    }
    let offset = disk.offset + first * sector_size as u64;
    match time::timeout(io_timeout, io.write_at(&disk.path, offset, data))
        .await
    {
        Ok(res) => res,
        Err(_) => Err(SectorlockError::timeout(format!(
            "write of {} bytes at {} + {} timed out",
            data.len(),
            disk,
            first
        ))),
    }
}
