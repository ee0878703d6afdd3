//! In-memory `SectorIo` fake with per-path fault injection, used to drive the
//! lease protocols through replica failures without real storage.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::disk::SectorIo;
use crate::utils::SectorlockError;

use async_trait::async_trait;

use bytes::{Bytes, BytesMut};

/// Granularity of the sparse block store.
const BLOCK: u64 = 512;

/// Injected misbehavior of one backing path.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Fault {
    /// Every read and write fails immediately with an I/O error.
    Error,
    /// Every read and write never completes.
    Hang,
    /// Writes fail, reads still succeed.
    ReadOnly,
}

#[derive(Debug, Default)]
struct MemDiskInner {
    /// Sparse content per path, keyed by 512-byte block index.
    blocks: HashMap<PathBuf, BTreeMap<u64, [u8; BLOCK as usize]>>,
    faults: HashMap<PathBuf, Fault>,
    writes: HashMap<PathBuf, u64>,
}

/// Sparse in-memory disks addressed by path. Clones share the same content.
#[derive(Debug, Default, Clone)]
pub struct MemDisk {
    inner: Arc<Mutex<MemDiskInner>>,
}

impl MemDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent I/O to `path` misbehave.
    pub fn inject(&self, path: impl Into<PathBuf>, fault: Fault) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.insert(path.into(), fault);
        }
    }

    /// Removes any injected fault from `path`.
    pub fn heal(&self, path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.remove(path);
        }
    }

    /// Number of successful writes to `path` so far.
    pub fn write_count(&self, path: &Path) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.writes.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn fault_of(&self, path: &Path) -> Result<Option<Fault>, SectorlockError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?;
        Ok(inner.faults.get(path).copied())
    }

    fn check_aligned(offset: u64, len: usize) -> Result<(), SectorlockError> {
        if offset % BLOCK != 0 || len as u64 % BLOCK != 0 {
            return Err(SectorlockError::invalid(format!(
                "unaligned memdisk access offset {} len {}",
                offset, len
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SectorIo for MemDisk {
    async fn read_at(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, SectorlockError> {
        Self::check_aligned(offset, len)?;
        match self.fault_of(path)? {
            Some(Fault::Error) => {
                return Err(SectorlockError::io(format!(
                    "injected read error on '{}'",
                    path.display()
                )));
            }
            Some(Fault::Hang) => futures::future::pending::<()>().await,
            _ => {}
        }

        let inner = self
            .inner
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?;
        let mut buf = BytesMut::zeroed(len);
        if let Some(blocks) = inner.blocks.get(path) {
            let first = offset / BLOCK;
            let last = first + len as u64 / BLOCK;
            for (&idx, block) in blocks.range(first..last) {
                let start = ((idx - first) * BLOCK) as usize;
                buf[start..start + BLOCK as usize].copy_from_slice(block);
            }
        }
        Ok(buf.freeze())
    }

    async fn write_at(
        &self,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SectorlockError> {
        Self::check_aligned(offset, data.len())?;
        match self.fault_of(path)? {
            Some(Fault::Error) | Some(Fault::ReadOnly) => {
                return Err(SectorlockError::io(format!(
                    "injected write error on '{}'",
                    path.display()
                )));
            }
            Some(Fault::Hang) => futures::future::pending::<()>().await,
            None => {}
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|e| SectorlockError::msg(e.to_string()))?;
        let blocks = inner.blocks.entry(path.to_path_buf()).or_default();
        for (i, chunk) in data.chunks_exact(BLOCK as usize).enumerate() {
            let idx = offset / BLOCK + i as u64;
            if chunk.iter().all(|&b| b == 0) {
                blocks.remove(&idx);
            } else {
                let mut block = [0u8; BLOCK as usize];
                block.copy_from_slice(chunk);
                blocks.insert(idx, block);
            }
        }
        *inner.writes.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }
}
