//! Lease area geometry: alignment and sector size validation.
//!
//! Every lease area (a lockspace's host slots, or one resource's leader +
//! ballot blocks) occupies exactly one alignment unit on disk, carved into
//! sectors. Only a handful of (alignment, sector) pairs are legal; anything
//! else is rejected before storage is touched.

use std::fmt;

use crate::utils::SectorlockError;

/// Maximum length in bytes of lockspace, resource, and host names.
pub const NAME_LEN: usize = 48;

/// Most host slots any geometry provides.
pub const MAX_HOSTS: u64 = 2000;

const MIB: u64 = 1024 * 1024;

/// Lease area alignment size.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum AlignSize {
    A1M,
    A2M,
    A4M,
    A8M,
}

impl AlignSize {
    /// Every legal alignment, smallest first.
    pub const ALL: [AlignSize; 4] =
        [AlignSize::A1M, AlignSize::A2M, AlignSize::A4M, AlignSize::A8M];

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            b if b == MIB => Some(Self::A1M),
            b if b == 2 * MIB => Some(Self::A2M),
            b if b == 4 * MIB => Some(Self::A4M),
            b if b == 8 * MIB => Some(Self::A8M),
            _ => None,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            Self::A1M => MIB,
            Self::A2M => 2 * MIB,
            Self::A4M => 4 * MIB,
            Self::A8M => 8 * MIB,
        }
    }

    /// Leader record flag bit recording this alignment on disk.
    pub fn leader_flag(self) -> u32 {
        match self {
            Self::A1M => 0x10,
            Self::A2M => 0x20,
            Self::A4M => 0x40,
            Self::A8M => 0x80,
        }
    }

    /// Reverse of `leader_flag()`; `None` if no alignment bit is set.
    pub fn from_leader_flags(flags: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|a| flags & a.leader_flag() != 0)
    }
}

/// Sector size of the backing storage.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SectorSize {
    S512,
    S4K,
}

impl SectorSize {
    pub const ALL: [SectorSize; 2] = [SectorSize::S512, SectorSize::S4K];

    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            512 => Some(Self::S512),
            4096 => Some(Self::S4K),
            _ => None,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Self::S512 => 512,
            Self::S4K => 4096,
        }
    }
}

/// A validated (alignment, sector size) pair.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Geometry {
    align: AlignSize,
    sector: SectorSize,
}

impl Geometry {
    /// Default geometry used when the caller supplies nothing.
    pub const DEFAULT: Geometry = Geometry {
        align: AlignSize::A1M,
        sector: SectorSize::S512,
    };

    /// Validates a requested geometry. `None` fields take the defaults; a
    /// lone 4K sector size defaults to 1M alignment as well.
    pub fn new(
        align: Option<u64>,
        sector: Option<u32>,
    ) -> Result<Self, SectorlockError> {
        let align = match align {
            None => AlignSize::A1M,
            Some(bytes) => AlignSize::from_bytes(bytes).ok_or_else(|| {
                SectorlockError::invalid(format!(
                    "invalid alignment size {}",
                    bytes
                ))
            })?,
        };
        let sector = match sector {
            None => SectorSize::S512,
            Some(bytes) => SectorSize::from_bytes(bytes).ok_or_else(|| {
                SectorlockError::invalid(format!(
                    "invalid sector size {}",
                    bytes
                ))
            })?,
        };
        Self::combine(align, sector)
    }

    /// Checks that the pair is one of the compatible combinations: 512-byte
    /// sectors only come with 1M alignment.
    pub fn combine(
        align: AlignSize,
        sector: SectorSize,
    ) -> Result<Self, SectorlockError> {
        if sector == SectorSize::S512 && align != AlignSize::A1M {
            return Err(SectorlockError::invalid(format!(
                "alignment {} incompatible with sector size {}",
                align.bytes(),
                sector.bytes()
            )));
        }
        Ok(Geometry { align, sector })
    }

    /// Recovers the geometry recorded in a leader record.
    pub fn from_leader(
        flags: u32,
        sector_size: u32,
    ) -> Result<Self, SectorlockError> {
        let sector = SectorSize::from_bytes(sector_size).ok_or_else(|| {
            SectorlockError::format(format!(
                "leader has invalid sector size {}",
                sector_size
            ))
        })?;
        // records written without an alignment flag imply the historical
        // 1M default
        let align = AlignSize::from_leader_flags(flags).unwrap_or(AlignSize::A1M);
        Self::combine(align, sector)
            .map_err(|e| SectorlockError::format(format!("leader {}", e)))
    }

    #[inline]
    pub fn align(&self) -> AlignSize {
        self.align
    }

    #[inline]
    pub fn sector(&self) -> SectorSize {
        self.sector
    }

    #[inline]
    pub fn align_bytes(&self) -> u64 {
        self.align.bytes()
    }

    #[inline]
    pub fn sector_bytes(&self) -> u32 {
        self.sector.bytes()
    }

    /// Number of host slots one lease area holds. Rounded down from the
    /// sector count so that a resource area still fits its leader and
    /// request sectors ahead of the per-host ballot blocks.
    #[inline]
    pub fn max_hosts(&self) -> u64 {
        match (self.align, self.sector) {
            (AlignSize::A1M, SectorSize::S512) => 2000,
            (AlignSize::A1M, SectorSize::S4K) => 250,
            (AlignSize::A2M, _) => 500,
            (AlignSize::A4M, _) => 1000,
            (AlignSize::A8M, _) => 2000,
        }
    }

    /// Number of whole sectors in one lease area.
    #[inline]
    pub fn sectors_per_area(&self) -> u64 {
        self.align.bytes() / self.sector.bytes() as u64
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "align {} sector {}",
            self.align.bytes(),
            self.sector.bytes()
        )
    }
}

/// Checks a lockspace/resource/host name: non-empty, no NUL, fits on disk.
pub fn check_name(what: &str, name: &str) -> Result<(), SectorlockError> {
    if name.is_empty() {
        return Err(SectorlockError::invalid(format!("empty {} name", what)));
    }
    if name.len() > NAME_LEN {
        return Err(SectorlockError::invalid(format!(
            "{} name '{}' longer than {} bytes",
            what, name, NAME_LEN
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(SectorlockError::invalid(format!(
            "{} name contains NUL byte",
            what
        )));
    }
    Ok(())
}

/// Checks a host id against the number of slots a geometry provides.
pub fn check_host_id(
    host_id: u64,
    geometry: &Geometry,
) -> Result<(), SectorlockError> {
    if host_id == 0 || host_id > geometry.max_hosts() {
        return Err(SectorlockError::invalid(format!(
            "host_id {} out of range 1..={}",
            host_id,
            geometry.max_hosts()
        )));
    }
    Ok(())
}

/// Checks an io_timeout value in seconds; it is stored as a u16 on disk.
pub fn check_io_timeout(io_timeout: u64) -> Result<u16, SectorlockError> {
    match u16::try_from(io_timeout) {
        Ok(t) if t > 0 => Ok(t),
        _ => Err(SectorlockError::invalid(format!(
            "invalid io_timeout {}",
            io_timeout
        ))),
    }
}

#[cfg(test)]
mod geometry_tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn default_geometry() -> Result<(), SectorlockError> {
        let geo = Geometry::new(None, None)?;
        assert_eq!(geo, Geometry::DEFAULT);
        assert_eq!(geo.align_bytes(), 1024 * 1024);
        assert_eq!(geo.sector_bytes(), 512);
        assert_eq!(geo.max_hosts(), 2000);
        assert_eq!(geo.sectors_per_area(), 2048);
        Ok(())
    }

    #[test]
    fn valid_combinations() -> Result<(), SectorlockError> {
        let valid = [
            (MIB, 512, 2000),
            (MIB, 4096, 250),
            (2 * MIB, 4096, 500),
            (4 * MIB, 4096, 1000),
            (8 * MIB, 4096, 2000),
        ];
        for (align, sector, hosts) in valid {
            let geo = Geometry::new(Some(align), Some(sector))?;
            assert_eq!(geo.max_hosts(), hosts);
            assert!(geo.max_hosts() + 2 <= geo.sectors_per_area());
        }
        Ok(())
    }

    #[test]
    fn invalid_combinations() {
        let invalid = [
            (1024, 512),
            (1024, 4096),
            (MIB, 8192),
            (MIB, 1024),
            (2 * MIB, 512),
            (4 * MIB, 512),
            (8 * MIB, 512),
            (16 * MIB, 4096),
        ];
        for (align, sector) in invalid {
            let e = Geometry::new(Some(align), Some(sector)).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn leader_flags_roundtrip() -> Result<(), SectorlockError> {
        for align in AlignSize::ALL {
            assert_eq!(
                AlignSize::from_leader_flags(align.leader_flag() | 0x1),
                Some(align)
            );
        }
        let geo = Geometry::from_leader(0, 512)?;
        assert_eq!(geo, Geometry::DEFAULT);
        assert_eq!(
            Geometry::from_leader(0x20, 512).unwrap_err().kind(),
            ErrorKind::Format
        );
        Ok(())
    }

    #[test]
    fn name_checks() {
        assert!(check_name("lockspace", "ls_name").is_ok());
        assert!(check_name("lockspace", "").is_err());
        assert!(check_name("lockspace", &"x".repeat(NAME_LEN)).is_ok());
        assert!(check_name("lockspace", &"x".repeat(NAME_LEN + 1)).is_err());
        assert!(check_name("resource", "a\0b").is_err());
    }

    #[test]
    fn host_id_and_timeout_checks() {
        let geo = Geometry::DEFAULT;
        assert!(check_host_id(0, &geo).is_err());
        assert!(check_host_id(1, &geo).is_ok());
        assert!(check_host_id(2000, &geo).is_ok());
        assert!(check_host_id(2001, &geo).is_err());
        for align in AlignSize::ALL {
            for sector in SectorSize::ALL {
                if let Ok(geo) =
                    Geometry::new(Some(align.bytes()), Some(sector.bytes()))
                {
                    assert!(geo.max_hosts() <= MAX_HOSTS);
                }
            }
        }
        assert_eq!(check_io_timeout(10), Ok(10));
        assert!(check_io_timeout(0).is_err());
        assert!(check_io_timeout(70000).is_err());
    }
}
