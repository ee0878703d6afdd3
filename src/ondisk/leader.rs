//! Leader record: the first 200 bytes of a delta lease host slot or a paxos
//! lease area.

use std::fmt;

use crate::disk::{Geometry, NAME_LEN};
use crate::ondisk::{
    disk_checksum, pad_to_sector, DELTA_DISK_MAGIC, DELTA_DISK_VERSION_MAJOR,
    DELTA_DISK_VERSION_MINOR, PAXOS_DISK_CLEAR, PAXOS_DISK_MAGIC,
    PAXOS_DISK_VERSION_MAJOR, PAXOS_DISK_VERSION_MINOR, VERSION_MAJOR_MASK,
};
use crate::utils::SectorlockError;

use bytes::{Buf, BufMut, BytesMut};

/// Encoded length of a leader record.
pub const LEADER_LEN: usize = 200;

/// Bytes covered by the checksum.
const LEADER_CHECKSUM_LEN: usize = 168;

/// Prefix compared when checking whether two replicas hold the same leader
/// (everything before `timestamp`).
pub const LEADER_COMPARE_LEN: usize = 152;

/// Timestamp value marking a lease as not held.
pub const LEASE_FREE: u64 = 0;

/// Leader flag hinting that the owner holds the lease only briefly.
pub const LFL_SHORT_HOLD: u32 = 0x1;

/// Which kind of lease area a leader record belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LeaseKind {
    Delta,
    Paxos,
}

impl LeaseKind {
    pub fn magic(self) -> u32 {
        match self {
            Self::Delta => DELTA_DISK_MAGIC,
            Self::Paxos => PAXOS_DISK_MAGIC,
        }
    }

    pub fn version(self) -> u32 {
        match self {
            Self::Delta => DELTA_DISK_VERSION_MAJOR | DELTA_DISK_VERSION_MINOR,
            Self::Paxos => PAXOS_DISK_VERSION_MAJOR | PAXOS_DISK_VERSION_MINOR,
        }
    }
}

/// Decoded leader record. In a delta lease `owner_id`/`owner_generation` are
/// the slot's host id and generation and `resource_name` holds the host name.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LeaderRecord {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub sector_size: u32,
    pub num_hosts: u64,
    pub max_hosts: u64,
    pub owner_id: u64,
    pub owner_generation: u64,
    pub lver: u64,
    pub space_name: String,
    pub resource_name: String,
    pub timestamp: u64,
    pub unused1: u64,
    pub checksum: u32,
    pub unused2: u16,
    pub io_timeout: u16,
    pub write_id: u64,
    pub write_generation: u64,
    pub write_timestamp: u64,
}

fn put_name(buf: &mut BytesMut, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LEN);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, NAME_LEN - len);
}

fn get_name(buf: &mut &[u8]) -> Result<String, SectorlockError> {
    let raw = &buf[..NAME_LEN];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let name = String::from_utf8(raw[..end].to_vec())?;
    buf.advance(NAME_LEN);
    Ok(name)
}

impl LeaderRecord {
    /// A fresh, free leader for a new lease area of the given kind.
    pub fn new_free(
        kind: LeaseKind,
        geometry: &Geometry,
        space_name: &str,
        resource_name: &str,
    ) -> Self {
        LeaderRecord {
            magic: kind.magic(),
            version: kind.version(),
            flags: geometry.align().leader_flag(),
            sector_size: geometry.sector_bytes(),
            num_hosts: geometry.max_hosts(),
            max_hosts: geometry.max_hosts(),
            space_name: space_name.into(),
            resource_name: resource_name.into(),
            timestamp: LEASE_FREE,
            ..Default::default()
        }
    }

    /// Encodes the record into exactly `LEADER_LEN` bytes, computing the
    /// checksum over the encoded prefix and storing it into both the output
    /// and `self.checksum`.
    pub fn encode(&mut self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LEADER_LEN);
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.sector_size);
        buf.put_u64_le(self.num_hosts);
        buf.put_u64_le(self.max_hosts);
        buf.put_u64_le(self.owner_id);
        buf.put_u64_le(self.owner_generation);
        buf.put_u64_le(self.lver);
        put_name(&mut buf, &self.space_name);
        put_name(&mut buf, &self.resource_name);
        buf.put_u64_le(self.timestamp);
        buf.put_u64_le(self.unused1);
        debug_assert_eq!(buf.len(), LEADER_CHECKSUM_LEN);

        self.checksum = disk_checksum(&buf[..LEADER_CHECKSUM_LEN]);
        buf.put_u32_le(self.checksum);
        buf.put_u16_le(self.unused2);
        buf.put_u16_le(self.io_timeout);
        buf.put_u64_le(self.write_id);
        buf.put_u64_le(self.write_generation);
        buf.put_u64_le(self.write_timestamp);
        debug_assert_eq!(buf.len(), LEADER_LEN);
        buf
    }

    /// Encodes the record padded with zeros to a whole sector.
    pub fn encode_sector(&mut self, sector_size: u32) -> BytesMut {
        pad_to_sector(self.encode(), sector_size)
    }

    /// Decodes fields without any validation.
    fn decode_raw(mut buf: &[u8]) -> Result<Self, SectorlockError> {
        if buf.len() < LEADER_LEN {
            return Err(SectorlockError::format(format!(
                "leader buffer too short: {} bytes",
                buf.len()
            )));
        }
        Ok(LeaderRecord {
            magic: buf.get_u32_le(),
            version: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            sector_size: buf.get_u32_le(),
            num_hosts: buf.get_u64_le(),
            max_hosts: buf.get_u64_le(),
            owner_id: buf.get_u64_le(),
            owner_generation: buf.get_u64_le(),
            lver: buf.get_u64_le(),
            space_name: get_name(&mut buf)?,
            resource_name: get_name(&mut buf)?,
            timestamp: buf.get_u64_le(),
            unused1: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
            unused2: buf.get_u16_le(),
            io_timeout: buf.get_u16_le(),
            write_id: buf.get_u64_le(),
            write_generation: buf.get_u64_le(),
            write_timestamp: buf.get_u64_le(),
        })
    }

    /// Decodes and verifies a leader record of the expected kind: magic,
    /// major version, then checksum.
    pub fn decode(buf: &[u8], kind: LeaseKind) -> Result<Self, SectorlockError> {
        let leader = Self::decode_raw(buf)?;

        if kind == LeaseKind::Paxos && leader.magic == PAXOS_DISK_CLEAR {
            return Err(SectorlockError::format("resource lease was cleared"));
        }
        if leader.magic != kind.magic() {
            return Err(SectorlockError::format(format!(
                "wrong {:?} leader magic {:#010x}",
                kind, leader.magic
            )));
        }
        if leader.version & VERSION_MAJOR_MASK
            != kind.version() & VERSION_MAJOR_MASK
        {
            return Err(SectorlockError::format(format!(
                "wrong {:?} leader version {:#010x}",
                kind, leader.version
            )));
        }

        let expected = disk_checksum(&buf[..LEADER_CHECKSUM_LEN]);
        if leader.checksum != expected {
            return Err(SectorlockError::corrupt(format!(
                "leader checksum {:#010x} expected {:#010x}",
                leader.checksum, expected
            )));
        }
        Ok(leader)
    }

    /// Geometry recorded in this leader.
    pub fn geometry(&self) -> Result<Geometry, SectorlockError> {
        Geometry::from_leader(self.flags, self.sector_size)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.timestamp == LEASE_FREE
    }

    /// True if both records agree on everything before the timestamp, the
    /// same comparison used to decide replica agreement.
    pub fn same_lease(&self, other: &LeaderRecord) -> bool {
        self.magic == other.magic
            && self.version == other.version
            && self.flags == other.flags
            && self.sector_size == other.sector_size
            && self.num_hosts == other.num_hosts
            && self.max_hosts == other.max_hosts
            && self.owner_id == other.owner_id
            && self.owner_generation == other.owner_generation
            && self.lver == other.lver
            && self.space_name == other.space_name
            && self.resource_name == other.resource_name
    }
}

impl fmt::Display for LeaderRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} lver {} owner {}/{} ts {} writer {}/{}",
            self.space_name,
            self.resource_name,
            self.lver,
            self.owner_id,
            self.owner_generation,
            self.timestamp,
            self.write_id,
            self.write_generation
        )
    }
}
