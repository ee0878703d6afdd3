//! On-disk lease record codec. All records are little-endian, start at the
//! beginning of a sector, and carry a CRC-32C checksum.

mod dblock;
mod leader;
mod request;

pub use dblock::{PaxosDblock, DBLOCK_FL_RELEASED, DBLOCK_LEN};
pub use leader::{
    LeaderRecord, LeaseKind, LEADER_COMPARE_LEN, LEADER_LEN, LEASE_FREE,
    LFL_SHORT_HOLD,
};
pub use request::{RequestRecord, REQUEST_LEN};

use bytes::BytesMut;

/// Magic number of a lockspace (delta lease) host slot.
pub const DELTA_DISK_MAGIC: u32 = 0x12212010;
/// Magic number of a resource (paxos lease) leader.
pub const PAXOS_DISK_MAGIC: u32 = 0x06152010;
/// Magic number of a resource leader that was deliberately cleared.
pub const PAXOS_DISK_CLEAR: u32 = 0x11282016;
/// Magic number of a resource request record.
pub const REQ_DISK_MAGIC: u32 = 0x08292011;

pub const DELTA_DISK_VERSION_MAJOR: u32 = 0x00030000;
pub const DELTA_DISK_VERSION_MINOR: u32 = 0x00000002;
pub const PAXOS_DISK_VERSION_MAJOR: u32 = 0x00060000;
pub const PAXOS_DISK_VERSION_MINOR: u32 = 0x00000002;
pub const REQ_DISK_VERSION_MAJOR: u32 = 0x00010000;
pub const REQ_DISK_VERSION_MINOR: u32 = 0x00000001;

const VERSION_MAJOR_MASK: u32 = 0xFFFF0000;

/// CRC-32C seeded with `!1` and without final inversion, the checksum used by
/// every on-disk record.
#[inline]
pub fn disk_checksum(data: &[u8]) -> u32 {
    // crc32c_append pre- and post-inverts the running value
    !crc32c::crc32c_append(1, data)
}

/// Pads an encoded record with zeros up to a whole sector.
pub(crate) fn pad_to_sector(mut buf: BytesMut, sector_size: u32) -> BytesMut {
    buf.resize(sector_size as usize, 0);
    buf
}
