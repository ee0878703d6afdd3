//! Per-host paxos ballot block.

use crate::ondisk::{disk_checksum, pad_to_sector};
use crate::utils::SectorlockError;

use bytes::{Buf, BufMut, BytesMut};

/// Encoded length of a dblock.
pub const DBLOCK_LEN: usize = 56;

/// Bytes covered by the checksum.
const DBLOCK_CHECKSUM_LEN: usize = 48;

/// Set by the owner when it releases the lease it holds.
pub const DBLOCK_FL_RELEASED: u32 = 0x1;

/// Ballot state a host publishes in its own sector of a resource area.
/// `inp`, `inp2`, `inp3` carry the proposed owner id, generation, and
/// timestamp.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct PaxosDblock {
    pub mbal: u64,
    pub bal: u64,
    pub inp: u64,
    pub inp2: u64,
    pub inp3: u64,
    pub lver: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl PaxosDblock {
    pub fn encode(&mut self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DBLOCK_LEN);
        buf.put_u64_le(self.mbal);
        buf.put_u64_le(self.bal);
        buf.put_u64_le(self.inp);
        buf.put_u64_le(self.inp2);
        buf.put_u64_le(self.inp3);
        buf.put_u64_le(self.lver);
        self.checksum = disk_checksum(&buf[..DBLOCK_CHECKSUM_LEN]);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.flags);
        buf
    }

    pub fn encode_sector(&mut self, sector_size: u32) -> BytesMut {
        pad_to_sector(self.encode(), sector_size)
    }

    /// Decodes and verifies a dblock. A never-written block (all zero ballot
    /// fields and checksum) is valid.
    pub fn decode(mut buf: &[u8]) -> Result<Self, SectorlockError> {
        if buf.len() < DBLOCK_LEN {
            return Err(SectorlockError::format(format!(
                "dblock buffer too short: {} bytes",
                buf.len()
            )));
        }
        let expected = disk_checksum(&buf[..DBLOCK_CHECKSUM_LEN]);
        let dblock = PaxosDblock {
            mbal: buf.get_u64_le(),
            bal: buf.get_u64_le(),
            inp: buf.get_u64_le(),
            inp2: buf.get_u64_le(),
            inp3: buf.get_u64_le(),
            lver: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        };

        if dblock.is_blank() {
            return Ok(dblock);
        }
        if dblock.checksum != expected {
            return Err(SectorlockError::corrupt(format!(
                "dblock checksum {:#010x} expected {:#010x}",
                dblock.checksum, expected
            )));
        }
        Ok(dblock)
    }

    /// True if this block was never written.
    #[inline]
    pub fn is_blank(&self) -> bool {
        self.checksum == 0
            && self.mbal == 0
            && self.bal == 0
            && self.inp == 0
            && self.lver == 0
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.flags & DBLOCK_FL_RELEASED != 0
    }
}

#[cfg(test)]
mod dblock_tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn layout_and_decode() -> Result<(), SectorlockError> {
        let mut dblock = PaxosDblock {
            mbal: 2001,
            bal: 2001,
            inp: 1,
            inp2: 5,
            inp3: 99,
            lver: 4,
            checksum: 0,
            flags: DBLOCK_FL_RELEASED,
        };
        let buf = dblock.encode_sector(512);
        assert_eq!(buf.len(), 512);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 2001);
        assert_eq!(u64::from_le_bytes(buf[40..48].try_into().unwrap()), 4);
        assert_eq!(
            u32::from_le_bytes(buf[48..52].try_into().unwrap()),
            dblock.checksum
        );
        assert_eq!(u32::from_le_bytes(buf[52..56].try_into().unwrap()), 1);
        let back = PaxosDblock::decode(&buf)?;
        assert_eq!(back, dblock);
        assert!(back.is_released());
        Ok(())
    }

    #[test]
    fn blank_is_valid() -> Result<(), SectorlockError> {
        let back = PaxosDblock::decode(&[0u8; 512])?;
        assert!(back.is_blank());
        assert!(!back.is_released());
        Ok(())
    }

    #[test]
    fn corruption_detected() {
        let mut dblock = PaxosDblock {
            mbal: 7,
            lver: 1,
            ..Default::default()
        };
        let mut buf = dblock.encode();
        buf[3] ^= 0x40;
        let e = PaxosDblock::decode(&buf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Corrupt);
        let e = PaxosDblock::decode(&buf[..10]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Format);
    }
}
