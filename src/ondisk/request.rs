//! Request record kept in the second sector of a resource area.

use crate::ondisk::{
    pad_to_sector, REQ_DISK_MAGIC, REQ_DISK_VERSION_MAJOR,
    REQ_DISK_VERSION_MINOR, VERSION_MAJOR_MASK,
};
use crate::utils::SectorlockError;

use bytes::{Buf, BufMut, BytesMut};

/// Encoded length of a request record.
pub const REQUEST_LEN: usize = 20;

/// Asks the current owner of a resource to give it up at `lver`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RequestRecord {
    pub magic: u32,
    pub version: u32,
    pub lver: u64,
    pub force_mode: u32,
}

impl Default for RequestRecord {
    fn default() -> Self {
        RequestRecord {
            magic: REQ_DISK_MAGIC,
            version: REQ_DISK_VERSION_MAJOR | REQ_DISK_VERSION_MINOR,
            lver: 0,
            force_mode: 0,
        }
    }
}

impl RequestRecord {
    pub fn encode_sector(&self, sector_size: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(sector_size as usize);
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.lver);
        buf.put_u32_le(self.force_mode);
        pad_to_sector(buf, sector_size)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, SectorlockError> {
        if buf.len() < REQUEST_LEN {
            return Err(SectorlockError::format("request buffer too short"));
        }
        let rr = RequestRecord {
            magic: buf.get_u32_le(),
            version: buf.get_u32_le(),
            lver: buf.get_u64_le(),
            force_mode: buf.get_u32_le(),
        };
        if rr.magic != REQ_DISK_MAGIC {
            return Err(SectorlockError::format(format!(
                "wrong request magic {:#010x}",
                rr.magic
            )));
        }
        if rr.version & VERSION_MAJOR_MASK != REQ_DISK_VERSION_MAJOR {
            return Err(SectorlockError::format(format!(
                "wrong request version {:#010x}",
                rr.version
            )));
        }
        Ok(rr)
    }
}
