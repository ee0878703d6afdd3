//! Shared storage access: geometry validation and sector I/O.

mod geometry;
mod memdisk;
mod sectorio;

pub use geometry::{
    check_host_id, check_io_timeout, check_name, AlignSize, Geometry,
    SectorSize, MAX_HOSTS, NAME_LEN,
};
pub use memdisk::{Fault, MemDisk};
pub use sectorio::{read_sectors, write_sectors, DiskLocation, FileIo, SectorIo};
