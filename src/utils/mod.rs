//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod diskset;
mod error;
mod timer;

pub use diskset::DiskSet;
pub use error::{ErrorKind, SectorlockError};
pub use print::{logger_init, ME};
pub use timer::{now_secs, Deadline};
