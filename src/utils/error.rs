//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;

/// Category of a lease manager error. Callers branch on this rather than on
/// the message text.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Bad geometry, name, host id, offset, etc.; raised before any I/O.
    InvalidArgument,
    /// Status requested before the first renewal cycle completed.
    NotYetAvailable,
    /// Wrong magic number, version, or record shape on disk.
    Format,
    /// Checksum mismatch on disk.
    Corrupt,
    /// A competing claim won the consensus round.
    Conflict,
    /// Slot or session already has something in progress.
    Busy,
    /// Underlying storage failure or lost quorum.
    Io,
    /// Storage did not answer within `io_timeout`.
    Timeout,
    /// Named lockspace, resource, or session is not known.
    NotFound,
    /// Anything else.
    Other,
}

/// Customized error type for sectorlock.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SectorlockError {
    kind: ErrorKind,
    msg: String,
}

impl SectorlockError {
    pub fn msg(msg: impl ToString) -> Self {
        SectorlockError {
            kind: ErrorKind::Other,
            msg: msg.to_string(),
        }
    }

    pub fn with_kind(kind: ErrorKind, msg: impl ToString) -> Self {
        SectorlockError {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn invalid(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::InvalidArgument, msg)
    }

    pub fn not_yet(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::NotYetAvailable, msg)
    }

    pub fn format(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Format, msg)
    }

    pub fn corrupt(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Corrupt, msg)
    }

    pub fn conflict(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Conflict, msg)
    }

    pub fn busy(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Busy, msg)
    }

    pub fn io(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Io, msg)
    }

    pub fn timeout(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::Timeout, msg)
    }

    pub fn not_found(msg: impl ToString) -> Self {
        Self::with_kind(ErrorKind::NotFound, msg)
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for SectorlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for SectorlockError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `SectorlockError`.
macro_rules! impl_from_error {
    ($error:ty, $kind:expr) => {
        impl From<$error> for SectorlockError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SectorlockError::with_kind($kind, e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `SectorlockError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for SectorlockError {
            fn from(e: $error) -> SectorlockError {
                SectorlockError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, ErrorKind::Io);
impl_from_error!(tokio::time::error::Elapsed, ErrorKind::Timeout);
impl_from_error!(string::FromUtf8Error, ErrorKind::Format);
impl_from_error!(num::ParseIntError, ErrorKind::InvalidArgument);
impl_from_error!(toml::ser::Error, ErrorKind::InvalidArgument);
impl_from_error!(toml::de::Error, ErrorKind::InvalidArgument);
impl_from_error!(tokio::task::JoinError, ErrorKind::Other);
impl_from_error!(tokio::sync::watch::error::RecvError, ErrorKind::Other);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
