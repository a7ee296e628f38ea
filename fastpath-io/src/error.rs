use std::io;
use thiserror::Error;

use crate::slot::AddressFamily;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("batch of {requested} messages exceeds the per-call limit of {max}")]
    BatchTooLarge { requested: usize, max: usize },
    #[error("slot size {slot_size} is smaller than the {header} byte {family} slot header")]
    SlotTooSmall { family: AddressFamily, slot_size: usize, header: usize },
    #[error("buffer of {len} bytes is smaller than the {required} bytes addressed")]
    BufferTooSmall { len: usize, required: usize },
    #[error("payload length {len} exceeds slot capacity of {capacity} bytes")]
    PayloadOverflow { len: usize, capacity: usize },
    #[error("address family mismatch: socket is {expected}, got {actual}")]
    FamilyMismatch { expected: AddressFamily, actual: AddressFamily },
    #[error("invalid ring geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("handle is closed")]
    Closed,
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl NetError {
    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        NetError::Os { op, source }
    }

    /// Captures `errno` of the call that just failed.
    pub(crate) fn last_os(op: &'static str) -> Self {
        NetError::Os { op, source: io::Error::last_os_error() }
    }

    /// True for caller mistakes rejected before any syscall was issued.
    pub fn is_invalid_argument(&self) -> bool {
        !matches!(self, NetError::Os { .. } | NetError::Closed)
    }

    /// Errno-style code for this error. Argument errors map to `EINVAL`,
    /// operations on a closed handle to `EBADF`.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            NetError::Os { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            NetError::Closed => libc::EBADF,
            _ => libc::EINVAL,
        }
    }
}

/// OS error code left by the most recent failing call on this thread.
///
/// Only meaningful immediately after a call reported failure.
pub fn last_os_error() -> i32 {
    nix::errno::Errno::last() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let too_large = NetError::BatchTooLarge { requested: 1025, max: 1024 };
        assert!(too_large.is_invalid_argument());
        assert_eq!(too_large.raw_os_error(), libc::EINVAL);

        let closed = NetError::Closed;
        assert!(!closed.is_invalid_argument());
        assert_eq!(closed.raw_os_error(), libc::EBADF);

        let os = NetError::os("sendmmsg", io::Error::from_raw_os_error(libc::ENOBUFS));
        assert!(!os.is_invalid_argument());
        assert_eq!(os.raw_os_error(), libc::ENOBUFS);
        assert!(os.to_string().starts_with("sendmmsg failed"));
    }
}
