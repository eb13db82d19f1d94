//! Error type shared by every layer of the crate.
//!
//! Only real failures live here.  "Already signaled" and "already passed"
//! are alternate successes and are reported through the status enums in
//! [`fence`](crate::fence) instead.

use thiserror::Error;

// Linux errno values reported by the kernel subsystem for the same cases.
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const EDEADLK: i32 = 35;
const ETIMEDOUT: i32 = 110;
const ERESTARTSYS: i32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad argument: missing buffer or enable hook, misaligned or
    /// out-of-range semaphore offset, buffer from another table.
    #[error("invalid argument")]
    InvalidArgument,

    /// The callback record is already registered on a fence.
    #[error("callback already registered")]
    Busy,

    /// A shared reservation was requested on a buffer whose shared fence
    /// slots are all in use.
    #[error("shared fence slots exhausted")]
    SharedSlotsFull,

    /// The same buffer appears twice in one validation list.
    #[error("buffer already reserved by this ticket")]
    Deadlock,

    /// A commit was attempted on an entry that does not hold its
    /// reservation.
    #[error("entry is not reserved")]
    NotReserved,

    /// An interruptible wait saw a pending signal.
    #[error("interrupted by signal")]
    Interrupted,

    /// The wait's deadline passed first.
    #[error("timed out")]
    TimedOut,
}

impl Error {
    /// The negative errno a kernel caller would see.
    pub fn to_errno(self) -> i32 {
        match self {
            Error::InvalidArgument | Error::SharedSlotsFull | Error::NotReserved => -EINVAL,
            Error::Busy => -EBUSY,
            Error::Deadlock => -EDEADLK,
            Error::Interrupted => -ERESTARTSYS,
            Error::TimedOut => -ETIMEDOUT,
        }
    }
}

pub type Result<T = ()> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::SharedSlotsFull.to_errno(), -22);
        assert_eq!(Error::Busy.to_errno(), -16);
        assert_eq!(Error::Interrupted.to_errno(), -512);
        assert_ne!(Error::Interrupted.to_errno(), Error::TimedOut.to_errno());
    }
}
