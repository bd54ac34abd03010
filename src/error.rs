//! Error types shared by the network engine and the task launcher.
//!
//! Every fallible operation returns [`Error`], a closed set of error kinds
//! carried together with the originating kernel errno (0 for synthetic
//! errors) and a human readable message. The kind set is what crosses the
//! RPC boundary, so nothing here is open-ended.

use std::fmt;

use nix::errno::Errno;
use thiserror::Error as ThisError;

/// The closed set of error kinds understood by the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Success,
    Unknown,
    InvalidMethod,
    ContainerAlreadyExists,
    ContainerDoesNotExist,
    InvalidProperty,
    InvalidData,
    InvalidValue,
    InvalidState,
    NotSupported,
    ResourceNotAvailable,
    Permission,
    Busy,
    NoSpace,
    Queued,
}

impl ErrorKind {
    /// Stable numeric code used on the control-socket wire.
    pub fn as_code(self) -> i32 {
        match self {
            ErrorKind::Success => 0,
            ErrorKind::Unknown => 1,
            ErrorKind::InvalidMethod => 2,
            ErrorKind::ContainerAlreadyExists => 3,
            ErrorKind::ContainerDoesNotExist => 4,
            ErrorKind::InvalidProperty => 5,
            ErrorKind::InvalidData => 6,
            ErrorKind::InvalidValue => 7,
            ErrorKind::InvalidState => 8,
            ErrorKind::NotSupported => 9,
            ErrorKind::ResourceNotAvailable => 10,
            ErrorKind::Permission => 11,
            ErrorKind::Busy => 12,
            ErrorKind::NoSpace => 13,
            ErrorKind::Queued => 14,
        }
    }

    pub fn from_code(code: i32) -> ErrorKind {
        match code {
            0 => ErrorKind::Success,
            2 => ErrorKind::InvalidMethod,
            3 => ErrorKind::ContainerAlreadyExists,
            4 => ErrorKind::ContainerDoesNotExist,
            5 => ErrorKind::InvalidProperty,
            6 => ErrorKind::InvalidData,
            7 => ErrorKind::InvalidValue,
            8 => ErrorKind::InvalidState,
            9 => ErrorKind::NotSupported,
            10 => ErrorKind::ResourceNotAvailable,
            11 => ErrorKind::Permission,
            12 => ErrorKind::Busy,
            13 => ErrorKind::NoSpace,
            14 => ErrorKind::Queued,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse classification of a kernel error code, used to decide whether an
/// operation should be retried, recursed into or ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelClass {
    NotFound,
    Busy,
    Exists,
    Permission,
    Invalid,
    Other,
}

/// Classify a (positive) errno value.
pub fn classify_errno(errno: i32) -> KernelClass {
    match Errno::from_raw(errno) {
        Errno::ENOENT | Errno::ESRCH | Errno::ENODEV | Errno::ENXIO => KernelClass::NotFound,
        Errno::EBUSY => KernelClass::Busy,
        Errno::EEXIST | Errno::EADDRINUSE => KernelClass::Exists,
        Errno::EPERM | Errno::EACCES => KernelClass::Permission,
        Errno::EINVAL | Errno::ERANGE => KernelClass::Invalid,
        _ => KernelClass::Other,
    }
}

#[derive(ThisError, Debug, Clone)]
#[error("{kind}: {msg} (errno {errno})")]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: i32,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno: 0,
            msg: msg.into(),
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno,
            msg: msg.into(),
        }
    }

    /// The non-error: stage-2 launch reports use it explicitly.
    pub fn success() -> Self {
        Self {
            kind: ErrorKind::Success,
            errno: 0,
            msg: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }

    /// Translate a kernel error from a netlink ACK or syscall into an
    /// [`Error`], choosing the kind from the errno classification.
    pub fn from_kernel(errno: i32, ctx: &str) -> Self {
        let errno = errno.abs();
        let kind = match classify_errno(errno) {
            KernelClass::Permission => ErrorKind::Permission,
            KernelClass::Busy => ErrorKind::Busy,
            KernelClass::Invalid => ErrorKind::InvalidValue,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            errno,
            msg: format!("{}: {}", ctx, Errno::from_raw(errno).desc()),
        }
    }

    pub fn kernel_class(&self) -> KernelClass {
        classify_errno(self.errno)
    }

    /// True when the underlying kernel code says the object is already gone.
    pub fn is_not_found(&self) -> bool {
        self.kernel_class() == KernelClass::NotFound
    }

    pub fn is_busy(&self) -> bool {
        self.kernel_class() == KernelClass::Busy
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::from_kernel(e as i32, "syscall failed")
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let errno = e.raw_os_error().unwrap_or(0);
        Error::with_errno(ErrorKind::Unknown, errno, e.to_string())
    }
}

impl From<rtnetlink::Error> for Error {
    fn from(e: rtnetlink::Error) -> Self {
        match e {
            rtnetlink::Error::NetlinkError(err) => {
                let code = err.code.map(|c| c.get()).unwrap_or(0);
                Error::from_kernel(code, "netlink request failed")
            }
            other => Error::new(ErrorKind::Unknown, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [
            ErrorKind::Success,
            ErrorKind::Unknown,
            ErrorKind::InvalidValue,
            ErrorKind::ResourceNotAvailable,
            ErrorKind::Busy,
            ErrorKind::Queued,
        ] {
            assert_eq!(ErrorKind::from_code(kind.as_code()), kind);
        }
    }

    #[test]
    fn kernel_classification() {
        assert_eq!(classify_errno(libc::ENOENT), KernelClass::NotFound);
        assert_eq!(classify_errno(libc::ESRCH), KernelClass::NotFound);
        assert_eq!(classify_errno(libc::EBUSY), KernelClass::Busy);
        assert_eq!(classify_errno(libc::EEXIST), KernelClass::Exists);
        assert_eq!(classify_errno(libc::EACCES), KernelClass::Permission);
        assert_eq!(classify_errno(libc::EINVAL), KernelClass::Invalid);
        assert_eq!(classify_errno(libc::EIO), KernelClass::Other);
    }

    #[test]
    fn netlink_delete_enoent_is_ignorable() {
        let err = Error::from_kernel(-libc::ENOENT, "class del");
        assert!(err.is_not_found());
        assert_eq!(err.errno, libc::ENOENT);
    }
}
