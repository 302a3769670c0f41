//! Error and status types shared by the timer and the reactor.

use nix::errno::Errno;

/// Closed set of outcomes reported by the timer operations.
///
/// Callers branch on this enumeration rather than on raw OS error numbers.
/// The numeric codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    NullReactor = 1,
    NullTimer = 2,
    NullCallback = 3,
    InvalidHandle = 4,
    RegisterFailed = 5,
    ArmFailed = 6,
    UnregisterFailed = 7,
    CloseFailed = 8,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<&Result<()>> for Status {
    fn from(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

impl From<Result<()>> for Status {
    fn from(result: Result<()>) -> Self {
        Status::from(&result)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::NullReactor => "null reactor",
            Status::NullTimer => "null timer",
            Status::NullCallback => "null callback",
            Status::InvalidHandle => "invalid handle",
            Status::RegisterFailed => "register failed",
            Status::ArmFailed => "arm failed",
            Status::UnregisterFailed => "unregister failed",
            Status::CloseFailed => "close failed",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Errors returned by [`Timer`](crate::Timer) operations.
///
/// Variants backed by a failed system call keep the original [`Errno`] so it
/// can be inspected for diagnostics; when a cleanup step fails after another
/// error was already captured, the first error is the one returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("reactor reference is null")]
    NullReactor,
    #[error("timer reference is null")]
    NullTimer,
    #[error("timer callback is null")]
    NullCallback,
    #[error("timer is not created")]
    InvalidHandle,
    #[error("timer is already created")]
    AlreadyCreated,
    #[error("failed to allocate timer handle: {0}")]
    Allocate(#[source] Errno),
    #[error("failed to register timer with reactor: {0}")]
    Register(#[source] Errno),
    #[error("failed to set timer interval: {0}")]
    Arm(#[source] Errno),
    #[error("failed to read timer interval: {0}")]
    Interval(#[source] Errno),
    #[error("failed to unregister timer from reactor: {0}")]
    Unregister(#[source] Errno),
    #[error("failed to close timer handle: {0}")]
    Close(#[source] Errno),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::NullReactor => Status::NullReactor,
            Error::NullTimer => Status::NullTimer,
            Error::NullCallback => Status::NullCallback,
            Error::InvalidHandle | Error::AlreadyCreated | Error::Allocate(_) => {
                Status::InvalidHandle
            }
            Error::Register(_) => Status::RegisterFailed,
            Error::Arm(_) | Error::Interval(_) => Status::ArmFailed,
            Error::Unregister(_) => Status::UnregisterFailed,
            Error::Close(_) => Status::CloseFailed,
        }
    }

    /// The OS error behind this failure, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Allocate(e)
            | Error::Register(e)
            | Error::Arm(e)
            | Error::Interval(e)
            | Error::Unregister(e)
            | Error::Close(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
