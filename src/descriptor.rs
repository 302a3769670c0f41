//! Registration record shared between a reactor and the objects it serves.

use std::ffi::c_void;
use std::os::unix::io::RawFd;

use nix::sys::epoll::EpollFlags;

use crate::reactor::Reactor;

/// Sentinel stored in place of a file descriptor that is not open.
pub const INVALID_FD: RawFd = -1;

/// Handler invoked by a reactor when a registered descriptor becomes ready.
///
/// `data` is the descriptor's context pointer, passed back unchanged.
///
/// # Safety
///
/// The reactor may only call the handler while the descriptor it came from is
/// registered. The registrant guarantees that `data` stays valid for that
/// whole period.
pub type DispatchHandler =
    unsafe fn(reactor: &dyn Reactor, events: EpollFlags, fd: RawFd, data: *mut c_void);

/// A readiness registration: which handle to watch, for what, and who to call.
#[derive(Debug, Clone, Copy)]
pub struct EventDescriptor {
    pub fd: RawFd,
    pub interest: EpollFlags,
    pub data: *mut c_void,
    pub handler: Option<DispatchHandler>,
}

impl EventDescriptor {
    /// The wiped shape: no handle, no interest, no context, no handler.
    pub const fn invalid() -> Self {
        Self {
            fd: INVALID_FD,
            interest: EpollFlags::empty(),
            data: std::ptr::null_mut(),
            handler: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0 && self.handler.is_some()
    }
}

impl Default for EventDescriptor {
    fn default() -> Self {
        Self::invalid()
    }
}
