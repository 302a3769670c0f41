//! Thin wrappers over the Linux `timerfd` calls.
//!
//! The handle is kept as a bare [`RawFd`] rather than an `OwnedFd` because
//! closing it is a reported operation: a failed `close` must reach the caller
//! instead of being swallowed by a destructor.
//!
//! See [timerfd_create(2)](https://man7.org/linux/man-pages/man2/timerfd_create.2.html).

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, TimerFlags};
use nix::unistd;

/// Size of the expiration counter delivered by a timerfd read.
const COUNTER_SIZE: usize = std::mem::size_of::<u64>();

#[cfg(test)]
thread_local! {
    static OPEN_HANDLES: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
}

/// Number of handles opened by this thread and not yet closed.
#[cfg(test)]
pub(crate) fn open_handles() -> isize {
    OPEN_HANDLES.with(|count| count.get())
}

#[cfg(test)]
fn account(delta: isize) {
    OPEN_HANDLES.with(|count| count.set(count.get() + delta));
}

/// Outcome of draining the expiration counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expirations {
    /// The timer expired this many times since the last read.
    Elapsed(u64),
    /// Nothing has expired yet.
    WouldBlock,
    /// The kernel returned fewer bytes than the counter holds.
    Short(usize),
}

/// Create a monotonic, non-blocking, close-on-exec timer. It starts disarmed.
pub(crate) fn create() -> nix::Result<RawFd> {
    let flags = TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC;
    let fd = Errno::result(unsafe {
        libc::timerfd_create(ClockId::CLOCK_MONOTONIC as libc::c_int, flags.bits())
    })?;
    #[cfg(test)]
    {
        account(1);
    }
    Ok(fd)
}

/// Arm `fd` as a periodic timer whose first expiration is one full period
/// away. A zero period disarms it.
pub(crate) fn set_interval(fd: RawFd, period: Duration) -> nix::Result<()> {
    let period = *TimeSpec::from_duration(period).as_ref();
    let spec = libc::itimerspec {
        it_interval: period,
        it_value: period,
    };
    Errno::result(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })
        .map(drop)
}

/// Current period of `fd`, or `None` when it is disarmed.
pub(crate) fn interval(fd: RawFd) -> nix::Result<Option<Duration>> {
    let mut spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };
    Errno::result(unsafe { libc::timerfd_gettime(fd, &mut spec) })?;

    // A stopped timer has neither a pending expiration nor a period.
    let period = Duration::from(TimeSpec::from(spec.it_interval));
    let pending = Duration::from(TimeSpec::from(spec.it_value));
    if period.is_zero() && pending.is_zero() {
        Ok(None)
    } else {
        Ok(Some(period))
    }
}

/// Read the number of expirations since the previous read.
pub(crate) fn read_expirations(fd: RawFd) -> nix::Result<Expirations> {
    let mut buf = [0u8; COUNTER_SIZE];
    // SAFETY: callers pass a handle they still own.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match unistd::read(borrowed, &mut buf) {
        Ok(COUNTER_SIZE) => Ok(Expirations::Elapsed(u64::from_ne_bytes(buf))),
        Ok(n) => Ok(Expirations::Short(n)),
        Err(Errno::EAGAIN) => Ok(Expirations::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Close `fd`, reporting failure.
pub(crate) fn close(fd: RawFd) -> nix::Result<()> {
    let res = unistd::close(fd);
    #[cfg(test)]
    {
        if res.is_ok() {
            account(-1);
        }
    }
    res
}
