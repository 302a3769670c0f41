//! Periodic timers driven by a [`Reactor`].
//!
//! A [`Timer`] owns a kernel `timerfd` and registers it with a reactor through
//! an embedded [`EventDescriptor`] whose context pointer refers back to the
//! timer. When the handle becomes readable the reactor calls the timer's
//! dispatch handler, which drains the expiration counter and invokes the user
//! callback once per elapsed interval.
//!
//! # Lifecycle
//!
//! ```text
//! Timer::new() --create--> created, disarmed --start--> created, armed
//!       ^                        ^    |                     |
//!       |                        +----+------- stop --------+
//!       +------------------------ destroy ------------------+
//! ```
//!
//! The timer must be pinned before [`create`](Timer::create) because the
//! reactor keeps its address. Dropping a created timer destroys it.
//!
//! # Re-entrancy
//!
//! The callback receives the timer and may stop, re-arm or destroy it. When it
//! does, any expirations still pending from the same read are discarded: before
//! each invocation the dispatch handler confirms through the reactor that the
//! timer is still registered, and that it has not been re-armed or stopped since
//! the counter was read.

use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomPinned;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::time::Duration;

use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;

use crate::descriptor::{EventDescriptor, INVALID_FD};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::timerfd::{self, Expirations};

/// User callback, invoked once per elapsed interval with the timer and a
/// clone of its stored data.
pub type TimerHandler<'r, D> = fn(timer: &Timer<'r, D>, data: D);

/// A periodic timer registered with a reactor.
///
/// `D` is the user data handed to every callback invocation. Pointer-like
/// types (`Rc<_>`, `&T`) make every invocation observe the same value.
pub struct Timer<'r, D = ()> {
    reactor: Cell<Option<&'r dyn Reactor>>,
    descriptor: Cell<EventDescriptor>,
    callback: Cell<Option<TimerHandler<'r, D>>>,
    data: Cell<Option<D>>,
    // Bumped on every arm, disarm and wipe; never reset.
    epoch: Cell<u64>,
    _pinned: PhantomPinned,
}

impl<'r, D> Timer<'r, D> {
    /// A wiped timer record, ready for [`create`](Timer::create).
    pub const fn new() -> Self {
        Self {
            reactor: Cell::new(None),
            descriptor: Cell::new(EventDescriptor::invalid()),
            callback: Cell::new(None),
            data: Cell::new(None),
            epoch: Cell::new(0),
            _pinned: PhantomPinned,
        }
    }

    /// Whether the timer holds a kernel handle, i.e. it was created and not
    /// yet destroyed.
    pub fn is_created(&self) -> bool {
        self.descriptor.get().fd != INVALID_FD
    }

    /// The kernel handle, or [`INVALID_FD`] when the timer is not created.
    pub fn fd(&self) -> RawFd {
        self.descriptor.get().fd
    }

    /// Arm the timer to fire every `msec` milliseconds, the first time one
    /// period from now. Replaces any previous interval. Zero disarms the timer,
    /// as the kernel treats a zero expiration.
    pub fn start(&self, msec: i32) -> Result<()> {
        let fd = self.live_fd()?;
        let Ok(msec) = u64::try_from(msec) else {
            return Err(Error::Arm(Errno::EINVAL));
        };
        self.arm(fd, Duration::from_millis(msec))
    }

    /// Like [`start`](Timer::start), with a `Duration` period.
    pub fn start_interval(&self, period: Duration) -> Result<()> {
        let fd = self.live_fd()?;
        self.arm(fd, period)
    }

    /// Disarm the timer. It stays registered and can be started again.
    /// Stopping a stopped timer is not an error.
    pub fn stop(&self) -> Result<()> {
        let fd = self.live_fd()?;
        timerfd::set_interval(fd, Duration::ZERO).map_err(Error::Arm)?;
        self.bump_epoch();
        debug!("timer fd {} stopped", fd);
        Ok(())
    }

    /// The armed period, or `None` when the timer is stopped.
    pub fn interval(&self) -> Result<Option<Duration>> {
        let fd = self.live_fd()?;
        timerfd::interval(fd).map_err(Error::Interval)
    }

    /// Unregister the timer, close its handle and wipe the record.
    ///
    /// If the reactor refuses the removal the handle is closed anyway and the
    /// unregister error is returned. If closing fails after a successful
    /// removal, the close error is returned. Either way the record keeps its
    /// reactor, callback and data for inspection but no longer holds a handle:
    /// Linux releases the descriptor number even when `close` reports an
    /// error, so it is never closed a second time through this timer.
    pub fn destroy(&self) -> Result<()> {
        let fd = self.live_fd()?;
        let Some(reactor) = self.reactor.get() else {
            return Err(Error::InvalidHandle);
        };

        if let Err(errno) = reactor.unregister(fd) {
            if let Err(close_err) = timerfd::close(fd) {
                warn!(
                    "discarding close error on timer fd {} after failed unregister: {}",
                    fd, close_err
                );
            }
            self.forget_fd();
            return Err(Error::Unregister(errno));
        }

        if let Err(errno) = timerfd::close(fd) {
            self.forget_fd();
            return Err(Error::Close(errno));
        }
        self.wipe();
        debug!("timer fd {} destroyed", fd);
        Ok(())
    }

    fn live_fd(&self) -> Result<RawFd> {
        match self.descriptor.get().fd {
            INVALID_FD => Err(Error::InvalidHandle),
            fd => Ok(fd),
        }
    }

    fn arm(&self, fd: RawFd, period: Duration) -> Result<()> {
        timerfd::set_interval(fd, period).map_err(Error::Arm)?;
        self.bump_epoch();
        debug!("timer fd {} armed every {:?}", fd, period);
        Ok(())
    }

    /// Drop the handle without touching the rest of the record.
    fn forget_fd(&self) {
        let mut descriptor = self.descriptor.get();
        descriptor.fd = INVALID_FD;
        self.descriptor.set(descriptor);
        self.bump_epoch();
    }

    fn bump_epoch(&self) {
        self.epoch.set(self.epoch.get().wrapping_add(1));
    }

    /// Return every field to the never-created shape.
    fn wipe(&self) {
        self.reactor.set(None);
        self.descriptor.set(EventDescriptor::invalid());
        self.callback.set(None);
        self.data.set(None);
        self.bump_epoch();
    }
}

impl<'r, D: Clone> Timer<'r, D> {
    /// Allocate the kernel timer and register it with `reactor`.
    ///
    /// On success the timer is registered but disarmed. On failure nothing
    /// survives: a handle allocated before a registration failure is closed
    /// and the record is wiped, and the reactor's error is returned.
    pub fn create(
        self: Pin<&Self>,
        reactor: &'r dyn Reactor,
        callback: TimerHandler<'r, D>,
        data: D,
    ) -> Result<()> {
        let timer = self.get_ref();
        if timer.is_created() {
            return Err(Error::AlreadyCreated);
        }

        let fd = timerfd::create().map_err(Error::Allocate)?;

        timer.reactor.set(Some(reactor));
        timer.callback.set(Some(callback));
        timer.data.set(Some(data));

        let descriptor = EventDescriptor {
            fd,
            interest: EpollFlags::EPOLLIN,
            data: timer as *const Self as *mut c_void,
            handler: Some(Self::dispatch),
        };
        timer.descriptor.set(descriptor);

        if let Err(errno) = reactor.register(descriptor) {
            if let Err(close_err) = timerfd::close(fd) {
                debug!(
                    "discarding close error on timer fd {} after failed register: {}",
                    fd, close_err
                );
            }
            timer.wipe();
            return Err(Error::Register(errno));
        }

        debug!("timer fd {} created", fd);
        Ok(())
    }

    /// A clone of the stored user data.
    pub fn data(&self) -> Option<D> {
        let data = self.data.take();
        let copy = data.clone();
        self.data.set(data);
        copy
    }

    /// Expiration handler registered with the reactor.
    ///
    /// Only `EAGAIN` is tolerated when reading the counter. A short read or any
    /// other read error aborts the process.
    ///
    /// # Safety
    ///
    /// `data` must be the context pointer of a descriptor registered by
    /// [`create`](Timer::create) for `fd`, and the reactor must still hold
    /// that registration when calling.
    unsafe fn dispatch(reactor: &dyn Reactor, _events: EpollFlags, fd: RawFd, data: *mut c_void) {
        let expirations = match timerfd::read_expirations(fd) {
            Ok(Expirations::Elapsed(n)) => n,
            // Level-triggered: the reactor calls again once the counter is set.
            Ok(Expirations::WouldBlock) => return,
            Ok(Expirations::Short(n)) => {
                error!("timer fd {} returned a {} byte expiration counter", fd, n);
                std::process::abort();
            }
            // A readable timerfd that cannot be read would be reported ready
            // again on every cycle.
            Err(e) => {
                error!("failed to read expiration counter of timer fd {}: {}", fd, e);
                std::process::abort();
            }
        };

        let timer = data as *const Self;
        // SAFETY: the reactor dispatches only registered descriptors, and a
        // registered timer is pinned and alive.
        let epoch = unsafe { (*timer).epoch.get() };
        trace!("timer fd {} expired {} time(s)", fd, expirations);

        for delivered in 0..expirations {
            // Check registration before touching the timer again: a callback
            // that dropped the timer has unregistered it on the way out.
            let registered = reactor.descriptor(fd).is_some_and(|d| d.data == data);
            if !registered {
                debug!(
                    "timer fd {} destroyed by its callback, {} expiration(s) dropped",
                    fd,
                    expirations - delivered
                );
                return;
            }

            // SAFETY: still registered, so still alive.
            let timer = unsafe { &*timer };
            if timer.epoch.get() != epoch {
                debug!(
                    "timer fd {} re-armed by its callback, {} expiration(s) dropped",
                    fd,
                    expirations - delivered
                );
                return;
            }

            let (Some(callback), Some(user_data)) = (timer.callback.get(), timer.data()) else {
                return;
            };
            callback(timer, user_data);
        }
    }
}

impl<'r, D> Default for Timer<'r, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r, D> Drop for Timer<'r, D> {
    fn drop(&mut self) {
        if self.is_created() {
            if let Err(e) = self.destroy() {
                warn!("failed to destroy timer fd {} on drop: {}", self.fd(), e);
            }
        }
    }
}

impl<'r, D> std::fmt::Debug for Timer<'r, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("fd", &self.fd())
            .field("created", &self.is_created())
            .field("epoch", &self.epoch.get())
            .finish()
    }
}
