//! Readiness multiplexing for registered event descriptors.
//!
//! [`Reactor`] is the narrow interface timers are written against.
//! [`EventMachine`] implements it on top of a level-triggered `epoll`
//! instance and drives the wait/dispatch cycle on the calling thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};

use crate::descriptor::EventDescriptor;

/// Default number of readiness events collected per wait cycle.
pub const DEFAULT_MAX_EVENTS: usize = 32;

/// The registration side of a reactor.
///
/// Implementations dispatch a descriptor's handler from their wait cycle when
/// its handle is ready, passing the descriptor's `data` back unchanged. Once
/// [`unregister`](Reactor::unregister) returns for a handle, successfully or
/// not, the reactor must never dispatch to that descriptor again, nor deliver
/// readiness raised for it to a later registration of the same handle.
pub trait Reactor {
    /// Add `descriptor` to the readiness set.
    fn register(&self, descriptor: EventDescriptor) -> nix::Result<()>;

    /// Remove the descriptor registered for `fd` and return it.
    fn unregister(&self, fd: RawFd) -> nix::Result<EventDescriptor>;

    /// The descriptor currently registered for `fd`, if any.
    fn descriptor(&self, fd: RawFd) -> Option<EventDescriptor>;
}

/// A registered descriptor and the token its epoll events carry.
#[derive(Debug, Clone, Copy)]
struct Registration {
    token: u64,
    descriptor: EventDescriptor,
}

/// Pack a registration generation and a handle into an epoll token. The
/// generation tells apart two registrations that reuse one handle number
/// within a single wait cycle.
fn token(generation: u32, fd: RawFd) -> u64 {
    (u64::from(generation) << 32) | u64::from(fd as u32)
}

fn token_fd(token: u64) -> RawFd {
    token as u32 as RawFd
}

/// Single-threaded epoll reactor.
pub struct EventMachine {
    epoll: Epoll,
    registrations: RefCell<HashMap<RawFd, Registration>>,
    generation: Cell<u32>,
    // Reused across wait cycles; taken out while handlers run.
    events: RefCell<Vec<EpollEvent>>,
    max_events: usize,
}

impl EventMachine {
    pub fn new() -> nix::Result<Self> {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Create a reactor that collects at most `max_events` ready descriptors
    /// per wait cycle. Remaining ready descriptors are picked up by the next
    /// cycle since readiness is level-triggered.
    pub fn with_capacity(max_events: usize) -> nix::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let max_events = max_events.max(1);
        Ok(Self {
            epoll,
            registrations: RefCell::new(HashMap::new()),
            generation: Cell::new(0),
            events: RefCell::new(vec![EpollEvent::empty(); max_events]),
            max_events,
        })
    }

    pub fn len(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.borrow().is_empty()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.borrow().contains_key(&fd)
    }

    /// Wait for readiness once and dispatch every ready descriptor.
    ///
    /// `None` waits indefinitely. Returns the number of handlers invoked; an
    /// interrupted wait dispatches nothing and returns zero. An event is only
    /// delivered to the registration it was raised for: a descriptor removed
    /// earlier in the same cycle is skipped, even when a new descriptor has
    /// since been registered under the same handle number.
    pub fn run_once(&self, timeout: Option<Duration>) -> nix::Result<usize> {
        let timeout = match timeout {
            Some(t) => EpollTimeout::try_from(t).unwrap_or(EpollTimeout::MAX),
            None => EpollTimeout::NONE,
        };

        // A nested run_once from a handler finds the buffer empty and
        // allocates its own.
        let mut events = self.events.take();
        events.resize(self.max_events, EpollEvent::empty());

        let ready = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                self.events.replace(events);
                return Err(e);
            }
        };
        let dispatched = self.dispatch(&events[..ready]);
        self.events.replace(events);
        Ok(dispatched)
    }

    fn dispatch(&self, events: &[EpollEvent]) -> usize {
        let mut dispatched = 0;
        for event in events {
            let fd = token_fd(event.data());

            // The table borrow must end before the handler runs: handlers may
            // register or unregister descriptors.
            let registration = self.registrations.borrow().get(&fd).copied();
            let Some(registration) = registration.filter(|r| r.token == event.data()) else {
                trace!("skipping fd {} removed earlier in this cycle", fd);
                continue;
            };
            let descriptor = registration.descriptor;
            let Some(handler) = descriptor.handler else {
                continue;
            };

            trace!("dispatching fd {} ({:?})", fd, event.events());
            // SAFETY: the descriptor is still registered, and registrants keep
            // `data` valid for as long as they are registered.
            unsafe { handler(self, event.events(), fd, descriptor.data) };
            dispatched += 1;
        }
        dispatched
    }

    /// Run wait cycles until `duration` has elapsed. Returns the total number
    /// of handlers invoked.
    pub fn run_for(&self, duration: Duration) -> nix::Result<usize> {
        let deadline = Instant::now() + duration;
        let mut dispatched = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(dispatched);
            }
            dispatched += self.run_once(Some(deadline - now))?;
        }
    }
}

impl Reactor for EventMachine {
    fn register(&self, descriptor: EventDescriptor) -> nix::Result<()> {
        if !descriptor.is_valid() {
            return Err(Errno::EINVAL);
        }
        if self.is_registered(descriptor.fd) {
            return Err(Errno::EEXIST);
        }

        // SAFETY: the registrant owns the handle and keeps it open while
        // registered.
        let fd = unsafe { BorrowedFd::borrow_raw(descriptor.fd) };
        let generation = self.generation.get().wrapping_add(1);
        let token = token(generation, descriptor.fd);
        self.epoll.add(fd, EpollEvent::new(descriptor.interest, token))?;
        self.generation.set(generation);
        self.registrations
            .borrow_mut()
            .insert(descriptor.fd, Registration { token, descriptor });

        debug!("registered fd {} ({:?})", descriptor.fd, descriptor.interest);
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> nix::Result<EventDescriptor> {
        // Forget the descriptor before touching epoll so a failed removal
        // cannot leave a dispatchable entry behind.
        let Registration { descriptor, .. } = self
            .registrations
            .borrow_mut()
            .remove(&fd)
            .ok_or(Errno::ENOENT)?;

        // SAFETY: the handle was valid when registered and the registrant
        // closes it only after unregistering.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)?;

        debug!("unregistered fd {}", fd);
        Ok(descriptor)
    }

    fn descriptor(&self, fd: RawFd) -> Option<EventDescriptor> {
        self.registrations.borrow().get(&fd).map(|r| r.descriptor)
    }
}

impl std::fmt::Debug for EventMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMachine")
            .field("epoll", &self.epoll)
            .field("registered", &self.len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::INVALID_FD;
    use nix::sys::epoll::EpollFlags;
    use std::cell::Cell;
    use std::ffi::c_void;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

    /// Counts dispatches into the `Cell<usize>` behind `data`, draining one
    /// byte so the pipe becomes quiet again.
    unsafe fn count_and_drain(_: &dyn Reactor, _: EpollFlags, fd: RawFd, data: *mut c_void) {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(fd, byte.as_mut_ptr().cast(), 1);
            let count = &*(data as *const Cell<usize>);
            count.set(count.get() + 1);
        }
    }

    /// Unregisters whatever descriptor is recorded in the `Cell<RawFd>`
    /// behind `data`.
    unsafe fn unregister_other(
        reactor: &dyn Reactor,
        _: EpollFlags,
        fd: RawFd,
        data: *mut c_void,
    ) {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(fd, byte.as_mut_ptr().cast(), 1);
            let other = &*(data as *const Cell<RawFd>);
            let _ = reactor.unregister(other.get());
        }
    }

    struct Swap {
        fd: RawFd,
        fresh: Cell<usize>,
    }

    /// Replaces the registration for the handle in the `Swap` behind `data`
    /// with one that counts into `Swap::fresh`.
    unsafe fn swap_registration(
        reactor: &dyn Reactor,
        _: EpollFlags,
        fd: RawFd,
        data: *mut c_void,
    ) {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(fd, byte.as_mut_ptr().cast(), 1);
            let swap = &*(data as *const Swap);
            reactor.unregister(swap.fd).unwrap();
            let fresh = &swap.fresh as *const Cell<usize> as *mut c_void;
            reactor.register(descriptor(swap.fd, count_and_drain, fresh)).unwrap();
        }
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(res, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd) {
        let n = unsafe { libc::write(fd.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    }

    fn descriptor(
        fd: RawFd,
        handler: crate::descriptor::DispatchHandler,
        data: *mut c_void,
    ) -> EventDescriptor {
        EventDescriptor {
            fd,
            interest: EpollFlags::EPOLLIN,
            data,
            handler: Some(handler),
        }
    }

    #[test]
    fn test_register_rejects_invalid_descriptor() {
        let em = EventMachine::new().unwrap();
        assert_eq!(em.register(EventDescriptor::invalid()), Err(Errno::EINVAL));

        let mut d = descriptor(INVALID_FD, count_and_drain, std::ptr::null_mut());
        assert_eq!(em.register(d), Err(Errno::EINVAL));

        d.fd = 0;
        d.handler = None;
        assert_eq!(em.register(d), Err(Errno::EINVAL));
        assert!(em.is_empty());
    }

    #[test]
    fn test_register_and_unregister() {
        let em = EventMachine::new().unwrap();
        let (rx, _tx) = pipe();
        let count = Cell::new(0usize);
        let data = &count as *const Cell<usize> as *mut c_void;

        em.register(descriptor(rx.as_raw_fd(), count_and_drain, data)).unwrap();
        assert!(em.is_registered(rx.as_raw_fd()));
        assert_eq!(
            em.register(descriptor(rx.as_raw_fd(), count_and_drain, data)),
            Err(Errno::EEXIST)
        );

        let removed = em.unregister(rx.as_raw_fd()).unwrap();
        assert_eq!(removed.fd, rx.as_raw_fd());
        assert_eq!(removed.data, data);
        assert!(em.descriptor(rx.as_raw_fd()).is_none());
        assert_eq!(em.unregister(rx.as_raw_fd()).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn test_run_once_dispatches_ready_descriptor() {
        let em = EventMachine::new().unwrap();
        let (rx, tx) = pipe();
        let count = Cell::new(0usize);
        let data = &count as *const Cell<usize> as *mut c_void;
        em.register(descriptor(rx.as_raw_fd(), count_and_drain, data)).unwrap();

        assert_eq!(em.run_once(Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(count.get(), 0);

        write_byte(&tx);
        assert_eq!(em.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(count.get(), 1);

        em.unregister(rx.as_raw_fd()).unwrap();
    }

    #[test]
    /// Test that readiness persists until drained (level-triggered).
    fn test_level_triggered_redelivery() {
        let em = EventMachine::new().unwrap();
        let (rx, tx) = pipe();
        let count = Cell::new(0usize);
        let data = &count as *const Cell<usize> as *mut c_void;
        em.register(descriptor(rx.as_raw_fd(), count_and_drain, data)).unwrap();

        // Each dispatch drains only one of the two bytes.
        write_byte(&tx);
        write_byte(&tx);
        em.run_once(Some(Duration::from_millis(100))).unwrap();
        em.run_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(em.run_once(Some(Duration::ZERO)).unwrap(), 0);

        em.unregister(rx.as_raw_fd()).unwrap();
    }

    #[test]
    /// Test that a descriptor removed by an earlier handler in the same cycle
    /// is not dispatched.
    fn test_handler_can_unregister_other_descriptor() {
        let em = EventMachine::new().unwrap();
        let (rx_a, tx_a) = pipe();
        let (rx_b, tx_b) = pipe();

        let victims = [Cell::new(rx_b.as_raw_fd()), Cell::new(rx_a.as_raw_fd())];

        em.register(descriptor(
            rx_a.as_raw_fd(),
            unregister_other,
            &victims[0] as *const Cell<RawFd> as *mut c_void,
        ))
        .unwrap();
        em.register(descriptor(
            rx_b.as_raw_fd(),
            unregister_other,
            &victims[1] as *const Cell<RawFd> as *mut c_void,
        ))
        .unwrap();

        write_byte(&tx_a);
        write_byte(&tx_b);
        assert_eq!(em.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(em.len(), 1);

        // Whichever one ran first is still registered; clean it up.
        let survivor = if em.is_registered(rx_a.as_raw_fd()) {
            rx_a.as_raw_fd()
        } else {
            rx_b.as_raw_fd()
        };
        em.unregister(survivor).unwrap();
    }

    #[test]
    /// Test that readiness raised before a handle was re-registered is not
    /// delivered to the new registration.
    fn test_stale_event_skips_new_registration() {
        let em = EventMachine::new().unwrap();
        let (rx_a, tx_a) = pipe();
        let (rx_b, tx_b) = pipe();
        let old = Cell::new(0usize);
        let swap = Swap {
            fd: rx_b.as_raw_fd(),
            fresh: Cell::new(0),
        };

        em.register(descriptor(
            rx_a.as_raw_fd(),
            swap_registration,
            &swap as *const Swap as *mut c_void,
        ))
        .unwrap();
        em.register(descriptor(
            rx_b.as_raw_fd(),
            count_and_drain,
            &old as *const Cell<usize> as *mut c_void,
        ))
        .unwrap();

        // epoll reports readiness in the order it was raised.
        write_byte(&tx_a);
        write_byte(&tx_b);
        assert_eq!(em.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(old.get(), 0);
        assert_eq!(swap.fresh.get(), 0);

        // The byte is still pending, so the new registration sees it next cycle.
        assert_eq!(em.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(swap.fresh.get(), 1);
        assert_eq!(old.get(), 0);

        em.unregister(rx_a.as_raw_fd()).unwrap();
        em.unregister(rx_b.as_raw_fd()).unwrap();
    }

    #[test]
    /// Test that the event buffer is handed back after every cycle.
    fn test_event_buffer_is_reused() {
        let em = EventMachine::with_capacity(1).unwrap();
        let (rx, tx) = pipe();
        let count = Cell::new(0usize);
        let data = &count as *const Cell<usize> as *mut c_void;
        em.register(descriptor(rx.as_raw_fd(), count_and_drain, data)).unwrap();

        for expected in 1..=3 {
            write_byte(&tx);
            assert_eq!(em.run_once(Some(Duration::from_millis(100))).unwrap(), 1);
            assert_eq!(count.get(), expected);
        }

        em.unregister(rx.as_raw_fd()).unwrap();
        assert_eq!(em.events.borrow().len(), 1);
    }

    #[test]
    fn test_run_for_waits_out_the_duration() {
        let em = EventMachine::new().unwrap();
        let start = Instant::now();
        assert_eq!(em.run_for(Duration::from_millis(30)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
