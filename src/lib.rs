//! Periodic timers for a single-threaded epoll event loop.
//!
//! A [`Timer`] wraps a Linux `timerfd` and registers it with a [`Reactor`] so
//! that timer expirations are dispatched by the same wait cycle that serves
//! every other descriptor. [`EventMachine`] is the bundled epoll reactor.
//!
//! ```no_run
//! use std::pin::pin;
//! use std::time::Duration;
//! use event_timer::{EventMachine, Timer};
//!
//! fn tick(_timer: &Timer<'_, &str>, name: &str) {
//!     println!("{} ticked", name);
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let em = EventMachine::new()?;
//! let timer = pin!(Timer::new());
//! timer.as_ref().create(&em, tick, "heartbeat")?;
//! timer.start(50)?;
//! em.run_for(Duration::from_millis(500))?;
//! timer.destroy()?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("event-timer requires timerfd and epoll, which are only available on Linux");

pub mod api;
pub mod descriptor;
pub mod error;
pub mod reactor;
pub mod timer;
mod timerfd;

pub use descriptor::{DispatchHandler, EventDescriptor, INVALID_FD};
pub use error::{Error, Result, Status};
pub use reactor::{EventMachine, Reactor};
pub use timer::{Timer, TimerHandler};
