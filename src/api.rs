//! Entry points that accept absent arguments.
//!
//! These mirror the [`Timer`] methods for callers that hold optional
//! references, reporting a missing reactor, timer or callback as a distinct
//! error before anything else happens.

use std::pin::Pin;

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::timer::{Timer, TimerHandler};

pub fn create<'r, D: Clone>(
    reactor: Option<&'r dyn Reactor>,
    timer: Option<Pin<&Timer<'r, D>>>,
    callback: Option<TimerHandler<'r, D>>,
    data: D,
) -> Result<()> {
    let reactor = reactor.ok_or(Error::NullReactor)?;
    let timer = timer.ok_or(Error::NullTimer)?;
    let callback = callback.ok_or(Error::NullCallback)?;
    timer.create(reactor, callback, data)
}

pub fn start<D>(timer: Option<&Timer<'_, D>>, msec: i32) -> Result<()> {
    timer.ok_or(Error::NullTimer)?.start(msec)
}

pub fn stop<D>(timer: Option<&Timer<'_, D>>) -> Result<()> {
    timer.ok_or(Error::NullTimer)?.stop()
}

pub fn destroy<D>(timer: Option<&Timer<'_, D>>) -> Result<()> {
    timer.ok_or(Error::NullTimer)?.destroy()
}
