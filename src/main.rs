//! Event Timer Demo
//!
//! Runs an epoll event machine with a single periodic timer and prints one
//! JSON record per tick to stdout until stopped.

use clap::Parser;
use event_timer::{EventMachine, Timer};
use log::{debug, info, warn};
use nix::unistd::{Pid, getppid};
use serde::Serialize;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use std::cell::Cell;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a single wait cycle may block before the shutdown flags are checked.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// Define command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tick interval in milliseconds
    #[arg(short, long, env = "EVENT_TIMER_INTERVAL", default_value_t = 1000)]
    interval: i32,

    /// Stop after this many ticks. 0 runs until a signal is received.
    #[arg(short, long, env = "EVENT_TIMER_COUNT", default_value_t = 0)]
    count: u64,

    /// Parent process ID. The program will exit if the parent process is no longer alive.
    #[arg(short, long, default_value_t = 0)]
    ppid: i32,
}

/// State shared between the main loop and the timer callback.
#[derive(Default)]
struct TickState {
    ticks: Cell<u64>,
    limit: u64,
}

impl TickState {
    fn done(&self) -> bool {
        self.limit > 0 && self.ticks.get() >= self.limit
    }
}

/// A single line of output.
#[derive(Serialize)]
struct TickRecord {
    tick: u64,
    #[serde(rename = "_timestamp")]
    timestamp: f64,
}

fn on_tick(timer: &Timer<'_, &TickState>, state: &TickState) {
    let tick = state.ticks.get() + 1;
    state.ticks.set(tick);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    match serde_json::to_string(&TickRecord { tick, timestamp }) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize tick {}: {}", tick, e),
    }

    if state.done() {
        debug!("Reached {} ticks, stopping timer", tick);
        if let Err(e) = timer.stop() {
            warn!("Failed to stop timer: {}", e);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command-line arguments
    let args = Args::parse();

    // Set up a flag to control the main loop
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up signal handler for graceful shutdown
    let mut signals = Signals::new(TERM_SIGNALS)?;
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            r.store(false, Ordering::Relaxed);
        }
    });

    let state = TickState {
        limit: args.count,
        ..Default::default()
    };

    let em = EventMachine::new()?;
    let timer = pin!(Timer::new());
    timer.as_ref().create(&em, on_tick, &state)?;
    timer.start(args.interval)?;
    info!("Ticking every {} ms", args.interval);

    // Main loop. Will run until the tick limit is reached, the parent process
    // is no longer alive or a signal is received.
    while running.load(Ordering::Relaxed) && !state.done() {
        em.run_once(Some(POLL_TIMEOUT))?;

        if args.ppid != 0 && getppid() != Pid::from_raw(args.ppid) {
            info!("Parent process {} exited", args.ppid);
            break;
        }
    }

    timer.destroy()?;
    info!("Stopped after {} ticks", state.ticks.get());

    Ok(())
}
