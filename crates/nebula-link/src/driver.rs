//! Dedicated loop thread that ticks a session's transports.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::transport::Transport;

/// Upper bound on drain passes after the loop exits.
const MAX_DRAIN_PASSES: usize = 16;

/// Handle to a running driver thread.
pub struct DriverHandle {
    label: String,
    keep_alive: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DriverHandle {
    /// Whether the loop has finished its shutdown work.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether the caller is running on the loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Clear the keep-alive flag and wait for the thread to finish.
    ///
    /// From the loop thread itself (a listener callback) this only clears the
    /// flag; the loop exits after the current tick.
    pub fn stop(&self) {
        self.keep_alive.store(false, Ordering::Release);
        if self.is_loop_thread() {
            debug!("[{}] Stop requested from loop thread", self.label);
            return;
        }
        let Some(join) = self.join.lock().take() else {
            return;
        };
        if join.join().is_err() {
            error!("[{}] Loop thread panicked during shutdown", self.label);
        }
    }
}

/// Spawn the loop thread for `transports`.
///
/// Each iteration ticks every transport in order and then sleeps for
/// `delay`, or yields when `delay` is zero. The loop runs while `keep_alive`
/// holds; afterwards pending disconnections are drained and every transport
/// is cleaned up.
pub fn spawn(
    label: &str,
    mut transports: Vec<Box<dyn Transport>>,
    delay: Duration,
    keep_alive: Arc<AtomicBool>,
) -> io::Result<DriverHandle> {
    let stopped = Arc::new(AtomicBool::new(false));
    let thread_label = label.to_string();
    let flag = keep_alive.clone();
    let done = stopped.clone();

    let join = thread::Builder::new()
        .name(format!("{label}-driver"))
        .spawn(move || {
            info!("[{thread_label}] Loop started");
            while flag.load(Ordering::Acquire) {
                for transport in transports.iter_mut() {
                    let ticked = catch_unwind(AssertUnwindSafe(|| transport.tick()));
                    if ticked.is_err() {
                        error!("[{}] Tick panicked, continuing", transport.core().label());
                    }
                }
                if delay.is_zero() {
                    thread::yield_now();
                } else {
                    thread::sleep(delay);
                }
            }
            shut_down(&thread_label, &mut transports);
            done.store(true, Ordering::Release);
        })?;

    Ok(DriverHandle {
        label: label.to_string(),
        keep_alive,
        stopped,
        thread_id: join.thread().id(),
        join: Mutex::new(Some(join)),
    })
}

/// Drain pending disconnections and close every transport.
///
/// Releasing one leg may enqueue the other, so passes repeat until nothing
/// is left to remove.
pub(crate) fn shut_down(label: &str, transports: &mut [Box<dyn Transport>]) {
    for _ in 0..MAX_DRAIN_PASSES {
        let removed: usize = transports
            .iter_mut()
            .map(|transport| transport.drain_disconnections())
            .sum();
        if removed == 0 {
            break;
        }
    }
    for transport in transports.iter_mut() {
        transport.cleanup();
    }
    info!("[{label}] Loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::datagram::{DatagramTransport, MAX_DATAGRAM};
    use crate::transport::TransportOptions;

    fn transport() -> Box<dyn Transport> {
        Box::new(
            DatagramTransport::bind(
                &TransportOptions::new("Test"),
                "127.0.0.1:0".parse().unwrap(),
                MAX_DATAGRAM,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_stop_joins_thread() {
        let keep_alive = Arc::new(AtomicBool::new(true));
        let handle = spawn("Test", vec![transport()], Duration::from_millis(1), keep_alive.clone()).unwrap();
        assert!(!handle.is_stopped());
        assert!(!handle.is_loop_thread());

        handle.stop();
        assert!(handle.is_stopped());
        assert!(!keep_alive.load(Ordering::Acquire));
        // A second stop is harmless.
        handle.stop();
    }

    #[test]
    fn test_clearing_flag_ends_loop() {
        let keep_alive = Arc::new(AtomicBool::new(true));
        let handle = spawn("Test", vec![transport()], Duration::ZERO, keep_alive.clone()).unwrap();
        keep_alive.store(false, Ordering::Release);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_stopped() {
            assert!(Instant::now() < deadline, "loop did not stop");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
