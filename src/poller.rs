//! Timer-driven refresh fallback for readers.
//!
//! Pub/sub delivery is best-effort; a reader that misses a `New` broadcast
//! would otherwise stay stale forever. The poller walks the registry on a
//! fixed tick and refreshes readers according to their polling posture.

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::daemon::Daemon;
use crate::machine::Polling;

/// Transition for one reader at one tick.
///
/// `delta_secs` is the time since the machine last refreshed. Inside a
/// high-frequency window the countdown just shrinks (the subscription was
/// recently proven live, storage is left alone). An exhausted window
/// refreshes and drops to the slow lane, which refreshes on every tick from
/// then on; a pub/sub event re-arms the window.
pub fn next_polling(polling: Polling, delta_secs: i64) -> (bool, Polling) {
    match polling {
        Polling::HighFreq { remaining } => {
            let remaining = remaining - delta_secs;
            if remaining > 0 {
                (false, Polling::HighFreq { remaining })
            } else {
                (true, Polling::LowFreq)
            }
        }
        Polling::LowFreq => (true, Polling::LowFreq),
    }
}

/// Runs forever; aborted by the daemon on shutdown.
pub async fn run(daemon: Daemon) {
    let mut interval = tokio::time::interval(daemon.config().poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(period = ?daemon.config().poll_interval(), "poller running");
    loop {
        interval.tick().await;
        daemon.poll_readers().await;
    }
}
