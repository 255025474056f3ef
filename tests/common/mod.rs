//! Shared plumbing for the scenario tests.
#![allow(dead_code)]

use std::time::{Duration, Instant};

/// Polls `cond` for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Collects every event currently sitting on a bus subscription.
pub fn drain_events(rx: &flume::Receiver<switchboard::BusEvent>) -> Vec<switchboard::BusEvent> {
    rx.try_iter().collect()
}
