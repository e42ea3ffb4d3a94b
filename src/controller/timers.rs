//! Poll and settle timers owned by the controller
//!
//! Every timer task hangs off the current [`CancellationToken`]. Cancelling
//! bumps the generation and swaps in a fresh token, so one call stops the
//! recurring poll and every pending settle poll together. Each poll
//! generation also gets its own tick slot, so a tick left over from before a
//! cancel can never crowd out the first tick of the next generation. Events
//! carry the generation they were scheduled under and the controller drops
//! stale ones.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Settle polls wait in here; poll ticks never queue
const SETTLE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    PollTick { generation: u64 },
    SettlePoll { device_id: String, generation: u64 },
}

impl TimerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TimerEvent::PollTick { generation } | TimerEvent::SettlePoll { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug)]
pub struct TimerSet {
    /// Single-slot channel of the current poll generation: a tick that finds
    /// the controller busy is dropped
    ticks: mpsc::Receiver<TimerEvent>,
    settle_tx: mpsc::Sender<TimerEvent>,
    settles: mpsc::Receiver<TimerEvent>,
    generation: u64,
    cancel: CancellationToken,
}

impl TimerSet {
    pub fn new() -> Self {
        let (settle_tx, settles) = mpsc::channel(SETTLE_CAPACITY);
        Self {
            ticks: idle_ticks(),
            settle_tx,
            settles,
            generation: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Next poll tick or settle poll. Pending while no timer is armed.
    pub async fn recv(&mut self) -> Option<TimerEvent> {
        tokio::select! {
            Some(event) = self.ticks.recv() => Some(event),
            Some(event) = self.settles.recv() => Some(event),
            else => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, event: &TimerEvent) -> bool {
        event.generation() == self.generation
    }

    /// Cancels everything and starts a new recurring poll. The first tick
    /// fires immediately.
    pub fn restart_poll(&mut self, interval: Duration) {
        self.cancel_all();
        let generation = self.generation;
        let cancel = self.cancel.clone();
        let (ticks, tick_rx) = mpsc::channel(1);
        self.ticks = tick_rx;

        debug!(generation, ?interval, "Starting poll timer");
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match ticks.try_send(TimerEvent::PollTick { generation }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!(generation, "Previous poll still running, skipping tick")
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            trace!(generation, "Poll timer stopped");
        });
    }

    /// One-off poll of a single device after `delay`
    pub fn schedule_settle(&self, device_id: &str, delay: Duration) {
        let event = TimerEvent::SettlePoll {
            device_id: device_id.to_string(),
            generation: self.generation,
        };
        let cancel = self.cancel.clone();
        let settles = self.settle_tx.clone();

        debug!(device = device_id, ?delay, "Scheduling settle poll");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = time::sleep(delay) => {
                    let _ = settles.send(event).await;
                }
            }
        });
    }

    /// Stops every timer and discards any tick still waiting to be received
    pub fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.ticks = idle_ticks();
        self.generation += 1;
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Tick slot with no timer behind it
fn idle_ticks() -> mpsc::Receiver<TimerEvent> {
    mpsc::channel(1).1
}
