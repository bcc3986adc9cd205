//! Cancellable periodic ticks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Inbox, SessionInput};

/// Which timer a tick belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// Pre-round countdown, one tick per second.
    Countdown,
    /// In-round clock.
    Clock,
}

/// A periodic tick source feeding a controller inbox. Dropping it stops the ticks.
#[derive(Debug)]
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Start ticking every `period`, first tick one period from now.
    pub fn spawn(period: Duration, epoch: u64, kind: TickKind, inbox: Inbox) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let at = interval.tick().await;
                if inbox.send(SessionInput::Tick { epoch, kind, at }).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
