//! # Session Timers
//!
//! The three periodic timers a connected session may run: the 1 s run
//! countdown, the keep-alive and the status poll.
//!
//! Each timer is a tokio task that posts `SessionEvent::TimerFired` into the
//! session's ingress channel. Every start hands out a fresh generation, so a
//! tick that was already queued when its timer got cancelled or restarted is
//! recognised as stale and dropped by the session.

use crate::session::SessionEvent;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Countdown,
    KeepAlive,
    StatusPoll,
}

struct ActiveTimer {
    generation: u64,
    period: Duration,
    task: JoinHandle<()>,
}

pub struct Timers {
    sender: UnboundedSender<SessionEvent>,
    next_generation: u64,
    active: HashMap<TimerKind, ActiveTimer>,
}

impl Timers {
    pub fn new(sender: UnboundedSender<SessionEvent>) -> Self {
        Self {
            sender,
            next_generation: 0,
            active: HashMap::new(),
        }
    }

    /// (Re)start `kind`, first firing one `period` from now.
    pub fn start(&mut self, kind: TimerKind, period: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let sender = self.sender.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sender.send(SessionEvent::TimerFired { kind, generation }).is_err() {
                    break;
                }
            }
        });

        log::debug!("Timer {:?} armed every {:?} (generation {})", kind, period, generation);
        self.active.insert(kind, ActiveTimer { generation, period, task });
    }

    /// Restart `kind` only if it is running with a different period.
    pub fn retune(&mut self, kind: TimerKind, period: Duration) {
        if let Some(timer) = self.active.get(&kind) {
            if timer.period != period {
                self.start(kind, period);
            }
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.active.remove(&kind) {
            timer.task.abort();
            log::debug!("Timer {:?} cancelled", kind);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Whether a tick carrying `generation` belongs to the live `kind` timer
    pub fn is_current(&self, kind: TimerKind, generation: u64) -> bool {
        self.active
            .get(&kind)
            .map_or(false, |timer| timer.generation == generation)
    }

    #[cfg(test)]
    pub fn generation(&self, kind: TimerKind) -> Option<u64> {
        self.active.get(&kind).map(|timer| timer.generation)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKind::Countdown, Duration::from_secs(1));
        let generation = timers.generation(TimerKind::Countdown).unwrap();

        match rx.recv().await {
            Some(SessionEvent::TimerFired { kind, generation: g }) => {
                assert_eq!(kind, TimerKind::Countdown);
                assert_eq!(g, generation);
                assert!(timers.is_current(kind, g));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_makes_old_generation_stale() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKind::StatusPoll, Duration::from_secs(60));
        let first = timers.generation(TimerKind::StatusPoll).unwrap();

        timers.start(TimerKind::StatusPoll, Duration::from_secs(15));
        assert!(!timers.is_current(TimerKind::StatusPoll, first));

        timers.cancel_all();
        assert!(!timers.is_running(TimerKind::StatusPoll));
        assert!(!timers.is_current(TimerKind::StatusPoll, first + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retune_only_restarts_on_new_period() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);

        timers.retune(TimerKind::KeepAlive, Duration::from_secs(5));
        assert!(!timers.is_running(TimerKind::KeepAlive));

        timers.start(TimerKind::KeepAlive, Duration::from_secs(5));
        let generation = timers.generation(TimerKind::KeepAlive);
        timers.retune(TimerKind::KeepAlive, Duration::from_secs(5));
        assert_eq!(timers.generation(TimerKind::KeepAlive), generation);
        timers.retune(TimerKind::KeepAlive, Duration::from_secs(10));
        assert_ne!(timers.generation(TimerKind::KeepAlive), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_stops_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKind::KeepAlive, Duration::from_secs(1));
        timers.cancel(TimerKind::KeepAlive);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
