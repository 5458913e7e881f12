//! # Run Controller
//!
//! Owns the stimulation run parameters: strength, duration, the running
//! flag and the countdown. It never talks to the transport; each operation
//! returns the commands the session should send, in order.
//!
//! Invariant: `remaining_seconds > 0` implies `running`. Stopping always
//! zeroes the remaining time.

use crate::protocol::{Command, Strength};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionParameters {
    pub strength: Strength,
    pub duration_minutes: u32,
    pub running: bool,
    pub remaining_seconds: u32,
}

/// Result of one countdown tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Not running; nothing happened
    Idle,
    Counting(u32),
    /// Remaining time reached zero on this tick
    Expired,
}

#[derive(Debug, Clone)]
pub struct RunController {
    params: SessionParameters,
}

impl RunController {
    pub fn new(strength: Strength, duration_minutes: u32) -> Self {
        Self {
            params: SessionParameters {
                strength,
                duration_minutes: duration_minutes.max(1),
                running: false,
                remaining_seconds: 0,
            },
        }
    }

    pub fn params(&self) -> &SessionParameters {
        &self.params
    }

    pub fn is_running(&self) -> bool {
        self.params.running
    }

    /// Begin a run. The caller is responsible for checking the link first.
    pub fn start(&mut self, strength: Strength, duration_minutes: u32) -> Vec<Command> {
        let minutes = duration_minutes.max(1);
        self.params.strength = strength;
        self.params.duration_minutes = minutes;
        self.params.running = true;
        self.params.remaining_seconds = minutes.saturating_mul(60);
        log::info!("Run started: strength {} for {} min", strength, minutes);
        vec![Command::Activate, Command::Strength(strength)]
    }

    /// End the run. Returns whether a run was actually in progress.
    pub fn stop(&mut self) -> bool {
        let was_running = self.params.running;
        self.params.running = false;
        self.params.remaining_seconds = 0;
        if was_running {
            log::info!("Run stopped");
        }
        was_running
    }

    /// Update strength, clamped to 1..=9. Returns the command to send when a
    /// run is live.
    pub fn set_strength(&mut self, value: i64) -> Option<Command> {
        let strength = Strength::clamped(value);
        if i64::from(strength.get()) != value {
            log::warn!("Strength {} out of range, using {}", value, strength);
        }
        self.params.strength = strength;
        self.params.running.then_some(Command::Strength(strength))
    }

    /// Advance the countdown by one second.
    pub fn tick(&mut self) -> Tick {
        if !self.params.running {
            return Tick::Idle;
        }
        self.params.remaining_seconds = self.params.remaining_seconds.saturating_sub(1);
        if self.params.remaining_seconds == 0 {
            Tick::Expired
        } else {
            Tick::Counting(self.params.remaining_seconds)
        }
    }

    /// Commands that put a freshly (re)connected device back into the
    /// current run. The device keeps no state across a link drop.
    pub fn resume_commands(&self) -> Vec<Command> {
        if self.params.running {
            vec![Command::Activate, Command::Strength(self.params.strength)]
        } else {
            Vec::new()
        }
    }

    pub fn keepalive_command(&self) -> Option<Command> {
        self.params
            .running
            .then_some(Command::Strength(self.params.strength))
    }
}
