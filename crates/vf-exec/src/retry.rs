//! Two-phase attempt budget.
//!
//! Some remote shells only behave under a pseudo-terminal, others only
//! without one. An execution spends its first budget in one mode and the
//! second in the other, so both failure classes are exhausted before giving
//! up.

use crate::engine::ExitClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptMode {
    WithPty,
    WithoutPty,
}

impl AttemptMode {
    pub fn pty(&self) -> bool {
        matches!(self, Self::WithPty)
    }

    pub fn other(&self) -> Self {
        match self {
            Self::WithPty => Self::WithoutPty,
            Self::WithoutPty => Self::WithPty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first_mode: AttemptMode,
    pub first_phase: u32,
    pub second_phase: u32,
}

impl RetryPolicy {
    /// Elevated commands start under a pty since password prompts may need
    /// one; everything else starts without.
    pub fn new(elevated: bool, per_mode: u32) -> Self {
        Self {
            first_mode: if elevated {
                AttemptMode::WithPty
            } else {
                AttemptMode::WithoutPty
            },
            first_phase: per_mode,
            second_phase: per_mode,
        }
    }

    pub fn total(&self) -> u32 {
        self.first_phase + self.second_phase
    }

    pub fn start(&self) -> RetryState {
        let second = (self.first_mode.other(), self.second_phase);
        if self.first_phase == 0 {
            RetryState {
                mode: second.0,
                remaining: second.1.max(1),
                fallback: None,
                attempts: 0,
            }
        } else {
            RetryState {
                mode: self.first_mode,
                remaining: self.first_phase,
                fallback: Some(second),
                attempts: 0,
            }
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt produced a result for the caller.
    Finish,
    /// Credentials were rejected; retrying cannot help.
    Abort,
    Retry(AttemptMode),
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryState {
    mode: AttemptMode,
    remaining: u32,
    fallback: Option<(AttemptMode, u32)>,
    attempts: u32,
}

impl RetryState {
    pub fn mode(&self) -> AttemptMode {
        self.mode
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record(&mut self, exit: &ExitClass) -> Decision {
        self.attempts += 1;
        match exit {
            ExitClass::Success | ExitClass::CommandFailed(_) => Decision::Finish,
            ExitClass::AuthFailure => Decision::Abort,
            ExitClass::Timeout | ExitClass::ChannelFailure => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining > 0 {
                    return Decision::Retry(self.mode);
                }
                match self.fallback.take() {
                    Some((mode, budget)) if budget > 0 => {
                        self.mode = mode;
                        self.remaining = budget;
                        Decision::Retry(mode)
                    }
                    _ => Decision::Exhausted,
                }
            }
        }
    }
}
