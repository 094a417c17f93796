//! Lifecycle state machines
//!
//! `RecorderState` tracks the controller and validates transitions;
//! `ProducerState` is the producer thread's state, shared atomically so the
//! controller can observe it without locking.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Lifecycle of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderState {
    /// Created, nothing started
    Idle,
    /// Resolving geometry and spawning threads
    Starting,
    /// Capturing
    Running,
    /// Teardown in progress
    Stopping,
    /// Finished; a recorder is never restarted
    Stopped,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "Idle"),
            RecorderState::Starting => write!(f, "Starting"),
            RecorderState::Running => write!(f, "Running"),
            RecorderState::Stopping => write!(f, "Stopping"),
            RecorderState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl RecorderState {
    /// Returns valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [RecorderState] {
        match self {
            RecorderState::Idle => &[RecorderState::Starting],
            RecorderState::Starting => &[RecorderState::Running, RecorderState::Stopped],
            RecorderState::Running => &[RecorderState::Stopping],
            RecorderState::Stopping => &[RecorderState::Stopped],
            RecorderState::Stopped => &[],
        }
    }

    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecorderState::Stopped)
    }
}

/// Record of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: RecorderState,
    pub to: RecorderState,
    pub timestamp: Instant,
}

/// Validated recorder state with transition history
#[derive(Debug)]
pub struct StateMachine {
    current: RecorderState,
    history: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a state machine in Idle state
    pub fn new() -> Self {
        Self {
            current: RecorderState::Idle,
            history: Vec::new(),
        }
    }

    /// Returns the current state
    pub fn current(&self) -> RecorderState {
        self.current
    }

    /// Returns true if the transition is valid
    pub fn can_transition(&self, to: RecorderState) -> bool {
        self.current.valid_transitions().contains(&to)
    }

    /// Moves to `to`, returning the rejected state pair if it is not allowed
    pub fn transition(&mut self, to: RecorderState) -> Result<(), (RecorderState, RecorderState)> {
        if !self.can_transition(to) {
            return Err((self.current, to));
        }
        self.history.push(StateTransition {
            from: self.current,
            to,
            timestamp: Instant::now(),
        });
        self.current = to;
        Ok(())
    }

    /// Transition history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }
}

/// Producer thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProducerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ProducerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProducerState::Idle,
            1 => ProducerState::Running,
            2 => ProducerState::Stopping,
            _ => ProducerState::Stopped,
        }
    }
}

/// Producer state readable from any thread
#[derive(Debug)]
pub struct AtomicProducerState(AtomicU8);

impl Default for AtomicProducerState {
    fn default() -> Self {
        Self(AtomicU8::new(ProducerState::Idle as u8))
    }
}

impl AtomicProducerState {
    pub fn load(&self) -> ProducerState {
        ProducerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: ProducerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves Running to Stopping; other states are left alone
    pub fn request_stop(&self) {
        let _ = self.0.compare_exchange(
            ProducerState::Running as u8,
            ProducerState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
