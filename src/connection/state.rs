//! Lifecycle states and the compare-and-swap cell that guards them.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::EngineError;

/// A lifecycle enum that can live in a [`StateCell`].
pub trait Lifecycle: Copy + Eq + Debug + Send + Sync + 'static {
    fn to_u8(self) -> u8;
    fn from_u8(value: u8) -> Self;
    fn name(self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    LoggingIn = 3,
    Securing = 4,
    LoggedIn = 5,
    Disconnecting = 6,
}

impl ConnectionState {
    /// States from which a disconnect may start.
    pub const ACTIVE: [ConnectionState; 5] = [
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::LoggingIn,
        ConnectionState::Securing,
        ConnectionState::LoggedIn,
    ];
}

impl Lifecycle for ConnectionState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::LoggingIn,
            4 => Self::Securing,
            5 => Self::LoggedIn,
            6 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::LoggingIn => "LoggingIn",
            Self::Securing => "Securing",
            Self::LoggedIn => "LoggedIn",
            Self::Disconnecting => "Disconnecting",
        }
    }
}

/// Atomic state holder. A transition succeeds only from one of the expected
/// prior states; otherwise nothing changes and the caller gets a
/// `StateConflict`.
pub struct StateCell<S: Lifecycle> {
    value: AtomicU8,
    _state: PhantomData<S>,
}

impl<S: Lifecycle> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.to_u8()),
            _state: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_u8(self.value.load(Ordering::SeqCst))
    }

    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    pub fn is_any(&self, states: &[S]) -> bool {
        states.contains(&self.get())
    }

    /// Move to `to` if the current state is one of `expected`. Returns the
    /// state that was replaced.
    pub fn transition(&self, to: S, expected: &[S]) -> Result<S, EngineError> {
        for &from in expected {
            if self
                .value
                .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(from);
            }
        }
        Err(EngineError::StateConflict {
            current: self.get().name(),
            expected: expected.iter().map(|s| s.name()).collect(),
        })
    }

    /// Unconditional transition, returning the previous state.
    pub fn force(&self, to: S) -> S {
        S::from_u8(self.value.swap(to.to_u8(), Ordering::SeqCst))
    }
}

impl<S: Lifecycle> Debug for StateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}
