//! Reader-writer lifecycle guard for service components.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::HekateError;

/// Lifecycle states tracked by a [`StateGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Component is not running. Initial and terminal state.
    Terminated,
    /// Component is being brought up.
    Initializing,
    /// Component is fully operational.
    Initialized,
    /// Component is shutting down.
    Terminating,
}

impl GuardState {
    const fn name(self) -> &'static str {
        match self {
            Self::Terminated => "TERMINATED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Terminating => "TERMINATING",
        }
    }
}

/// Gates public service operations on component lifecycle.
///
/// Operation paths call [`enter`](Self::enter) which takes the read lock and
/// verifies the component is `Initialized`; lifecycle transitions take the
/// write lock through [`lock_write`](Self::lock_write). Async operations
/// drop the returned guard before awaiting; a component that terminates
/// while requests are in flight fails them through its closing channels
/// rather than through the guard.
pub struct StateGuard {
    component: &'static str,
    state: RwLock<GuardState>,
}

impl StateGuard {
    /// Creates a guard in the `Terminated` state.
    #[must_use]
    pub const fn new(component: &'static str) -> Self {
        Self {
            component,
            state: RwLock::new(GuardState::Terminated),
        }
    }

    /// Component name used in error reporting.
    #[must_use]
    pub const fn component(&self) -> &'static str {
        self.component
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> GuardState {
        *self.state.read()
    }

    /// Whether the component is currently `Initialized`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        *self.state.read() == GuardState::Initialized
    }

    /// Acquires the read lock after checking that the component is
    /// `Initialized`; fails with an illegal-state error otherwise.
    pub fn enter(&self) -> Result<RwLockReadGuard<'_, GuardState>, HekateError> {
        let guard = self.state.read();
        if *guard == GuardState::Initialized {
            Ok(guard)
        } else {
            Err(HekateError::IllegalState {
                component: self.component,
                state: guard.name(),
            })
        }
    }

    /// Read-lock variant that reports availability instead of failing.
    #[must_use]
    pub fn try_enter(&self) -> Option<RwLockReadGuard<'_, GuardState>> {
        let guard = self.state.read();
        (*guard == GuardState::Initialized).then_some(guard)
    }

    /// Acquires the write lock for a lifecycle transition.
    pub fn lock_write(&self) -> StateWriteGuard<'_> {
        StateWriteGuard {
            component: self.component,
            state: self.state.write(),
        }
    }
}

/// Write-locked view used to perform lifecycle transitions.
pub struct StateWriteGuard<'a> {
    component: &'static str,
    state: RwLockWriteGuard<'a, GuardState>,
}

impl StateWriteGuard<'_> {
    /// State under the write lock.
    #[must_use]
    pub fn state(&self) -> GuardState {
        *self.state
    }

    /// Switches to `Initializing`; fails if already initializing/initialized.
    pub fn become_initializing(&mut self) -> Result<(), HekateError> {
        match *self.state {
            GuardState::Initializing | GuardState::Initialized => {
                Err(HekateError::IllegalState {
                    component: self.component,
                    state: self.state.name(),
                })
            }
            _ => {
                *self.state = GuardState::Initializing;
                Ok(())
            }
        }
    }

    /// Switches to `Initialized`; fails if already initialized.
    pub fn become_initialized(&mut self) -> Result<(), HekateError> {
        if *self.state == GuardState::Initialized {
            return Err(HekateError::IllegalState {
                component: self.component,
                state: self.state.name(),
            });
        }
        *self.state = GuardState::Initialized;
        Ok(())
    }

    /// Switches to `Terminating` unless already terminating/terminated.
    /// Returns whether the transition happened.
    pub fn become_terminating(&mut self) -> bool {
        match *self.state {
            GuardState::Terminated | GuardState::Terminating => false,
            _ => {
                *self.state = GuardState::Terminating;
                true
            }
        }
    }

    /// Switches to `Terminated` unless already there. Returns whether the
    /// transition happened.
    pub fn become_terminated(&mut self) -> bool {
        if *self.state == GuardState::Terminated {
            false
        } else {
            *self.state = GuardState::Terminated;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_terminated() {
        let guard = StateGuard::new("test");
        assert_eq!(guard.state(), GuardState::Terminated);
        assert!(guard.enter().is_err());
        assert!(guard.try_enter().is_none());
    }

    #[test]
    fn full_lifecycle() {
        let guard = StateGuard::new("test");
        {
            let mut w = guard.lock_write();
            w.become_initializing().unwrap();
            w.become_initialized().unwrap();
        }
        assert!(guard.enter().is_ok());
        {
            let mut w = guard.lock_write();
            assert!(w.become_terminating());
            assert!(w.become_terminated());
        }
        let err = guard.enter().unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn double_initialize_rejected() {
        let guard = StateGuard::new("test");
        let mut w = guard.lock_write();
        w.become_initializing().unwrap();
        w.become_initialized().unwrap();
        assert!(w.become_initialized().is_err());
        assert!(w.become_initializing().is_err());
    }

    #[test]
    fn terminate_is_idempotent() {
        let guard = StateGuard::new("test");
        let mut w = guard.lock_write();
        assert!(!w.become_terminated());
        w.become_initializing().unwrap();
        assert!(w.become_terminating());
        assert!(!w.become_terminating());
        assert!(w.become_terminated());
        assert!(!w.become_terminated());
    }
}
