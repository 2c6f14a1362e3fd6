//! Save/restore of the engine's ambient exception state around hook calls
//!
//! A hook runs in the middle of someone else's call. Whatever exception the
//! instrumented function raised (and the opcode position the engine will
//! resume from) must survive the hook untouched, and whatever the hook raises
//! must not leak back into the caller. [`ExceptionStateGuard`] takes the
//! state out on construction and puts it back on drop, on every exit path.

use super::value::Object;
use log::warn;
use std::ops::{Deref, DerefMut};

/// Position in the executing opcode stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeCursor(pub usize);

/// Snapshot of the engine's in-flight exception bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionState {
    pub exception: Option<Object>,
    pub previous_exception: Option<Object>,
    pub opline_before_exception: Option<OpcodeCursor>,
    /// Only tracked while user code is executing
    pub opline: Option<OpcodeCursor>,
}

/// Access to the host engine's ambient exception state
pub trait EngineState {
    /// Move the current state out, leaving a clean state behind
    fn save_exception_state(&mut self) -> ExceptionState;

    fn restore_exception_state(&mut self, state: ExceptionState);

    /// Take the exception raised since the last save, if any
    fn take_exception(&mut self) -> Option<Object>;

    /// Raise `exception` in the engine
    fn raise(&mut self, exception: Object);
}

/// The plain in-memory engine state is its own [`EngineState`]
impl EngineState for ExceptionState {
    fn save_exception_state(&mut self) -> ExceptionState {
        std::mem::take(self)
    }

    fn restore_exception_state(&mut self, state: ExceptionState) {
        *self = state;
    }

    fn take_exception(&mut self) -> Option<Object> {
        self.exception.take()
    }

    fn raise(&mut self, exception: Object) {
        self.previous_exception = self.exception.replace(exception);
    }
}

/// Scoped save/restore of [`ExceptionState`]
///
/// Derefs to the engine so hooks can be run while the guard is alive.
pub struct ExceptionStateGuard<'e> {
    engine: &'e mut dyn EngineState,
    saved: Option<ExceptionState>,
}

impl<'e> ExceptionStateGuard<'e> {
    pub fn new(engine: &'e mut dyn EngineState) -> Self {
        let saved = engine.save_exception_state();
        Self { engine, saved: Some(saved) }
    }

    /// Exception that was in flight when the guard was created
    #[must_use]
    pub fn saved_exception(&self) -> Option<&Object> {
        self.saved.as_ref().and_then(|state| state.exception.as_ref())
    }

    /// Take and log an exception raised while the guard was held
    ///
    /// Returns `true` when there was one.
    pub fn release_raised(&mut self, function: &str) -> bool {
        match self.engine.take_exception() {
            Some(exception) => {
                warn!("Instrumentation hook error in {function}: {exception}");
                true
            }
            None => false,
        }
    }
}

impl<'e> Deref for ExceptionStateGuard<'e> {
    type Target = dyn EngineState + 'e;

    fn deref(&self) -> &Self::Target {
        &*self.engine
    }
}

impl<'e> DerefMut for ExceptionStateGuard<'e> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.engine
    }
}

impl Drop for ExceptionStateGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.engine.restore_exception_state(saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight() -> ExceptionState {
        ExceptionState {
            exception: Some(Object::exception("PDOException", "gone away")),
            previous_exception: None,
            opline_before_exception: Some(OpcodeCursor(17)),
            opline: Some(OpcodeCursor(18)),
        }
    }

    #[test]
    fn test_guard_clears_then_restores() {
        let mut engine = in_flight();
        {
            let guard = ExceptionStateGuard::new(&mut engine);
            assert_eq!(guard.saved_exception().map(|e| e.class.as_str()), Some("PDOException"));
        }
        assert_eq!(engine, in_flight());
    }

    #[test]
    fn test_state_is_clean_inside_guard() {
        let mut engine = in_flight();
        let mut guard = ExceptionStateGuard::new(&mut engine);
        assert!(guard.take_exception().is_none());
    }

    #[test]
    fn test_exception_raised_inside_guard_does_not_leak() {
        let mut engine = ExceptionState::default();
        {
            let mut guard = ExceptionStateGuard::new(&mut engine);
            guard.raise(Object::exception("LogicException", "from hook"));
            assert!(guard.release_raised("strlen"));
            assert!(!guard.release_raised("strlen"));
        }
        assert_eq!(engine, ExceptionState::default());
    }

    #[test]
    fn test_restore_overwrites_unreleased_exception() {
        let mut engine = in_flight();
        {
            let mut guard = ExceptionStateGuard::new(&mut engine);
            guard.raise(Object::exception("Error", "ignored"));
        }
        assert_eq!(engine, in_flight());
    }
}
