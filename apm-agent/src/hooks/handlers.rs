//! Original native handlers of instrumented functions

use super::frame::NativeHandler;
use crate::domain::FunctionKey;
use log::debug;
use std::collections::HashMap;
use std::fmt;

/// Native handlers that were replaced by the interception trampoline
///
/// Owned by the process bootstrap and handed to the dispatcher. The first
/// handler recorded for a key stays for the lifetime of the process;
/// instrumenting the same function again never overwrites it (by then the
/// installed handler would be the trampoline itself).
#[derive(Default)]
pub struct OriginalHandlerStore {
    handlers: HashMap<FunctionKey, NativeHandler>,
}

impl fmt::Debug for OriginalHandlerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalHandlerStore").field("handlers", &self.handlers.len()).finish()
    }
}

impl OriginalHandlerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handler` for `key` unless one is already recorded
    ///
    /// Returns `true` when `handler` was stored.
    pub fn store(&mut self, key: FunctionKey, handler: NativeHandler) -> bool {
        if self.handlers.contains_key(&key) {
            debug!("Original handler for {key} already recorded");
            return false;
        }
        self.handlers.insert(key, handler);
        true
    }

    #[must_use]
    pub fn get(&self, key: FunctionKey) -> Option<NativeHandler> {
        self.handlers.get(&key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Bailout;
    use crate::hooks::exception::{EngineState, ExceptionState};
    use crate::hooks::frame::{CallFrame, FunctionDescriptor, FunctionKind};
    use crate::hooks::value::Value;

    fn first(_: &mut dyn EngineState, _: &mut CallFrame<'_>) -> Result<Value, Bailout> {
        Ok(Value::Int(1))
    }

    fn second(_: &mut dyn EngineState, _: &mut CallFrame<'_>) -> Result<Value, Bailout> {
        Ok(Value::Int(2))
    }

    #[test]
    fn test_first_handler_wins() {
        let mut store = OriginalHandlerStore::new();
        let key = FunctionKey::for_function("strlen");

        assert!(store.store(key, first));
        assert!(!store.store(key, second));

        let handler = store.get(key).unwrap();
        let function = FunctionDescriptor::new(None, "strlen", FunctionKind::Native);
        let mut frame = CallFrame::new(&function, vec![]);
        assert_eq!(handler(&mut ExceptionState::default(), &mut frame), Ok(Value::Int(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_handler() {
        let store = OriginalHandlerStore::new();
        assert!(store.get(FunctionKey::for_function("strlen")).is_none());
        assert!(store.is_empty());
    }
}
