//! Per-function hook chains

use super::value::Value;
use crate::domain::{FunctionKey, HookError};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A callable registered as a pre- or post-hook
///
/// Hooks receive their positional arguments (see [`super::dispatcher`] for
/// the pre/post argument contracts) and return a value or a thrown error.
pub trait Hook {
    /// # Errors
    ///
    /// Returns `HookError::Thrown` when the hook raised an exception.
    fn call(&self, args: &[Value]) -> Result<Value, HookError>;
}

impl<F> Hook for F
where
    F: Fn(&[Value]) -> Result<Value, HookError>,
{
    fn call(&self, args: &[Value]) -> Result<Value, HookError> {
        self(args)
    }
}

/// Wrap a closure as a shareable hook
pub fn hook<F>(f: F) -> Rc<dyn Hook>
where
    F: Fn(&[Value]) -> Result<Value, HookError> + 'static,
{
    Rc::new(f)
}

/// One instrumentation of a function: optional pre- and post-hook
#[derive(Clone, Default)]
pub struct HookEntry {
    pub pre: Option<Rc<dyn Hook>>,
    pub post: Option<Rc<dyn Hook>>,
}

impl HookEntry {
    #[must_use]
    pub fn new(pre: Option<Rc<dyn Hook>>, post: Option<Rc<dyn Hook>>) -> Self {
        Self { pre, post }
    }
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}

/// Hook chains keyed by [`FunctionKey`]
///
/// Registering the same function twice appends a second entry; entries run
/// in registration order. There is no internal locking: one worker owns the
/// registry at a time, and a threaded embedding has to serialize access
/// itself.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: HashMap<FunctionKey, Vec<HookEntry>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, key: FunctionKey, pre: Option<Rc<dyn Hook>>, post: Option<Rc<dyn Hook>>) {
        self.hooks.entry(key).or_default().push(HookEntry::new(pre, post));
    }

    /// Hook chain for `key`, `None` when nothing is registered
    #[must_use]
    pub fn find(&self, key: FunctionKey) -> Option<&[HookEntry]> {
        self.hooks.get(&key).map(Vec::as_slice).filter(|entries| !entries.is_empty())
    }

    /// Append every entry of `from` to the chain of `to`
    ///
    /// Returns the number of copied entries.
    pub fn copy_chain(&mut self, from: FunctionKey, to: FunctionKey) -> usize {
        let Some(entries) = self.hooks.get(&from).cloned() else {
            return 0;
        };
        let count = entries.len();
        self.hooks.entry(to).or_default().extend(entries);
        count
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
