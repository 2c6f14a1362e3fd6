//! Interception of instrumented calls
//!
//! ## Hook argument contracts
//!
//! Pre-hooks are called with
//! `(scope_or_this, arguments, declaring_class, function_name, file, line)`.
//!
//! Post-hooks are called with
//! `(scope_or_this, arguments, return_value, exception, declaring_class,
//! function_name, file, line)`.
//!
//! ## Call sequence (native functions)
//!
//! ```text
//! trampoline ──▶ pre-hooks (registration order) ──▶ original handler
//!                                                        │
//!              caller ◀── post-hooks (registration order)┘
//! ```
//!
//! User functions are executed by the engine itself; the dispatcher only
//! hands back begin/end observer callbacks that replay the same hook
//! contracts around the engine's call.
//!
//! Every hook runs inside an [`ExceptionStateGuard`], and every hook failure
//! (thrown error, raised exception, panic) is logged and swallowed. The only
//! thing that crosses back into the host is [`Bailout`] from the original
//! handler.

use super::exception::{EngineState, ExceptionStateGuard};
use super::frame::{CallFrame, FunctionDescriptor, FunctionKind, FunctionTable};
use super::handlers::OriginalHandlerStore;
use super::registry::{Hook, HookEntry};
use super::value::{ArrayKey, Value};
use crate::domain::{Bailout, FunctionKey, HookError};
use crate::request::{ErrorData, RequestScope};
use log::{debug, error, trace, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Observer callback run before a user function body
pub type BeginHandler = fn(&InterceptionDispatcher, &mut dyn EngineState, &mut CallFrame<'_>);

/// Observer callback run after a user function body, with its return value
pub type EndHandler = fn(&InterceptionDispatcher, &mut dyn EngineState, &mut CallFrame<'_>, &mut Value);

/// Answer to the engine's "should this call be observed" question
#[derive(Clone, Copy, Default)]
pub struct ObserverHandlers {
    pub begin: Option<BeginHandler>,
    pub end: Option<EndHandler>,
}

impl ObserverHandlers {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.begin.is_none() && self.end.is_none()
    }
}

impl fmt::Debug for ObserverHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandlers")
            .field("begin", &self.begin.is_some())
            .field("end", &self.end.is_some())
            .finish()
    }
}

/// Entry points called by the host engine for instrumented functions
#[derive(Default)]
pub struct InterceptionDispatcher {
    scope: RequestScope,
    handlers: OriginalHandlerStore,
}

impl InterceptionDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handlers(handlers: OriginalHandlerStore) -> Self {
        Self { scope: RequestScope::new(), handlers }
    }

    #[must_use]
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut RequestScope {
        &mut self.scope
    }

    #[must_use]
    pub fn handlers(&self) -> &OriginalHandlerStore {
        &self.handlers
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register hooks for `class_name::function_name` (or a free function
    /// when `class_name` is empty)
    ///
    /// Native functions are routed through [`Self::call_native`] and their
    /// original handler is recorded. Returns `false` when the class or the
    /// function cannot be resolved.
    pub fn instrument_function(
        &mut self,
        table: &mut dyn FunctionTable,
        class_name: &str,
        function_name: &str,
        on_entry: Option<Rc<dyn Hook>>,
        on_exit: Option<Rc<dyn Hook>>,
    ) -> bool {
        if !class_name.is_empty() && !table.class_exists(class_name) {
            warn!("Class {class_name} not found, {class_name}::{function_name} cannot be instrumented");
            return false;
        }

        let Some(function) = table.find_function(class_name, function_name) else {
            warn!("Function {class_name}::{function_name} not found and cannot be instrumented");
            return false;
        };

        let key = function.key();
        self.scope.hooks_mut().store(key, on_entry, on_exit);

        if function.kind == FunctionKind::Native {
            if let Some(original) = table.wrap_native(class_name, function_name) {
                self.handlers.store(key, original);
            }
        }

        debug!("{} ({:?}) instrumented, key: {key}", function.qualified_name(), function.kind);
        true
    }

    // ========================================================================
    // Native functions
    // ========================================================================

    /// Trampoline installed in place of an instrumented native function
    ///
    /// # Errors
    ///
    /// Returns [`Bailout`] when the original handler aborted the call chain;
    /// post-hooks are not run in that case.
    pub fn call_native(&self, engine: &mut dyn EngineState, frame: &mut CallFrame<'_>) -> Result<Value, Bailout> {
        let key = frame.function.key();

        let Some(original) = self.handlers.get(key) else {
            error!("Unable to find original handler for {} (key {key})", frame.function.qualified_name());
            return Ok(Value::Null);
        };

        if !self.scope.is_functional() {
            return original(engine, frame);
        }

        let Some(entries) = self.scope.hooks().find(key) else {
            let result = original(engine, frame);
            warn!("No hooks registered for wrapped native function {} (key {key})", frame.function.qualified_name());
            return result;
        };

        run_pre_hooks(entries, engine, frame, key);

        let mut return_value = original(engine, frame)?;

        run_post_hooks(entries, engine, frame, &mut return_value, key);

        Ok(return_value)
    }

    // ========================================================================
    // User functions
    // ========================================================================

    /// Decide whether a call to `function` should be observed
    ///
    /// Hooks registered on an interface of the declaring class cover the
    /// implementation as well: on the first lookup the interface's chain is
    /// copied to the concrete key (first matching interface wins).
    pub fn register_observer(&mut self, function: &FunctionDescriptor) -> ObserverHandlers {
        if function.kind == FunctionKind::Native {
            return ObserverHandlers::default();
        }

        let key = function.key();
        if key.is_none() {
            trace!("register_observer: main scope");
            return ObserverHandlers::default();
        }

        if self.scope.hooks().find(key).is_none() {
            let interface_key = function
                .interfaces
                .iter()
                .map(|interface| FunctionKey::new(interface, &function.name))
                .find(|candidate| self.scope.hooks().find(*candidate).is_some());

            match interface_key {
                Some(interface_key) => {
                    let copied = self.scope.hooks_mut().copy_chain(interface_key, key);
                    debug!(
                        "register_observer: {} inherits {copied} hook(s) from interface key {interface_key}",
                        function.qualified_name()
                    );
                }
                None => {
                    trace!("register_observer: key {key} not instrumented");
                    return ObserverHandlers::default();
                }
            }
        }

        let Some(entries) = self.scope.hooks().find(key) else {
            return ObserverHandlers::default();
        };

        let have_pre = entries.iter().any(|entry| entry.pre.is_some());
        let have_post = entries.iter().any(|entry| entry.post.is_some());
        trace!("register_observer: key {key}, pre hooks: {have_pre}, post hooks: {have_post}");

        ObserverHandlers {
            begin: have_pre.then_some(Self::observe_begin as BeginHandler),
            end: have_post.then_some(Self::observe_end as EndHandler),
        }
    }

    /// Begin callback for observed user functions
    pub fn observe_begin(&self, engine: &mut dyn EngineState, frame: &mut CallFrame<'_>) {
        let key = frame.function.key();
        match self.scope.hooks().find(key) {
            Some(entries) => run_pre_hooks(entries, engine, frame, key),
            None => error!("Unable to find pre-hooks for {} (key {key})", frame.function.qualified_name()),
        }
    }

    /// End callback for observed user functions
    pub fn observe_end(&self, engine: &mut dyn EngineState, frame: &mut CallFrame<'_>, return_value: &mut Value) {
        let key = frame.function.key();
        match self.scope.hooks().find(key) {
            Some(entries) => run_post_hooks(entries, engine, frame, return_value, key),
            None => error!("Unable to find post-hooks for {} (key {key})", frame.function.qualified_name()),
        }
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Host error observer
    ///
    /// Errors raised inside an instrumented function are left to its
    /// post-hooks; everything else is captured by the request scope.
    pub fn handle_error(&mut self, executing: Option<&FunctionDescriptor>, error: ErrorData) {
        if let Some(function) = executing {
            if self.scope.hooks().find(function.key()).is_some() {
                debug!(
                    "Skipping default error capture for '{}': {} is instrumented and its post-hooks will see the error",
                    error.message,
                    function.qualified_name()
                );
                return;
            }
        }
        self.scope.handle_error(error);
    }
}

// ============================================================================
// Hook invocation
// ============================================================================

fn run_pre_hooks(entries: &[HookEntry], engine: &mut dyn EngineState, frame: &mut CallFrame<'_>, key: FunctionKey) {
    for hook in entries.iter().filter_map(|entry| entry.pre.as_deref()) {
        let mut guard = ExceptionStateGuard::new(&mut *engine);

        let arguments = frame.arguments();
        let args = [
            frame.scope_or_this(),
            arguments.clone(),
            declaring_class(frame.function),
            Value::String(frame.function.name.clone()),
            declaration_file(frame.function),
            declaration_line(frame.function),
        ];

        match invoke(hook, &args) {
            Ok(result) => apply_argument_patch(frame, &arguments, result),
            Err(err) => warn!("Pre-hook for {} (key {key}) failed: {err}", frame.function.qualified_name()),
        }

        guard.release_raised(&frame.function.qualified_name());
    }
}

fn run_post_hooks(
    entries: &[HookEntry],
    engine: &mut dyn EngineState,
    frame: &mut CallFrame<'_>,
    return_value: &mut Value,
    key: FunctionKey,
) {
    for hook in entries.iter().filter_map(|entry| entry.post.as_deref()) {
        let mut guard = ExceptionStateGuard::new(&mut *engine);

        let exception = guard.saved_exception().cloned().map_or(Value::Null, Value::Object);
        let args = [
            frame.scope_or_this(),
            frame.arguments(),
            return_value.clone(),
            exception,
            declaring_class(frame.function),
            Value::String(frame.function.name.clone()),
            declaration_file(frame.function),
            declaration_line(frame.function),
        ];

        match invoke(hook, &args) {
            Ok(result) if result.is_null() => {}
            Ok(result) => {
                if frame.function.accepts_return_override(&result) {
                    *return_value = result;
                } else {
                    debug!(
                        "Post-hook result of type {} ignored for {}",
                        result.type_name(),
                        frame.function.qualified_name()
                    );
                }
            }
            Err(err) => warn!("Post-hook for {} (key {key}) failed: {err}", frame.function.qualified_name()),
        }

        guard.release_raised(&frame.function.qualified_name());
    }
}

/// Call a hook, turning a panic into [`HookError::Panicked`]
fn invoke(hook: &dyn Hook, args: &[Value]) -> Result<Value, HookError> {
    panic::catch_unwind(AssertUnwindSafe(|| hook.call(args))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(HookError::Panicked(message))
    })
}

/// Apply a pre-hook result to the call arguments
///
/// An array other than the arguments the hook was given is a patch: integer
/// keys address positions, string keys address parameter names.
fn apply_argument_patch(frame: &mut CallFrame<'_>, original: &Value, result: Value) {
    let Value::Array(patch) = result else {
        return;
    };
    if matches!(original, Value::Array(args) if *args == patch) {
        return;
    }

    let limit = frame.argument_limit();
    for (key, value) in patch.iter() {
        let index = match key {
            ArrayKey::Index(index) => usize::try_from(*index)
                .ok()
                .filter(|i| *i < limit)
                .ok_or(HookError::ArgumentOutOfRange { index: *index, limit }),
            ArrayKey::Name(name) => {
                frame.function.index_of_parameter(name).ok_or_else(|| HookError::UnknownParameter(name.clone()))
            }
        };
        match index {
            Ok(index) => frame.set_argument(index, value.clone()),
            Err(err) => warn!("Skipping argument patch for {}: {err}", frame.function.qualified_name()),
        }
    }
}

fn declaring_class(function: &FunctionDescriptor) -> Value {
    function.class_name.clone().map_or(Value::Null, Value::String)
}

fn declaration_file(function: &FunctionDescriptor) -> Value {
    function.file.clone().map_or(Value::Null, Value::String)
}

fn declaration_line(function: &FunctionDescriptor) -> Value {
    function.line.map_or(Value::Null, |line| Value::Int(i64::from(line)))
}
