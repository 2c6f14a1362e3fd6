//! Function instrumentation engine
//!
//! - `registry`: per-function pre/post hook chains
//! - `handlers`: original native handlers replaced by the trampoline
//! - `dispatcher`: registration, the native trampoline, user-function observers
//! - `exception`: scoped save/restore of the engine's exception state
//! - `frame`: function descriptors, call frames and the host function table
//! - `value`: host values passed to and returned from hooks

pub mod dispatcher;
pub mod exception;
pub mod frame;
pub mod handlers;
pub mod registry;
pub mod value;

pub use dispatcher::{BeginHandler, EndHandler, InterceptionDispatcher, ObserverHandlers};
pub use exception::{EngineState, ExceptionState, ExceptionStateGuard, OpcodeCursor};
pub use frame::{CallFrame, FunctionDescriptor, FunctionKind, FunctionTable, NativeHandler, MAX_INTERCEPTED_ARGS};
pub use handlers::OriginalHandlerStore;
pub use registry::{hook, Hook, HookEntry, HookRegistry};
pub use value::{Array, ArrayKey, DeclaredType, Object, Value};
