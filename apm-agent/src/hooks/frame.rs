//! Call-site descriptions handed over by the host engine

use super::exception::EngineState;
use super::value::{Array, DeclaredType, Value};
use crate::domain::{Bailout, FunctionKey};

/// Positions past the declared parameters a pre-hook may still fill in
pub const MAX_INTERCEPTED_ARGS: usize = 100;

/// Native implementation of a host function
///
/// May leave an exception in the engine state, or abort the whole call chain
/// with [`Bailout`].
pub type NativeHandler = fn(&mut dyn EngineState, &mut CallFrame<'_>) -> Result<Value, Bailout>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Implemented by the engine itself; called through a native handler
    Native,
    /// Interpreted user code; observed through begin/end callbacks
    User,
}

/// Static description of a function, as resolved from the host tables
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    /// Declaring class, `None` for free functions
    pub class_name: Option<String>,
    pub name: String,
    pub kind: FunctionKind,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// `None` when the function has no return type declaration
    pub return_type: Option<DeclaredType>,
    pub parameters: Vec<String>,
    /// Interfaces implemented by the declaring class
    pub interfaces: Vec<String>,
}

impl FunctionDescriptor {
    #[must_use]
    pub fn new(class_name: Option<&str>, name: &str, kind: FunctionKind) -> Self {
        Self {
            class_name: class_name.map(str::to_string),
            name: name.to_string(),
            kind,
            file: None,
            line: None,
            return_type: None,
            parameters: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(self.class_name.as_deref().unwrap_or(""), &self.name)
    }

    /// Position of the parameter called `name`, case-sensitive like the host
    #[must_use]
    pub fn index_of_parameter(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p == name)
    }

    /// `Class::function` or `function`, for diagnostics
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.class_name {
            Some(class) => format!("{class}::{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Whether a post-hook result may replace this function's return value
    #[must_use]
    pub fn accepts_return_override(&self, value: &Value) -> bool {
        self.return_type.as_ref().is_some_and(|declared| declared.accepts(value))
    }
}

/// One invocation of a function
#[derive(Debug)]
pub struct CallFrame<'f> {
    pub function: &'f FunctionDescriptor,
    /// Bound object for instance method calls
    pub this: Option<Value>,
    pub args: Vec<Value>,
}

impl<'f> CallFrame<'f> {
    #[must_use]
    pub fn new(function: &'f FunctionDescriptor, args: Vec<Value>) -> Self {
        Self { function, this: None, args }
    }

    #[must_use]
    pub fn with_this(mut self, this: Value) -> Self {
        self.this = Some(this);
        self
    }

    /// `$this`, else the scope class name, else null
    #[must_use]
    pub fn scope_or_this(&self) -> Value {
        match (&self.this, &self.function.class_name) {
            (Some(this), _) => this.clone(),
            (None, Some(class)) => Value::String(class.clone()),
            (None, None) => Value::Null,
        }
    }

    /// The call arguments as a host list
    #[must_use]
    pub fn arguments(&self) -> Value {
        Value::Array(Array::list(self.args.iter().cloned()))
    }

    /// Highest argument count a patch may grow the call to
    #[must_use]
    pub fn argument_limit(&self) -> usize {
        self.args.len().max(self.function.parameters.len()).max(MAX_INTERCEPTED_ARGS)
    }

    /// Overwrite the argument at `index`, growing the argument storage with
    /// nulls when `index` is past the end
    pub fn set_argument(&mut self, index: usize, value: Value) {
        if index >= self.args.len() {
            self.args.resize(index + 1, Value::Null);
        }
        self.args[index] = value;
    }
}

/// Host function and class tables, as needed to install instrumentation
pub trait FunctionTable {
    fn class_exists(&self, class_name: &str) -> bool;

    /// Resolve a method (`class_name` non-empty) or free function, case-insensitively
    fn find_function(&self, class_name: &str, function_name: &str) -> Option<FunctionDescriptor>;

    /// Route a native function through the interception trampoline
    ///
    /// Returns the handler that was installed before, or `None` when the
    /// function is already routed through the trampoline.
    fn wrap_native(&mut self, class_name: &str, function_name: &str) -> Option<NativeHandler>;
}
