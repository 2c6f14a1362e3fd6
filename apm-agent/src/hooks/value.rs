//! Host values as seen by hooks
//!
//! A minimal model of the host engine's dynamic values: enough to pass call
//! arguments, return values and exceptions to hooks, to patch arguments from
//! a pre-hook result, and to check a post-hook result against a declared
//! return type.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Array),
    Object(Object),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's type, as printed in diagnostics
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(object) => &object.class,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

/// Key of an [`Array`] entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Index(i64),
    Name(String),
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Index(i) => write!(f, "{i}"),
            ArrayKey::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Insertion-ordered map, the host's only collection type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array {
    entries: Vec<(ArrayKey, Value)>,
}

impl Array {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list (keys 0..n) from positional values
    #[must_use]
    pub fn list(values: impl IntoIterator<Item = Value>) -> Self {
        let mut array = Self::new();
        for value in values {
            array.push(value);
        }
        array
    }

    /// Append with the next integer key
    pub fn push(&mut self, value: Value) {
        let next = self
            .entries
            .iter()
            .filter_map(|(key, _)| match key {
                ArrayKey::Index(i) => Some(i + 1),
                ArrayKey::Name(_) => None,
            })
            .max()
            .unwrap_or(0);
        self.entries.push((ArrayKey::Index(next), value));
    }

    /// Insert or overwrite the entry for `key`
    pub fn insert(&mut self, key: ArrayKey, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    #[must_use]
    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ArrayKey, Value)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Object instance: class name plus public properties
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Object {
    pub class: String,
    pub properties: Vec<(String, Value)>,
}

impl Object {
    #[must_use]
    pub fn new(class: impl Into<String>) -> Self {
        Self { class: class.into(), properties: Vec::new() }
    }

    /// Throwable with a `message` property
    #[must_use]
    pub fn exception(class: impl Into<String>, message: impl Into<String>) -> Self {
        let mut object = Self::new(class);
        object.properties.push(("message".to_string(), Value::String(message.into())));
        object
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[must_use]
    pub fn is_instance_of(&self, class: &str) -> bool {
        self.class.eq_ignore_ascii_case(class)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.property("message") {
            Some(Value::String(message)) => write!(f, "{}: {message}", self.class),
            _ => write!(f, "{}", self.class),
        }
    }
}

/// Return type declared by a function
#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredType {
    Void,
    Mixed,
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    /// `object` when `None`, otherwise a specific class
    Object(Option<String>),
    Nullable(Box<DeclaredType>),
    Union(Vec<DeclaredType>),
}

impl DeclaredType {
    /// Whether `value` may be returned from a function declaring this type
    ///
    /// Types are matched exactly; no scalar coercion (`int` into `float`,
    /// numeric strings, ...) is applied.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (DeclaredType::Void, _) => false,
            (DeclaredType::Mixed, _)
            | (DeclaredType::Null, Value::Null)
            | (DeclaredType::Bool, Value::Bool(_))
            | (DeclaredType::Int, Value::Int(_))
            | (DeclaredType::Float, Value::Float(_))
            | (DeclaredType::String, Value::String(_))
            | (DeclaredType::Array, Value::Array(_))
            | (DeclaredType::Object(None), Value::Object(_)) => true,
            (DeclaredType::Object(Some(class)), Value::Object(object)) => object.is_instance_of(class),
            (DeclaredType::Nullable(inner), value) => value.is_null() || inner.accepts(value),
            (DeclaredType::Union(types), value) => types.iter().any(|t| t.accepts(value)),
            _ => false,
        }
    }
}
