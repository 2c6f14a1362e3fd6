use apm_agent::domain::{Bailout, HookError};
use apm_agent::hooks::{
    hook, Array, ArrayKey, CallFrame, DeclaredType, EngineState, ExceptionState, FunctionDescriptor, FunctionKind,
    FunctionTable, InterceptionDispatcher, NativeHandler, Value,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Function tables of a small simulated host engine
#[derive(Default)]
struct SimulatedHost {
    classes: HashSet<String>,
    functions: HashMap<(String, String), FunctionDescriptor>,
    natives: HashMap<(String, String), NativeHandler>,
    wrapped: HashSet<(String, String)>,
}

fn lookup_key(class_name: &str, function_name: &str) -> (String, String) {
    (class_name.to_ascii_lowercase(), function_name.to_ascii_lowercase())
}

impl SimulatedHost {
    fn with_strlen() -> Self {
        let mut host = Self::default();
        let mut strlen = FunctionDescriptor::new(None, "strlen", FunctionKind::Native);
        strlen.parameters = vec!["string".to_string()];
        strlen.return_type = Some(DeclaredType::Int);
        host.functions.insert(lookup_key("", "strlen"), strlen);
        host.natives.insert(lookup_key("", "strlen"), native_strlen);
        host
    }

    fn add_user_method(&mut self, function: FunctionDescriptor) {
        let class = function.class_name.clone().unwrap_or_default();
        self.classes.insert(class.to_ascii_lowercase());
        self.functions.insert(lookup_key(&class, &function.name), function);
    }

    /// What the engine does for `strlen(...)`: trampoline when wrapped, else native
    fn call_strlen(&self, dispatcher: &InterceptionDispatcher, engine: &mut ExceptionState, arg: &str) -> Value {
        let function = &self.functions[&lookup_key("", "strlen")];
        let mut frame = CallFrame::new(function, vec![Value::String(arg.to_string())]);
        if self.wrapped.contains(&lookup_key("", "strlen")) {
            dispatcher.call_native(engine, &mut frame).unwrap()
        } else {
            native_strlen(engine, &mut frame).unwrap()
        }
    }
}

impl FunctionTable for SimulatedHost {
    fn class_exists(&self, class_name: &str) -> bool {
        self.classes.contains(&class_name.to_ascii_lowercase())
    }

    fn find_function(&self, class_name: &str, function_name: &str) -> Option<FunctionDescriptor> {
        self.functions.get(&lookup_key(class_name, function_name)).cloned()
    }

    fn wrap_native(&mut self, class_name: &str, function_name: &str) -> Option<NativeHandler> {
        let key = lookup_key(class_name, function_name);
        if self.wrapped.insert(key.clone()) {
            self.natives.get(&key).copied()
        } else {
            None
        }
    }
}

fn native_strlen(_: &mut dyn EngineState, frame: &mut CallFrame<'_>) -> Result<Value, Bailout> {
    match frame.args.first() {
        Some(Value::String(s)) => Ok(Value::Int(i64::try_from(s.len()).unwrap())),
        _ => Ok(Value::Null),
    }
}

fn started_dispatcher() -> InterceptionDispatcher {
    let mut dispatcher = InterceptionDispatcher::new();
    dispatcher.scope_mut().on_request_start();
    dispatcher
}

#[test]
fn test_strlen_hooks_patch_argument_and_return_value() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let observed = Rc::new(RefCell::new(Vec::new()));

    let pre_seen = Rc::clone(&observed);
    let pre = hook(move |args| {
        pre_seen.borrow_mut().push(("pre", args[1].clone(), args[3].clone()));
        let mut patch = Array::new();
        patch.insert(ArrayKey::Name("string".to_string()), Value::String("abcdef".to_string()));
        Ok(Value::Array(patch))
    });
    let post_seen = Rc::clone(&observed);
    let post = hook(move |args| {
        post_seen.borrow_mut().push(("post", args[1].clone(), args[2].clone()));
        Ok(Value::Int(100))
    });

    assert!(dispatcher.instrument_function(&mut host, "", "STRLEN", Some(pre), Some(post)));

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "abc"), Value::Int(100));

    let observed = observed.borrow();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0].1, Value::Array(Array::list([Value::String("abc".to_string())])));
    assert_eq!(observed[0].2, Value::String("strlen".to_string()));
    // the post-hook sees the patched argument and the original's result
    assert_eq!(observed[1].1, Value::Array(Array::list([Value::String("abcdef".to_string())])));
    assert_eq!(observed[1].2, Value::Int(6));
}

#[test]
fn test_observing_hooks_leave_strlen_result_alone() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let pre_seen = Rc::clone(&seen);
    let pre = hook(move |args| {
        pre_seen.borrow_mut().push(args.to_vec());
        Ok(Value::Null)
    });
    let post_seen = Rc::clone(&seen);
    let post = hook(move |args| {
        post_seen.borrow_mut().push(args.to_vec());
        Ok(Value::Null)
    });
    assert!(dispatcher.instrument_function(&mut host, "", "strlen", Some(pre), Some(post)));

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "abc"), Value::Int(3));

    let seen = seen.borrow();
    let (pre_args, post_args) = (&seen[0], &seen[1]);
    assert_eq!(pre_args.len(), 6);
    assert_eq!(pre_args[1], Value::Array(Array::list([Value::String("abc".to_string())])));
    assert_eq!(pre_args[3], Value::String("strlen".to_string()));
    assert_eq!(post_args.len(), 8);
    assert_eq!(post_args[2], Value::Int(3));
    assert_eq!(post_args[3], Value::Null);
}

#[test]
fn test_throwing_pre_hook_leaves_call_untouched() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let pre = hook(|_| Err(HookError::thrown("RuntimeException", "boom")));
    assert!(dispatcher.instrument_function(&mut host, "", "strlen", Some(pre), None));

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "abcd"), Value::Int(4));
    assert_eq!(engine, ExceptionState::default());
}

#[test]
fn test_post_hook_override_of_wrong_type_is_ignored() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let post = hook(|_| Ok(Value::String("not an int".to_string())));
    assert!(dispatcher.instrument_function(&mut host, "", "strlen", None, Some(post)));

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "ab"), Value::Int(2));
}

#[test]
fn test_instrumenting_twice_chains_hooks_and_keeps_original() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let order = Rc::new(RefCell::new(Vec::new()));

    for label in ["first", "second"] {
        let order = Rc::clone(&order);
        let pre = hook(move |_| {
            order.borrow_mut().push(label);
            Ok(Value::Null)
        });
        assert!(dispatcher.instrument_function(&mut host, "", "strlen", Some(pre), None));
    }

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "xyz"), Value::Int(3));
    assert_eq!(*order.borrow(), vec!["first", "second"]);
    assert_eq!(dispatcher.handlers().len(), 1);
}

#[test]
fn test_unresolvable_targets_are_rejected() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();

    assert!(!dispatcher.instrument_function(&mut host, "Missing\\Class", "run", None, None));
    assert!(!dispatcher.instrument_function(&mut host, "", "no_such_function", None, None));
    assert!(dispatcher.handlers().is_empty());
}

#[test]
fn test_interface_hooks_cover_implementations() {
    let mut host = SimulatedHost::default();
    let interface_method = FunctionDescriptor::new(Some("Psr\\Log\\LoggerInterface"), "log", FunctionKind::User);
    host.add_user_method(interface_method);

    let mut dispatcher = started_dispatcher();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let pre_calls = Rc::clone(&calls);
    let pre = hook(move |args| {
        pre_calls.borrow_mut().push(args[2].clone());
        Ok(Value::Null)
    });
    assert!(dispatcher.instrument_function(&mut host, "Psr\\Log\\LoggerInterface", "log", Some(pre), None));

    let mut implementation = FunctionDescriptor::new(Some("App\\FileLogger"), "log", FunctionKind::User);
    implementation.interfaces = vec!["Psr\\Log\\LoggerInterface".to_string()];

    let handlers = dispatcher.register_observer(&implementation);
    let begin = handlers.begin.unwrap();
    assert!(handlers.end.is_none());

    let mut engine = ExceptionState::default();
    let mut frame = CallFrame::new(&implementation, vec![Value::String("info".to_string())]);
    begin(&dispatcher, &mut engine, &mut frame);

    assert_eq!(*calls.borrow(), vec![Value::String("App\\FileLogger".to_string())]);
}

#[test]
fn test_request_end_forgets_hooks() {
    let mut host = SimulatedHost::with_strlen();
    let mut dispatcher = started_dispatcher();
    let pre = hook(|_| Ok(Value::Array(Array::list([Value::String("patched".to_string())]))));
    assert!(dispatcher.instrument_function(&mut host, "", "strlen", Some(pre), None));

    dispatcher.scope_mut().on_request_end();

    let mut engine = ExceptionState::default();
    assert_eq!(host.call_strlen(&dispatcher, &mut engine, "abc"), Value::Int(3));
}
