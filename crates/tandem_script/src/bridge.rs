//! Function bridge
//!
//! Host closures become script functions, script functions become
//! [`Invocable`] handles, and opaque host objects become tagged script
//! objects. Each wrapper owns a [`HostSlotGuard`], so the host side is
//! released once the collector has finalized the wrapper.

use std::fmt;
use std::sync::{Arc, Weak};

use rquickjs::function::Rest;
use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use tandem_core::{exception, HostException};
use tracing::trace;

use crate::engine::{ContextLink, Engine, HostSlot, HostSlotGuard, SlotRef};
use crate::error::{Error, LifecycleError, Result};
use crate::marshal;
use crate::scope::Scope;
use crate::translate;
use crate::value::{HostObject, HostValue};

type Callback = dyn Fn(&[HostValue]) -> Result<HostValue, HostException> + Send + Sync;

struct FunctionInner {
    name: String,
    arity: Option<usize>,
    callback: Box<Callback>,
}

/// Host callable exposed to script.
///
/// A function with a declared arity rejects calls with any other argument
/// count before the closure runs; a variadic one takes whatever it is given.
#[derive(Clone)]
pub struct HostFunction {
    inner: Arc<FunctionInner>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, arity: usize, callback: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostException> + Send + Sync + 'static,
    {
        Self::build(name.into(), Some(arity), Box::new(callback))
    }

    pub fn variadic<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostException> + Send + Sync + 'static,
    {
        Self::build(name.into(), None, Box::new(callback))
    }

    fn build(name: String, arity: Option<usize>, callback: Box<Callback>) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                name,
                arity,
                callback,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `None` for variadic functions.
    pub fn arity(&self) -> Option<usize> {
        self.inner.arity
    }

    /// Call the closure directly, without any arity check.
    pub fn call(&self, args: &[HostValue]) -> Result<HostValue, HostException> {
        (self.inner.callback)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.inner.name)
            .field("arity", &self.inner.arity)
            .finish()
    }
}

struct InvocableInner {
    link: Weak<ContextLink>,
    slot: SlotRef,
}

/// Host-side handle to a script function.
#[derive(Clone)]
pub struct Invocable {
    inner: Arc<InvocableInner>,
}

impl Invocable {
    pub(crate) fn capture<'js>(scope: &Scope<'_, 'js>, function: Value<'js>) -> Result<Self> {
        let slot = scope.capture(function)?;
        Ok(Self {
            inner: Arc::new(InvocableInner {
                link: scope.link.clone(),
                slot,
            }),
        })
    }

    /// The script function itself, in `scope`'s realm.
    pub(crate) fn restore<'js>(&self, scope: &Scope<'_, 'js>) -> Result<Value<'js>> {
        scope.fetch(&self.inner.slot)
    }

    /// Call the function with `args` converted left to right. Script errors
    /// come back as `Error::Script`, host exceptions that crossed the script
    /// as `Error::Foreign`.
    pub fn call(&self, args: &[HostValue]) -> Result<HostValue> {
        let link = self
            .inner
            .link
            .upgrade()
            .ok_or(LifecycleError::ContextDestroyed)?;
        let engine = link.engine()?;
        let this = self.clone();
        let args = args.to_vec();
        engine.enter(link.id(), move |scope| {
            let function = this.restore(scope)?;
            let argv = argument_array(scope, &args)?;
            let result = scope.helper::<_, Value>("apply", (function, argv))?;
            marshal::from_js(scope, result)
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Invocable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocable")
            .field("slot", &self.inner.slot.handle())
            .finish()
    }
}

/// Script function that calls `function`.
pub(crate) fn wrap_function<'js>(
    scope: &Scope<'_, 'js>,
    function: &HostFunction,
) -> Result<Value<'js>> {
    let handle = scope.engine.store_host(HostSlot::Function(function.clone()));
    let guard = HostSlotGuard::new(scope.engine, handle);
    let engine = Arc::downgrade(scope.engine);
    let callable = function.clone();

    let wrapper = Function::new(
        scope.ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let _ = &guard;
            dispatch(ctx, &engine, &callable, args.0)
        },
    );
    let value = scope.check(wrapper)?.into_value();
    scope.tag(&value, handle, None, None)?;
    Ok(value)
}

fn dispatch<'js>(
    ctx: Ctx<'js>,
    engine: &Weak<Engine>,
    function: &HostFunction,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let Some(engine) = engine.upgrade() else {
        return Err(Exception::throw_message(&ctx, "the engine has been destroyed"));
    };
    let scope = match Scope::for_callback(ctx.clone(), &engine) {
        Ok(scope) => scope,
        Err(err) => return Err(Exception::throw_message(&ctx, &err.to_string())),
    };
    invoke(&scope, function, args).map_err(|err| translate::throw(&scope, err))
}

fn invoke<'js>(
    scope: &Scope<'_, 'js>,
    function: &HostFunction,
    args: Vec<Value<'js>>,
) -> Result<Value<'js>> {
    if let Some(stale) = exception::take_current() {
        trace!(exception = %stale, "cleared a stale current exception");
    }
    if let Some(expected) = function.arity() {
        if expected != args.len() {
            return Err(Error::Arity {
                name: function.name().to_string(),
                expected,
                given: args.len(),
            });
        }
    }

    let args = args
        .into_iter()
        .map(|arg| marshal::from_js(scope, arg))
        .collect::<Result<Vec<_>>>()?;

    // Runs on the thread that entered the engine.
    let outcome = scope.engine.call_host(function, args)?;
    scope.engine.ensure_running(scope.context)?;

    match outcome {
        Ok(value) => marshal::to_js(scope, &value),
        Err(exc) => {
            // Current until the error object is thrown into script.
            exception::raise(exc.clone());
            Err(Error::Foreign(exc))
        }
    }
}

/// Opaque script object standing for `object`.
pub(crate) fn wrap_pointer<'js>(scope: &Scope<'_, 'js>, object: &HostObject) -> Result<Value<'js>> {
    let handle = scope.engine.store_host(HostSlot::Pointer(object.clone()));
    let anchor = scope.anchor(HostSlotGuard::new(scope.engine, handle))?;
    let target = scope.check(Object::new(scope.ctx.clone()))?.into_value();
    scope.tag(&target, handle, Some(anchor), Some(object.type_name()))?;
    Ok(target)
}

/// Define the global accessor for thread-only binding `name` in this realm.
pub(crate) fn install_thread_only<'js>(scope: &Scope<'_, 'js>, name: &str) -> Result<()> {
    let engine = Arc::downgrade(scope.engine);
    let binding = name.to_string();
    let getter = Function::new(
        scope.ctx.clone(),
        move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            read_thread_only(ctx, &engine, &binding)
        },
    );
    let getter = scope.check(getter)?;
    scope.helper::<_, ()>("defineGetter", (name, getter))
}

fn read_thread_only<'js>(
    ctx: Ctx<'js>,
    engine: &Weak<Engine>,
    name: &str,
) -> rquickjs::Result<Value<'js>> {
    let Some(engine) = engine.upgrade() else {
        return Err(Exception::throw_message(&ctx, "the engine has been destroyed"));
    };
    let scope = match Scope::for_callback(ctx.clone(), &engine) {
        Ok(scope) => scope,
        Err(err) => return Err(Exception::throw_message(&ctx, &err.to_string())),
    };
    let key = scope.context_key();
    let read = || -> Result<Value<'js>> {
        if !scope.helper::<_, bool>("threadOnlyHas", (key.as_str(), name))? {
            return Err(Error::NotInitialized {
                name: name.to_string(),
            });
        }
        scope.helper("threadOnlyGet", (key.as_str(), name))
    };
    read().map_err(|err| translate::throw(&scope, err))
}

/// Set this context's value of a thread-only binding.
pub(crate) fn write_thread_only<'js>(
    scope: &Scope<'_, 'js>,
    name: &str,
    value: &HostValue,
) -> Result<()> {
    let value = marshal::to_js(scope, value)?;
    scope.helper::<_, ()>("threadOnlySet", (scope.context_key(), name, value))
}

/// Script array of converted arguments.
pub(crate) fn argument_array<'js>(scope: &Scope<'_, 'js>, args: &[HostValue]) -> Result<Array<'js>> {
    let array = scope.check(Array::new(scope.ctx.clone()))?;
    for (index, arg) in args.iter().enumerate() {
        let value = marshal::to_js(scope, arg)?;
        scope.check(array.set(index, value))?;
    }
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    fn add() -> HostFunction {
        HostFunction::new("add", 2, |args| {
            let sum = args.iter().filter_map(HostValue::as_f64).sum::<f64>();
            Ok(HostValue::Number(sum))
        })
    }

    #[test]
    fn test_direct_call() {
        let f = add();
        assert_eq!(f.arity(), Some(2));
        assert_eq!(
            f.call(&[1.into(), 2.into()]).unwrap(),
            HostValue::Number(3.0)
        );
    }

    #[test]
    fn test_fixed_arity_from_script() {
        let ctx = Context::new().unwrap();
        ctx.set("add", add()).unwrap();
        assert_eq!(ctx.eval("add(1, 2)").unwrap(), HostValue::Number(3.0));

        let err = ctx.eval("add(1)").unwrap_err();
        assert!(matches!(
            err,
            Error::Arity {
                expected: 2,
                given: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_variadic_from_script() {
        let ctx = Context::new().unwrap();
        let count = HostFunction::variadic("count", |args| Ok(HostValue::from(args.len())));
        ctx.set("count", count).unwrap();
        assert_eq!(ctx.eval("count()").unwrap(), HostValue::Number(0.0));
        assert_eq!(ctx.eval("count(1, 'a', [])").unwrap(), HostValue::Number(3.0));
    }

    #[test]
    fn test_function_identity_round_trip() {
        let ctx = Context::new().unwrap();
        let f = add();
        ctx.push(f.clone()).unwrap();
        match ctx.pop().unwrap() {
            HostValue::Function(back) => assert!(back.ptr_eq(&f)),
            other => panic!("expected a host function, got {other:?}"),
        }
    }

    #[test]
    fn test_invocable_call() {
        let ctx = Context::new().unwrap();
        ctx.eval("function greet(name) { return 'hello ' + name; }").unwrap();
        let greet = ctx.resolve("greet").unwrap();
        assert_eq!(
            greet.call(&["world".into()]).unwrap(),
            HostValue::from("hello world")
        );
    }

    #[test]
    fn test_script_callback_from_host() {
        let ctx = Context::new().unwrap();
        let apply = HostFunction::new("apply", 2, |args| match &args[0] {
            HostValue::ScriptFunction(f) => {
                // The engine is busy with the outer call.
                let err = f.call(&[args[1].clone()]).unwrap_err();
                Ok(HostValue::from(err.to_string()))
            }
            other => Ok(HostValue::from(other.type_name())),
        });
        ctx.set("apply", apply).unwrap();

        let out = ctx.eval("apply(function (x) { return x * 2; }, 21)").unwrap();
        assert!(out.as_str().unwrap().contains("re-entered"));
    }

    #[test]
    fn test_host_exception_crosses_and_returns() {
        let ctx = Context::new().unwrap();
        let exc = HostException::new("app::ValueError", "bad input");
        let raised = exc.clone();
        ctx.register("fail", 0, move |_| Err(raised.clone())).unwrap();

        match ctx.eval("fail()").unwrap_err() {
            Error::Foreign(back) => assert!(back.ptr_eq(&exc)),
            other => panic!("expected a foreign error, got {other:?}"),
        }
        assert!(exception::current_exception().is_none());

        let seen = ctx
            .eval("try { fail(); } catch (e) { [e.name, e.message, e.hostType].join('|') }")
            .unwrap();
        assert_eq!(seen, HostValue::from("app::ValueError|bad input|app::ValueError"));
        assert!(exception::current_exception().is_none());
    }
}
