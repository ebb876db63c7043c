//! Execution contexts: the public face of an engine
//!
//! The top-level [`Context`] owns its engine. Contexts made with
//! [`Context::new_thread`] borrow it, and fail with
//! [`EngineDestroyed`](crate::LifecycleError::EngineDestroyed) once every
//! clone of the top-level context is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rquickjs::context::EvalOptions;
use rquickjs::Value;
use tandem_core::{Handle, HostException};
use tracing::{debug, trace};

use crate::bridge::{self, HostFunction, Invocable};
use crate::config::Config;
use crate::engine::{ContextLink, ContextState, Engine, SuspendToken};
use crate::error::{Error, Result};
use crate::hooks::TypeHook;
use crate::marshal;
use crate::proxy::ProxyHandle;
use crate::scope::Scope;
use crate::value::{HostValue, Kind};

/// Builder for a top-level [`Context`] and the engine behind it.
#[derive(Default)]
pub struct ContextBuilder {
    config: Config,
    hooks: Vec<Arc<dyn TypeHook>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.module_path = Some(path.into());
        self
    }

    pub fn force_strict(mut self, force: bool) -> Self {
        self.config.force_strict = force;
        self
    }

    /// Append a type hook. Hooks are consulted in the order added.
    pub fn hook(mut self, hook: impl TypeHook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Context> {
        let link = Engine::create(self.config, self.hooks)?;
        Ok(Context { link })
    }
}

/// Handle to one execution context.
///
/// Clones refer to the same context. A context is destroyed once its last
/// handle is dropped and a later [`gc`](Context::gc) sweeps it.
#[derive(Clone)]
pub struct Context {
    link: Arc<ContextLink>,
}

impl Context {
    /// New engine with default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Arena handle identifying this context within its engine.
    pub fn id(&self) -> Handle {
        self.link.id()
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.link.engine()
    }

    fn enter<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'a, 'js> FnOnce(&Scope<'a, 'js>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.engine()?.enter(self.link.id(), f)
    }

    // ---- evaluation ----

    /// Evaluate `source` as global code. The completion value is pushed onto
    /// the value stack and returned converted; if it does not convert it
    /// stays pushed.
    pub fn eval(&self, source: &str) -> Result<HostValue> {
        self.eval_with(source, false)
    }

    pub fn eval_with(&self, source: &str, strict: bool) -> Result<HostValue> {
        let strict = self.engine()?.config().strict(strict);
        trace!(context = %self.id(), strict, bytes = source.len(), "eval");
        let source = source.to_string();
        self.enter(move |scope| {
            let value: Value = scope.check(scope.ctx.eval_with_options(source, options(strict)))?;
            complete(scope, value)
        })
    }

    /// Evaluate a script file, leaving the completion value on the stack
    /// like [`eval`](Self::eval). Errors raised by its code report `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<HostValue> {
        self.load_with(path, false)
    }

    pub fn load_with(&self, path: impl AsRef<Path>, strict: bool) -> Result<HostValue> {
        let path = path.as_ref().to_path_buf();
        let strict = self.engine()?.config().strict(strict);
        debug!(context = %self.id(), path = %path.display(), strict, "loading script");
        self.enter(move |scope| {
            let evaluated: rquickjs::Result<Value> =
                scope.ctx.eval_file_with_options(&path, options(strict));
            let value = scope.check_file(evaluated, &path)?;
            complete(scope, value)
        })
    }

    // ---- globals ----

    /// Read a global. Plain containers come back as copies; use
    /// [`proxy`](Self::proxy) for a live view.
    pub fn get(&self, name: &str) -> Result<HostValue> {
        let name = name.to_string();
        self.enter(move |scope| {
            let value = scope.global(&name)?;
            marshal::from_js(scope, value)
        })
    }

    /// Assign a global. A declared thread-only name is initialized for this
    /// context instead.
    pub fn set(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        let value = value.into();
        let thread_only = self.engine()?.is_thread_only(name);
        let name = name.to_string();
        self.enter(move |scope| {
            if thread_only {
                return bridge::write_thread_only(scope, &name, &value);
            }
            let value = marshal::to_js(scope, &value)?;
            scope.check(scope.ctx.globals().set(name.as_str(), value))
        })
    }

    /// Bind a host closure taking exactly `arity` arguments to a global.
    pub fn register<F>(&self, name: &str, arity: usize, callback: F) -> Result<()>
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostException> + Send + Sync + 'static,
    {
        self.set(name, HostFunction::new(name, arity, callback))
    }

    /// Host handle to the script function bound to global `name`.
    pub fn resolve(&self, name: &str) -> Result<Invocable> {
        let name = name.to_string();
        self.enter(move |scope| {
            let value = scope.global(&name)?;
            if !value.is_function() {
                return Err(Error::InvalidArgument(format!(
                    "global '{name}' is a {}, not a function",
                    marshal::kind_of(scope, &value)?
                )));
            }
            Invocable::capture(scope, value)
        })
    }

    /// Call global function `name` with `args`.
    pub fn call(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let name = name.to_string();
        let args = args.to_vec();
        self.enter(move |scope| {
            let function = scope.global(&name)?;
            if !function.is_function() {
                return Err(Error::InvalidArgument(format!(
                    "global '{name}' is not a function"
                )));
            }
            let argv = bridge::argument_array(scope, &args)?;
            let result: Value = scope.helper("apply", (function, argv))?;
            marshal::from_js(scope, result)
        })
    }

    /// Live view of the object or array bound to global `name`.
    pub fn proxy(&self, name: &str) -> Result<ProxyHandle> {
        let global = name.to_string();
        self.enter(move |scope| {
            let value = scope.global(&global)?;
            let shape = marshal::classify(scope, &value)?;
            if !shape.is_container() {
                return Err(Error::InvalidArgument(format!(
                    "global '{global}' is a {}, not an object or array",
                    marshal::kind_of(scope, &value)?
                )));
            }
            Ok(())
        })?;
        Ok(ProxyHandle::global(Arc::downgrade(&self.link), name))
    }

    // ---- value stack ----

    /// Convert `value` and push it. On failure nothing is pushed.
    pub fn push(&self, value: impl Into<HostValue>) -> Result<()> {
        let value = value.into();
        self.enter(move |scope| {
            let value = marshal::to_js(scope, &value)?;
            scope.helper::<_, ()>("stackPush", (scope.context_key(), value))
        })
    }

    /// Convert and remove the top slot. A slot that fails to convert is
    /// left in place.
    pub fn pop(&self) -> Result<HostValue> {
        self.enter(move |scope| {
            let top = peek_slot(scope)?;
            let value = marshal::from_js(scope, top)?;
            scope.helper::<_, Value>("stackPop", (scope.context_key(),))?;
            Ok(value)
        })
    }

    pub fn peek(&self) -> Result<HostValue> {
        self.enter(move |scope| {
            let top = peek_slot(scope)?;
            marshal::from_js(scope, top)
        })
    }

    /// Tag of the top slot.
    pub fn type_of(&self) -> Result<Kind> {
        self.enter(move |scope| {
            let top = peek_slot(scope)?;
            marshal::kind_of(scope, &top)
        })
    }

    /// Depth of this context's value stack.
    pub fn len(&self) -> Result<usize> {
        self.enter(move |scope| scope.helper("stackLen", (scope.context_key(),)))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---- threads and lifecycle ----

    /// New context on the same engine. With `isolated` it gets a fresh
    /// global environment; otherwise it shares this one's.
    pub fn new_thread(&self, isolated: bool) -> Result<Context> {
        let link = self.engine()?.new_context(self.link.id(), isolated)?;
        Ok(Context { link })
    }

    pub fn is_isolated(&self) -> bool {
        self.engine()
            .is_ok_and(|engine| engine.is_isolated(self.link.id()))
    }

    /// Mark this context suspended. Allowed from inside a host callable
    /// running on it; the engine then serves other contexts while the
    /// callable waits for [`resume`](Self::resume).
    pub fn suspend(&self) -> Result<SuspendToken> {
        self.engine()?.suspend(self.link.id())
    }

    pub fn resume(&self, token: &SuspendToken) -> Result<()> {
        self.engine()?.resume(self.link.id(), token)
    }

    pub fn state(&self) -> ContextState {
        match self.engine() {
            Ok(engine) => engine.context_state(self.link.id()),
            Err(_) => ContextState::Destroyed,
        }
    }

    /// Full collection: finalizes unreachable script objects (dropping the
    /// host values they held) and sweeps destroyed contexts.
    pub fn gc(&self) -> Result<()> {
        self.engine()?.gc()
    }

    // ---- thread-only bindings ----

    /// Declare a global whose value is private to each context. Reading it
    /// before [`init_thread_only`](Self::init_thread_only) raises
    /// `Error::NotInitialized`.
    pub fn declare_thread_only(&self, name: &str) -> Result<()> {
        let engine = self.engine()?;
        if engine.is_thread_only(name) {
            return Ok(());
        }
        let global = name.to_string();
        let taken = self.enter(move |scope| scope.has_global(&global))?;
        if taken {
            return Err(Error::InvalidArgument(format!(
                "global '{name}' already exists"
            )));
        }
        engine.declare_thread_only(name);
        Ok(())
    }

    pub fn init_thread_only(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        if !self.engine()?.is_thread_only(name) {
            return Err(Error::InvalidArgument(format!(
                "'{name}' is not a thread-only binding"
            )));
        }
        let value = value.into();
        let name = name.to_string();
        self.enter(move |scope| bridge::write_thread_only(scope, &name, &value))
    }

    // ---- hooks ----

    /// Append a type hook to this engine's registry.
    pub fn register_hook(&self, hook: impl TypeHook) -> Result<()> {
        self.engine()?.register_hook(Arc::new(hook));
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.link.id())
            .field("engine", &self.link.engine_id())
            .field("owner", &self.link.is_owner())
            .finish()
    }
}

fn options(strict: bool) -> EvalOptions {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = strict;
    options
}

/// Push an evaluation's completion value, then convert it.
fn complete<'js>(scope: &Scope<'_, 'js>, value: Value<'js>) -> Result<HostValue> {
    scope.helper::<_, ()>("stackPush", (scope.context_key(), value.clone()))?;
    marshal::from_js(scope, value)
}

fn peek_slot<'js>(scope: &Scope<'_, 'js>) -> Result<Value<'js>> {
    let key = scope.context_key();
    let depth: usize = scope.helper("stackLen", (key.as_str(),))?;
    if depth == 0 {
        return Err(Error::StackUnderflow);
    }
    scope.helper("stackPeek", (key,))
}
