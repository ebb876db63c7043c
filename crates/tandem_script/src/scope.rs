//! Per-entry view of one realm
//!
//! Everything the bridge keeps on the script side lives in a hidden registry
//! object installed once per realm (`globalThis.__tandem__`): captured values,
//! the per-context value stacks, thread-only bindings, and the small helpers
//! the host calls to inspect or build script values. Host code only ever holds
//! [`Handle`]s into that registry, never engine references.

use std::path::Path;
use std::sync::{Arc, Weak};

use rquickjs::context::EvalOptions;
use rquickjs::function::IntoArgs;
use rquickjs::{Ctx, FromJs, Function, Object, Value};
use tandem_core::Handle;

use crate::engine::{ContextLink, Engine, HostSlotGuard, SlotRef};
use crate::error::{Error, LifecycleError, Result};
use crate::translate;

pub(crate) const REGISTRY: &str = "__tandem__";

const PRELUDE: &str = r#"
(function (global) {
  'use strict';
  var REF = '__tandem_ref__';
  var ANCHOR = '__tandem_anchor__';
  var SUBMS = '__tandem_subms__';
  var own = Function.prototype.call.bind(Object.prototype.hasOwnProperty);
  var slots = Object.create(null);
  var stacks = Object.create(null);
  var threadOnly = Object.create(null);

  function hide(o, k, v) {
    Object.defineProperty(o, k, { value: v, enumerable: false, configurable: true, writable: true });
    return o;
  }

  var helpers = {
    hold: function (key, v) { slots[key] = v; },
    holds: function (key) { return own(slots, key); },
    fetch: function (key) { return slots[key]; },
    release: function (key) { delete slots[key]; },

    stackPush: function (key, v) { (stacks[key] || (stacks[key] = [])).push(v); },
    stackPop: function (key) { return stacks[key].pop(); },
    stackPeek: function (key) { var s = stacks[key]; return s[s.length - 1]; },
    stackLen: function (key) { var s = stacks[key]; return s ? s.length : 0; },

    threadOnlySet: function (key, name, v) {
      (threadOnly[key] || (threadOnly[key] = Object.create(null)))[name] = v;
    },
    threadOnlyHas: function (key, name) { var t = threadOnly[key]; return t !== undefined && own(t, name); },
    threadOnlyGet: function (key, name) { return threadOnly[key][name]; },
    releaseContext: function (key) { delete stacks[key]; delete threadOnly[key]; },
    defineGetter: function (name, getter) {
      Object.defineProperty(global, name, { get: getter, enumerable: false, configurable: true });
    },

    tagRef: function (o, ref, anchor, hostType) {
      hide(o, REF, ref);
      if (anchor !== undefined) hide(o, ANCHOR, anchor);
      if (hostType !== undefined) hide(o, 'hostType', hostType);
      return o;
    },
    refOf: function (v) {
      if (v !== null && (typeof v === 'object' || typeof v === 'function') && own(v, REF)) return v[REF];
      return undefined;
    },

    makeDate: function (ms, subNanos) {
      var d = new Date(ms);
      if (subNanos) hide(d, SUBMS, [d.getTime(), subNanos]);
      return d;
    },
    dateParts: function (d) {
      var t = d.getTime();
      var s = own(d, SUBMS) ? d[SUBMS] : null;
      return [t, s !== null && s[0] === t ? s[1] : 0];
    },
    isDate: function (v) { return v instanceof Date; },
    isError: function (v) { return v instanceof Error; },
    makeError: function (name, message, hostType) {
      var e = new Error(message);
      hide(e, 'name', name);
      if (hostType !== undefined) e.hostType = hostType;
      return e;
    },

    hasGlobal: function (name) { return name in global; },
    construct: function (C, args) { return Reflect.construct(C, args); },
    isInstance: function (v, C) { return v instanceof C; },
    constructorName: function (v) {
      var c = v.constructor;
      return typeof c === 'function' ? c.name : undefined;
    },
    apply: function (f, args) { return f.apply(undefined, args); },

    splice: function (a, start, count, items) {
      return Array.prototype.splice.apply(a, [start, count].concat(items));
    },
    ownKeys: function (o) { return Object.keys(o); },
    hasOwn: function (o, k) { return own(o, k); },
    has: function (o, k) { return k in o; },
    remove: function (o, k) { return delete o[k]; }
  };

  Object.defineProperty(global, '__tandem__', { value: Object.freeze(helpers), enumerable: false });
})(globalThis);
"#;

pub(crate) fn install_prelude(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = true;
    ctx.eval_with_options::<(), _>(PRELUDE, options)
}

/// Typed access to the registry helpers.
#[derive(Clone)]
pub(crate) struct Helpers<'js> {
    object: Object<'js>,
}

impl<'js> Helpers<'js> {
    pub(crate) fn load(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let object = ctx.globals().get(REGISTRY)?;
        Ok(Self { object })
    }

    pub(crate) fn call<A, R>(&self, name: &str, args: A) -> rquickjs::Result<R>
    where
        A: IntoArgs<'js>,
        R: FromJs<'js>,
    {
        let function: Function<'js> = self.object.get(name)?;
        function.call(args)
    }
}

/// One entry into the engine: the realm being executed, the context that
/// entered it, and the engine bookkeeping behind them.
pub(crate) struct Scope<'a, 'js> {
    pub(crate) ctx: Ctx<'js>,
    pub(crate) engine: &'a Arc<Engine>,
    pub(crate) realm: Handle,
    pub(crate) context: Handle,
    pub(crate) link: Weak<ContextLink>,
    helpers: Helpers<'js>,
}

impl<'a, 'js> Scope<'a, 'js> {
    pub(crate) fn new(
        ctx: Ctx<'js>,
        engine: &'a Arc<Engine>,
        realm: Handle,
        context: Handle,
        link: Weak<ContextLink>,
    ) -> Result<Self> {
        let helpers = Helpers::load(&ctx)
            .map_err(|err| Error::Interpreter(format!("registry unavailable: {err}")))?;
        Ok(Self {
            ctx,
            engine,
            realm,
            context,
            link,
            helpers,
        })
    }

    /// Scope for a host callback running under the calling thread's entry.
    pub(crate) fn for_callback(ctx: Ctx<'js>, engine: &'a Arc<Engine>) -> Result<Self> {
        let (context, realm, link) = engine.active()?;
        Self::new(ctx, engine, realm, context, link)
    }

    pub(crate) fn helpers(&self) -> &Helpers<'js> {
        &self.helpers
    }

    /// Key of this context's value stack and thread-only bindings.
    pub(crate) fn context_key(&self) -> String {
        self.context.to_key()
    }

    pub(crate) fn check<T>(&self, result: rquickjs::Result<T>) -> Result<T> {
        result.map_err(|err| translate::caught(self, err, None))
    }

    /// Like [`check`](Self::check), attributing errors to a loaded file.
    pub(crate) fn check_file<T>(&self, result: rquickjs::Result<T>, file: &Path) -> Result<T> {
        result.map_err(|err| translate::caught(self, err, Some(file)))
    }

    pub(crate) fn helper<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoArgs<'js>,
        R: FromJs<'js>,
    {
        self.check(self.helpers.call(name, args))
    }

    pub(crate) fn has_global(&self, name: &str) -> Result<bool> {
        self.helper("hasGlobal", (name,))
    }

    pub(crate) fn global(&self, name: &str) -> Result<Value<'js>> {
        if !self.has_global(name)? {
            return Err(Error::not_found(format!("global '{name}'")));
        }
        self.check(self.ctx.globals().get(name))
    }

    /// Host arena handle behind a wrapped host value, if `value` is one.
    pub(crate) fn host_ref(&self, value: &Value<'js>) -> Result<Option<Handle>> {
        let key: Option<String> = self.helper("refOf", (value.clone(),))?;
        Ok(key.as_deref().and_then(Handle::from_key))
    }

    /// Mark `target` as standing for host slot `handle`. The anchor, when
    /// given, lives as long as the script object does.
    pub(crate) fn tag(
        &self,
        target: &Value<'js>,
        handle: Handle,
        anchor: Option<Function<'js>>,
        host_type: Option<&str>,
    ) -> Result<()> {
        self.helper::<_, Value>(
            "tagRef",
            (target.clone(), handle.to_key(), anchor, host_type),
        )?;
        Ok(())
    }

    /// Script function whose only job is to own `guard`. Attached to a
    /// wrapper object, it ties the host slot's lifetime to the wrapper's.
    pub(crate) fn anchor(&self, guard: HostSlotGuard) -> Result<Function<'js>> {
        self.check(Function::new(self.ctx.clone(), move || {
            let _ = &guard;
        }))
    }

    /// Keep `value` alive in the registry until the returned slot is dropped.
    pub(crate) fn capture(&self, value: Value<'js>) -> Result<SlotRef> {
        let slot = self.engine.new_script_slot(self.realm);
        self.helper::<_, ()>("hold", (slot.key(), value))?;
        Ok(slot)
    }

    pub(crate) fn fetch(&self, slot: &SlotRef) -> Result<Value<'js>> {
        if slot.engine_id() != self.engine.id() {
            return Err(LifecycleError::ForeignEngine.into());
        }
        if slot.realm() != self.realm {
            return Err(Error::conversion(
                "script value",
                "it belongs to another realm of this engine",
            ));
        }
        let key = slot.key();
        if !self.helper::<_, bool>("holds", (key.as_str(),))? {
            return Err(LifecycleError::StaleHandle {
                handle: slot.handle(),
            }
            .into());
        }
        self.helper("fetch", (key,))
    }
}
