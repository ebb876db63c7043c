//! Type hooks: user-defined conversions for host and script object types
//!
//! Hooks are tried in registration order and the first `Some` wins.
//!
//! ```ignore
//! struct PointHook;
//!
//! impl TypeHook for PointHook {
//!     fn to_foreign<'a, 'js>(
//!         &self,
//!         object: &HostObject,
//!         ctor: &ConstructorHelper<'a, 'js>,
//!     ) -> Result<Option<ForeignRef<'a, 'js>>> {
//!         let Some(p) = object.downcast_ref::<Point>() else { return Ok(None) };
//!         ctor.construct("Point", &[p.x.into(), p.y.into()]).map(Some)
//!     }
//!
//!     fn to_host<'a, 'js>(
//!         &self,
//!         object: &ForeignObject<'a, 'js>,
//!         types: &TypeHelper<'a, 'js>,
//!     ) -> Result<Option<HostValue>> {
//!         if !types.is_instance(object, "Point")? {
//!             return Ok(None);
//!         }
//!         let x = object.get("x")?.as_f64().unwrap_or_default();
//!         let y = object.get("y")?.as_f64().unwrap_or_default();
//!         Ok(Some(HostValue::Custom(HostObject::new(Point { x, y }))))
//!     }
//! }
//! ```

use rquickjs::{Object, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::marshal;
use crate::scope::Scope;
use crate::value::{HostObject, HostValue};

pub trait TypeHook: Send + Sync + 'static {
    /// Build the script counterpart of `object`, or `None` to pass.
    fn to_foreign<'a, 'js>(
        &self,
        object: &HostObject,
        ctor: &ConstructorHelper<'a, 'js>,
    ) -> Result<Option<ForeignRef<'a, 'js>>> {
        let _ = (object, ctor);
        Ok(None)
    }

    /// Convert a non-plain script object, or `None` to pass.
    fn to_host<'a, 'js>(
        &self,
        object: &ForeignObject<'a, 'js>,
        types: &TypeHelper<'a, 'js>,
    ) -> Result<Option<HostValue>> {
        let _ = (object, types);
        Ok(None)
    }
}

fn resolve_constructor<'js>(scope: &Scope<'_, 'js>, name: &str) -> Result<Value<'js>> {
    let undefined = || Error::UndefinedConstructor {
        name: name.to_string(),
    };
    if !scope.has_global(name)? {
        return Err(undefined());
    }
    let ctor = scope.check(scope.ctx.globals().get::<_, Value>(name))?;
    if ctor.is_function() {
        Ok(ctor)
    } else {
        Err(undefined())
    }
}

/// Builds script objects for [`TypeHook::to_foreign`].
pub struct ConstructorHelper<'a, 'js> {
    scope: &'a Scope<'a, 'js>,
    depth: usize,
}

impl<'a, 'js> ConstructorHelper<'a, 'js> {
    /// `new <name>(...args)` through the global constructor `name`.
    pub fn construct(&self, name: &str, args: &[HostValue]) -> Result<ForeignRef<'a, 'js>> {
        let ctor = resolve_constructor(self.scope, name)?;
        let argv = self.scope.check(rquickjs::Array::new(self.scope.ctx.clone()))?;
        for (index, arg) in args.iter().enumerate() {
            let arg = marshal::to_js_at(self.scope, arg, self.depth + 1)?;
            self.scope.check(argv.set(index, arg))?;
        }
        let value = self.scope.helper("construct", (ctor, argv))?;
        Ok(ForeignRef {
            scope: self.scope,
            value,
            depth: self.depth,
        })
    }

    /// A plain `{}` to fill with [`ForeignRef::set`].
    pub fn object(&self) -> Result<ForeignRef<'a, 'js>> {
        let object = self.scope.check(Object::new(self.scope.ctx.clone()))?;
        Ok(ForeignRef {
            scope: self.scope,
            value: object.into_value(),
            depth: self.depth,
        })
    }
}

/// Script object produced by a hook.
pub struct ForeignRef<'a, 'js> {
    scope: &'a Scope<'a, 'js>,
    value: Value<'js>,
    depth: usize,
}

impl<'a, 'js> ForeignRef<'a, 'js> {
    pub fn set(&self, field: &str, value: impl Into<HostValue>) -> Result<()> {
        let object = self
            .value
            .as_object()
            .ok_or_else(|| Error::conversion("constructed value", "not an object"))?;
        let value = marshal::to_js_at(self.scope, &value.into(), self.depth + 1)?;
        self.scope.check(object.set(field, value))
    }

    pub fn value(&self) -> &Value<'js> {
        &self.value
    }
}

/// Script object offered to [`TypeHook::to_host`].
pub struct ForeignObject<'a, 'js> {
    scope: &'a Scope<'a, 'js>,
    object: Object<'js>,
    depth: usize,
}

impl<'a, 'js> ForeignObject<'a, 'js> {
    /// Field `name` (own or inherited), converted. Missing fields are errors.
    pub fn get(&self, name: &str) -> Result<HostValue> {
        if !self.has(name)? {
            return Err(Error::not_found(format!("field '{name}'")));
        }
        let value = self.scope.check(self.object.get::<_, Value>(name))?;
        marshal::from_js_at(self.scope, value, self.depth + 1)
    }

    pub fn has(&self, name: &str) -> Result<bool> {
        self.scope.helper("has", (self.object.clone(), name))
    }

    /// Own enumerable keys.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.scope.helper("ownKeys", (self.object.clone(),))
    }

    pub fn constructor_name(&self) -> Result<Option<String>> {
        self.scope.helper("constructorName", (self.object.clone(),))
    }

    pub fn object(&self) -> &Object<'js> {
        &self.object
    }
}

/// Type tests for [`TypeHook::to_host`].
pub struct TypeHelper<'a, 'js> {
    scope: &'a Scope<'a, 'js>,
}

impl<'a, 'js> TypeHelper<'a, 'js> {
    /// `object instanceof <ctor>`, with `ctor` a global constructor name.
    pub fn is_instance(&self, object: &ForeignObject<'_, 'js>, ctor: &str) -> Result<bool> {
        let ctor = resolve_constructor(self.scope, ctor)?;
        self.scope.helper("isInstance", (object.object.clone(), ctor))
    }
}

/// Script value for a `HostValue::Custom`.
pub(crate) fn to_foreign<'js>(
    scope: &Scope<'_, 'js>,
    object: &HostObject,
    depth: usize,
) -> Result<Value<'js>> {
    let helper = ConstructorHelper { scope, depth };
    for (index, hook) in scope.engine.hooks().iter().enumerate() {
        if let Some(foreign) = hook.to_foreign(object, &helper)? {
            debug!(hook = index, type_name = object.type_name(), "type hook matched");
            return Ok(foreign.value);
        }
    }
    if let Some(record) = object.record() {
        return marshal::to_js_at(scope, &record, depth);
    }
    Err(Error::conversion(
        object.type_name(),
        "no type hook matched and the type has no record view",
    ))
}

/// Hook conversion of a non-plain script object, if any hook claims it.
pub(crate) fn to_host<'js>(
    scope: &Scope<'_, 'js>,
    object: &Object<'js>,
    depth: usize,
) -> Result<Option<HostValue>> {
    let hooks = scope.engine.hooks();
    if hooks.is_empty() {
        return Ok(None);
    }
    let foreign = ForeignObject {
        scope,
        object: object.clone(),
        depth,
    };
    let types = TypeHelper { scope };
    for (index, hook) in hooks.iter().enumerate() {
        if let Some(value) = hook.to_host(&foreign, &types)? {
            debug!(hook = index, "type hook matched");
            return Ok(Some(value));
        }
    }
    Ok(None)
}
