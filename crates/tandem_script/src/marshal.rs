//! Stack marshaller: conversions between `HostValue` and script values
//!
//! Plain data is copied recursively, up to [`MAX_DEPTH`] levels. Host
//! references (functions, pointers, exceptions) are wrapped once per
//! crossing and unwrap to the very same host value. Script functions are
//! captured in the registry and surface as [`Invocable`]s.

use std::collections::BTreeMap;

use rquickjs::{Object, Type, Value};
use tandem_core::temporal::{self, EpochInstant};
use tracing::trace;

use crate::bridge::{self, Invocable};
use crate::engine::HostSlot;
use crate::error::{Error, LifecycleError, Result};
use crate::hooks;
use crate::scope::Scope;
use crate::translate;
use crate::value::{HostValue, Kind};

/// Container nesting limit. Cyclic script structures hit it.
pub const MAX_DEPTH: usize = 64;

/// What a script value looks like to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Undefined,
    Null,
    Bool,
    Number,
    String,
    Symbol,
    BigInt,
    Array,
    Function,
    Date,
    /// Wrapper of a host slot
    HostRef(tandem_core::Handle),
    Object,
}

impl Shape {
    fn name(&self) -> &'static str {
        match self {
            Shape::Undefined => "undefined",
            Shape::Null => "null",
            Shape::Bool => "boolean",
            Shape::Number => "number",
            Shape::String => "string",
            Shape::Symbol => "symbol",
            Shape::BigInt => "bigint",
            Shape::Array => "array",
            Shape::Function => "function",
            Shape::Date => "Date",
            Shape::HostRef(_) => "host reference",
            Shape::Object => "object",
        }
    }

    /// Plain containers are what proxies can look into.
    pub(crate) fn is_container(&self) -> bool {
        matches!(self, Shape::Array | Shape::Object)
    }
}

pub(crate) fn classify<'js>(scope: &Scope<'_, 'js>, value: &Value<'js>) -> Result<Shape> {
    Ok(match value.type_of() {
        Type::Uninitialized | Type::Undefined => Shape::Undefined,
        Type::Null => Shape::Null,
        Type::Bool => Shape::Bool,
        Type::Int | Type::Float => Shape::Number,
        Type::String => Shape::String,
        Type::Symbol => Shape::Symbol,
        Type::BigInt => Shape::BigInt,
        Type::Array => Shape::Array,
        Type::Function | Type::Constructor => match scope.host_ref(value)? {
            Some(handle) => Shape::HostRef(handle),
            None => Shape::Function,
        },
        _ => {
            if let Some(handle) = scope.host_ref(value)? {
                Shape::HostRef(handle)
            } else if scope.helper::<_, bool>("isDate", (value.clone(),))? {
                Shape::Date
            } else {
                Shape::Object
            }
        }
    })
}

/// Values that have no host form; reading or tagging them fails alike.
fn unsupported(shape: Shape) -> Error {
    Error::conversion(shape.name(), "no host equivalent")
}

/// Stack tag of `value`.
pub(crate) fn kind_of<'js>(scope: &Scope<'_, 'js>, value: &Value<'js>) -> Result<Kind> {
    Ok(match classify(scope, value)? {
        Shape::Undefined => Kind::Undefined,
        Shape::Null => Kind::Null,
        Shape::Bool => Kind::Boolean,
        Shape::Number => Kind::Number,
        Shape::String => Kind::String,
        Shape::Array => Kind::Array,
        Shape::Function => Kind::Function,
        Shape::HostRef(handle) => match scope.engine.host_slot(handle) {
            Some(HostSlot::Pointer(_)) => Kind::Pointer,
            Some(HostSlot::Function(_)) => Kind::Function,
            _ => Kind::Object,
        },
        Shape::Date | Shape::Object => Kind::Object,
        shape @ (Shape::Symbol | Shape::BigInt) => return Err(unsupported(shape)),
    })
}

pub(crate) fn from_js<'js>(scope: &Scope<'_, 'js>, value: Value<'js>) -> Result<HostValue> {
    from_js_at(scope, value, 0)
}

pub(crate) fn from_js_at<'js>(
    scope: &Scope<'_, 'js>,
    value: Value<'js>,
    depth: usize,
) -> Result<HostValue> {
    let shape = classify(scope, &value)?;
    if depth > MAX_DEPTH && shape.is_container() {
        return Err(Error::conversion(
            shape.name(),
            format!("nesting exceeds {MAX_DEPTH} levels (cyclic structure?)"),
        ));
    }

    match shape {
        Shape::Undefined => Ok(HostValue::Undefined),
        Shape::Null => Ok(HostValue::Null),
        Shape::Bool => Ok(HostValue::Bool(value.as_bool().unwrap_or_default())),
        Shape::Number => Ok(HostValue::Number(value.as_number().unwrap_or(f64::NAN))),
        Shape::String => {
            let text = match value.as_string() {
                Some(text) => scope.check(text.to_string())?,
                None => String::new(),
            };
            Ok(HostValue::String(text))
        }
        Shape::Symbol | Shape::BigInt => Err(unsupported(shape)),
        Shape::HostRef(handle) => match scope.engine.host_slot(handle) {
            Some(HostSlot::Pointer(object)) => Ok(HostValue::Pointer(object)),
            Some(HostSlot::Function(function)) => Ok(HostValue::Function(function)),
            Some(HostSlot::Exception(exc)) => Ok(HostValue::Exception(exc)),
            Some(HostSlot::Fault(_)) => Ok(error_record(&value)),
            None => Err(LifecycleError::StaleHandle { handle }.into()),
        },
        Shape::Function => Ok(HostValue::ScriptFunction(Invocable::capture(scope, value)?)),
        Shape::Date => date(scope, &value),
        Shape::Array => {
            let array = value
                .into_array()
                .ok_or_else(|| Error::conversion("array", "not an array object"))?;
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                items.push(from_js_at(scope, scope.check(item)?, depth + 1)?);
            }
            Ok(HostValue::Array(items))
        }
        Shape::Object => {
            let object = value
                .into_object()
                .ok_or_else(|| Error::conversion("object", "not an object"))?;
            if let Some(converted) = hooks::to_host(scope, &object, depth)? {
                return Ok(converted);
            }
            if scope.helper::<_, bool>("isError", (object.clone(),))? {
                return Ok(error_record(&object.into_value()));
            }
            object_map(scope, &object, depth)
        }
    }
}

fn object_map<'js>(scope: &Scope<'_, 'js>, object: &Object<'js>, depth: usize) -> Result<HostValue> {
    let keys: Vec<String> = scope.helper("ownKeys", (object.clone(),))?;
    let mut map = BTreeMap::new();
    for key in keys {
        let item: Value = scope.check(object.get(key.as_str()))?;
        let item = from_js_at(scope, item, depth + 1)?;
        map.insert(key, item);
    }
    Ok(HostValue::Map(map))
}

/// Script `Error` objects read as `{ name, message, stack }`.
fn error_record(value: &Value<'_>) -> HostValue {
    let script = translate::describe(value, None);
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), HostValue::String(script.name));
    map.insert("message".to_string(), HostValue::String(script.message));
    if let Some(stack) = script.stack {
        map.insert("stack".to_string(), HostValue::String(stack));
    }
    HostValue::Map(map)
}

fn date<'js>(scope: &Scope<'_, 'js>, value: &Value<'js>) -> Result<HostValue> {
    let parts: Vec<f64> = scope.helper("dateParts", (value.clone(),))?;
    let millis = parts.first().copied().unwrap_or(f64::NAN);
    let nanos = parts.get(1).copied().unwrap_or(0.0) as u32;
    temporal::to_naive_datetime(millis, nanos)
        .map(HostValue::DateTime)
        .ok_or_else(|| Error::conversion("Date", "invalid date"))
}

pub(crate) fn to_js<'js>(scope: &Scope<'_, 'js>, value: &HostValue) -> Result<Value<'js>> {
    to_js_at(scope, value, 0)
}

pub(crate) fn to_js_at<'js>(
    scope: &Scope<'_, 'js>,
    value: &HostValue,
    depth: usize,
) -> Result<Value<'js>> {
    let ctx = &scope.ctx;
    if depth > MAX_DEPTH {
        return Err(Error::conversion(
            value.type_name(),
            format!("nesting exceeds {MAX_DEPTH} levels"),
        ));
    }

    match value {
        HostValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
        HostValue::Null => Ok(Value::new_null(ctx.clone())),
        HostValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        // Doubles go through as-is so -0.0 keeps its sign.
        HostValue::Number(n) => Ok(Value::new_float(ctx.clone(), *n)),
        HostValue::String(s) => {
            let text = scope.check(rquickjs::String::from_str(ctx.clone(), s))?;
            Ok(text.into_value())
        }
        HostValue::Array(items) => {
            let array = scope.check(rquickjs::Array::new(ctx.clone()))?;
            for (index, item) in items.iter().enumerate() {
                let item = to_js_at(scope, item, depth + 1)?;
                scope.check(array.set(index, item))?;
            }
            Ok(array.into_value())
        }
        HostValue::Map(map) => {
            let object = scope.check(Object::new(ctx.clone()))?;
            for (key, item) in map {
                let item = to_js_at(scope, item, depth + 1)?;
                scope.check(object.set(key.as_str(), item))?;
            }
            Ok(object.into_value())
        }
        HostValue::Date(d) => make_date(scope, temporal::from_date(d)),
        HostValue::Time(t) => make_date(scope, temporal::from_time(t)),
        HostValue::DateTime(dt) => make_date(scope, temporal::from_naive_datetime(dt)),
        HostValue::ZonedDateTime(dt) => make_date(scope, temporal::from_zoned(dt)),
        HostValue::Function(function) => bridge::wrap_function(scope, function),
        HostValue::ScriptFunction(function) => function.restore(scope),
        HostValue::Custom(object) => hooks::to_foreign(scope, object, depth),
        HostValue::Pointer(object) => bridge::wrap_pointer(scope, object),
        HostValue::Exception(exc) => translate::foreign_error(scope, exc),
        HostValue::Proxy(proxy) => proxy.resolve_in(scope),
    }
}

fn make_date<'js>(scope: &Scope<'_, 'js>, instant: EpochInstant) -> Result<Value<'js>> {
    trace!(millis = instant.millis, sub_millis = instant.sub_millis_nanos, "date crossing");
    scope.helper("makeDate", (instant.millis_f64(), instant.sub_millis_nanos))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;
    use proptest::test_runner::{TestCaseError, TestRunner};

    use super::*;
    use crate::value::HostObject;
    use crate::Context;

    fn datetime(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_push_pop_scalars() {
        let ctx = Context::new().unwrap();
        for value in [
            HostValue::Undefined,
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Number(-0.5),
            HostValue::from("text with \0 nul"),
        ] {
            ctx.push(value.clone()).unwrap();
            assert_eq!(ctx.pop().unwrap(), value);
        }
        assert_eq!(ctx.len().unwrap(), 0);
    }

    #[test]
    fn test_scalar_round_trip_property() {
        let ctx = Context::new().unwrap();
        let mut runner = TestRunner::default();

        runner
            .run(&any::<f64>(), |n| {
                ctx.push(n).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let back = ctx.pop().map_err(|e| TestCaseError::fail(e.to_string()))?;
                match back {
                    HostValue::Number(m) if n.is_nan() => {
                        prop_assert!(m.is_nan());
                    }
                    HostValue::Number(m) => {
                        prop_assert_eq!(m.to_bits(), n.to_bits());
                    }
                    other => {
                        prop_assert!(false, "unexpected {:?}", other);
                    }
                }
                Ok(())
            })
            .unwrap();

        runner
            .run(&any::<String>(), |s| {
                ctx.push(s.as_str()).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let back = ctx.pop().map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(back, HostValue::String(s));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_nested_containers() {
        let ctx = Context::new().unwrap();
        let value = HostValue::from_json(serde_json::json!({
            "list": [1, [2, [3]], { "deep": true }],
            "name": "x",
        }));
        ctx.push(value.clone()).unwrap();
        assert_eq!(ctx.pop().unwrap(), value);
    }

    #[test]
    fn test_cycle_fails_naming_the_container() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("var a = []; a.push(a); a").unwrap_err();
        match err {
            Error::Conversion { type_name, .. } => assert_eq!(type_name, "array"),
            other => panic!("expected a conversion error, got {other:?}"),
        }
    }

    #[test]
    fn test_symbol_is_rejected() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("Symbol('s')").unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }

    #[test]
    fn test_unconvertible_top_slot_fails_type_of_and_pop_alike() {
        let ctx = Context::new().unwrap();
        assert!(ctx.eval("Symbol('s')").is_err());
        assert_eq!(ctx.len().unwrap(), 1);

        let tagged = ctx.type_of().unwrap_err();
        let popped = ctx.pop().unwrap_err();
        match (tagged, popped) {
            (
                Error::Conversion { type_name: a, .. },
                Error::Conversion { type_name: b, .. },
            ) => {
                assert_eq!(a, "symbol");
                assert_eq!(a, b);
            }
            other => panic!("expected two conversion errors, got {other:?}"),
        }
        assert_eq!(ctx.len().unwrap(), 1);
    }

    #[test]
    fn test_astral_strings_are_utf16_on_the_script_side() {
        let ctx = Context::new().unwrap();
        ctx.set("s", "\u{1F600}").unwrap();
        assert_eq!(ctx.eval("s.length").unwrap(), HostValue::Number(2.0));
        assert_eq!(ctx.get("s").unwrap(), HostValue::from("\u{1F600}"));

        // Script-side indices are UTF-16 code units.
        let text = "x\u{1F600}y";
        ctx.set("t", text).unwrap();
        let index = ctx.eval("t.indexOf('y')").unwrap().as_f64().unwrap() as usize;
        assert_eq!(index, tandem_core::text::utf16_len("x\u{1F600}"));
        let offset = tandem_core::text::byte_offset_of_utf16(text, index).unwrap();
        assert_eq!(&text[offset..], "y");

        assert_eq!(
            ctx.eval("'a\\u0000b'").unwrap(),
            HostValue::from("a\0b")
        );
    }

    #[test]
    fn test_dates_keep_sub_millis_until_mutated() {
        let ctx = Context::new().unwrap();
        let precise = datetime("2020-05-17 12:00:00.123456789");

        ctx.push(precise).unwrap();
        assert_eq!(ctx.pop().unwrap(), HostValue::DateTime(precise));

        ctx.set("d", precise).unwrap();
        assert_eq!(ctx.get("d").unwrap(), HostValue::DateTime(precise));
        ctx.eval("d.setUTCSeconds(1)").unwrap();
        assert_eq!(
            ctx.get("d").unwrap(),
            HostValue::DateTime(datetime("2020-05-17 12:00:01.123"))
        );
    }

    #[test]
    fn test_zoned_and_date_values() {
        let ctx = Context::new().unwrap();
        let zoned = chrono::DateTime::parse_from_rfc3339("2021-03-04T10:00:00+02:00").unwrap();
        ctx.push(zoned).unwrap();
        assert_eq!(
            ctx.pop().unwrap(),
            HostValue::DateTime(datetime("2021-03-04 08:00:00.0"))
        );

        ctx.set("day", NaiveDate::from_ymd_opt(2000, 1, 2).unwrap()).unwrap();
        assert_eq!(
            ctx.eval("day.toISOString()").unwrap(),
            HostValue::from("2000-01-02T00:00:00.000Z")
        );
    }

    #[test]
    fn test_invalid_date_is_a_conversion_error() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("new Date(NaN)").unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }

    #[test]
    fn test_pointer_identity_and_kind() {
        let ctx = Context::new().unwrap();
        let object = HostObject::new(vec![1u8, 2, 3]);
        ctx.push(HostValue::Pointer(object.clone())).unwrap();
        assert_eq!(ctx.type_of().unwrap(), Kind::Pointer);
        match ctx.pop().unwrap() {
            HostValue::Pointer(back) => {
                assert!(back.ptr_eq(&object));
                assert_eq!(back.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
            }
            other => panic!("expected a pointer, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_without_hook_or_record_fails() {
        struct Opaque;
        let ctx = Context::new().unwrap();
        let err = ctx
            .push(HostValue::Custom(HostObject::new(Opaque)))
            .unwrap_err();
        match err {
            Error::Conversion { type_name, .. } => assert!(type_name.ends_with("Opaque")),
            other => panic!("expected a conversion error, got {other:?}"),
        }
        assert_eq!(ctx.len().unwrap(), 0);
    }

    #[test]
    fn test_script_error_objects_read_as_records() {
        let ctx = Context::new().unwrap();
        let value = ctx.eval("new TypeError('nope')").unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map["name"], HostValue::from("TypeError"));
        assert_eq!(map["message"], HostValue::from("nope"));
    }
}
