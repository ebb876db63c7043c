//! Host-side value model
//!
//! [`HostValue`] is what the bridge produces when it reads a script value and
//! what it accepts when it writes one. Plain data (scalars, arrays, maps,
//! temporal values) is copied across; everything else travels by reference.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use tandem_core::HostException;

use crate::bridge::{HostFunction, Invocable};
use crate::error::{Error, Result};
use crate::proxy::ProxyHandle;

/// Tag of a value-stack slot, as reported by `Context::type_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
    Function,
    /// Opaque host object
    Pointer,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Undefined => "undefined",
            Kind::Null => "null",
            Kind::Boolean => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Array => "array",
            Kind::Object => "object",
            Kind::Function => "function",
            Kind::Pointer => "pointer",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<HostValue>),
    Map(BTreeMap<String, HostValue>),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Zone-naive, read as UTC
    DateTime(NaiveDateTime),
    ZonedDateTime(DateTime<FixedOffset>),
    Function(HostFunction),
    ScriptFunction(Invocable),
    /// Host object converted through the type hooks
    Custom(HostObject),
    /// Host object passed by reference, opaque to script
    Pointer(HostObject),
    Exception(HostException),
    Proxy(ProxyHandle),
}

impl HostValue {
    pub fn type_name(&self) -> &str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Map(_) => "map",
            HostValue::Date(_) => "date",
            HostValue::Time(_) => "time",
            HostValue::DateTime(_) => "datetime",
            HostValue::ZonedDateTime(_) => "zoned datetime",
            HostValue::Function(_) => "host function",
            HostValue::ScriptFunction(_) => "script function",
            HostValue::Custom(object) | HostValue::Pointer(object) => object.type_name(),
            HostValue::Exception(exc) => exc.type_name(),
            HostValue::Proxy(_) => "proxy",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            HostValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyHandle> {
        match self {
            HostValue::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// JSON view of plain data, following `JSON.stringify` for the corner
    /// cases: `undefined` and non-finite numbers become `null`, dates become
    /// RFC 3339 strings. Reference values have no JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;

        Ok(match self {
            HostValue::Undefined | HostValue::Null => Json::Null,
            HostValue::Bool(b) => Json::Bool(*b),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            HostValue::String(s) => Json::String(s.clone()),
            HostValue::Array(items) => Json::Array(
                items
                    .iter()
                    .map(HostValue::to_json)
                    .collect::<Result<_>>()?,
            ),
            HostValue::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
            HostValue::Date(d) => Json::String(d.to_string()),
            HostValue::Time(t) => Json::String(t.to_string()),
            HostValue::DateTime(dt) => {
                Json::String(dt.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            HostValue::ZonedDateTime(dt) => {
                Json::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
            other => {
                return Err(Error::conversion(
                    other.type_name(),
                    "reference values have no JSON form",
                ))
            }
        })
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => HostValue::Null,
            Json::Bool(b) => HostValue::Bool(b),
            Json::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => HostValue::String(s),
            Json::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from_json).collect())
            }
            Json::Object(map) => HostValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, HostValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for HostValue {
    /// Data compares structurally, references by identity.
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;

        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Time(a), Time(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (ZonedDateTime(a), ZonedDateTime(b)) => a == b,
            (Function(a), Function(b)) => a.ptr_eq(b),
            (ScriptFunction(a), ScriptFunction(b)) => a.ptr_eq(b),
            (Custom(a), Custom(b)) | (Pointer(a), Pointer(b)) => a.ptr_eq(b),
            (Exception(a), Exception(b)) => a.ptr_eq(b),
            (Proxy(a), Proxy(b)) => a.same_target(b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("Undefined"),
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            HostValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            HostValue::String(s) => f.debug_tuple("String").field(s).finish(),
            HostValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            HostValue::Map(map) => f.debug_tuple("Map").field(map).finish(),
            HostValue::Date(d) => f.debug_tuple("Date").field(d).finish(),
            HostValue::Time(t) => f.debug_tuple("Time").field(t).finish(),
            HostValue::DateTime(dt) => f.debug_tuple("DateTime").field(dt).finish(),
            HostValue::ZonedDateTime(dt) => f.debug_tuple("ZonedDateTime").field(dt).finish(),
            HostValue::Function(func) => f.debug_tuple("Function").field(func).finish(),
            HostValue::ScriptFunction(inv) => f.debug_tuple("ScriptFunction").field(inv).finish(),
            HostValue::Custom(obj) => f.debug_tuple("Custom").field(obj).finish(),
            HostValue::Pointer(obj) => f.debug_tuple("Pointer").field(obj).finish(),
            HostValue::Exception(exc) => f.debug_tuple("Exception").field(exc).finish(),
            HostValue::Proxy(proxy) => f.debug_tuple("Proxy").field(proxy).finish(),
        }
    }
}

macro_rules! from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HostValue {
                fn from(n: $ty) -> Self {
                    HostValue::Number(n as f64)
                }
            }
        )*
    };
}

from_number!(f64, f32, i32, i64, u32, u64, usize);

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(items: Vec<T>) -> Self {
        HostValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Null, Into::into)
    }
}

impl From<BTreeMap<String, HostValue>> for HostValue {
    fn from(map: BTreeMap<String, HostValue>) -> Self {
        HostValue::Map(map)
    }
}

impl From<NaiveDate> for HostValue {
    fn from(d: NaiveDate) -> Self {
        HostValue::Date(d)
    }
}

impl From<NaiveTime> for HostValue {
    fn from(t: NaiveTime) -> Self {
        HostValue::Time(t)
    }
}

impl From<NaiveDateTime> for HostValue {
    fn from(dt: NaiveDateTime) -> Self {
        HostValue::DateTime(dt)
    }
}

impl From<DateTime<FixedOffset>> for HostValue {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        HostValue::ZonedDateTime(dt)
    }
}

impl From<HostFunction> for HostValue {
    fn from(f: HostFunction) -> Self {
        HostValue::Function(f)
    }
}

impl From<Invocable> for HostValue {
    fn from(f: Invocable) -> Self {
        HostValue::ScriptFunction(f)
    }
}

impl From<HostException> for HostValue {
    fn from(exc: HostException) -> Self {
        HostValue::Exception(exc)
    }
}

impl From<ProxyHandle> for HostValue {
    fn from(proxy: ProxyHandle) -> Self {
        HostValue::Proxy(proxy)
    }
}

type RecordFn = dyn Fn(&(dyn Any + Send + Sync)) -> Option<HostValue> + Send + Sync;

struct ObjectInner {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
    record: Option<Box<RecordFn>>,
}

/// A host value of arbitrary type, shared by reference.
///
/// Wrapped in [`HostValue::Custom`] it is converted through the registered
/// type hooks, falling back to its record view. Wrapped in
/// [`HostValue::Pointer`] it crosses as an opaque script object that keeps
/// it alive; the value is dropped once both the host and the collector are
/// done with it.
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<ObjectInner>,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                type_name: std::any::type_name::<T>(),
                value: Box::new(value),
                record: None,
            }),
        }
    }

    /// Attach a structural view used when no type hook claims the object.
    pub fn with_record<T, F>(value: T, record: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> HostValue + Send + Sync + 'static,
    {
        let view = move |any: &(dyn Any + Send + Sync)| any.downcast_ref::<T>().map(&record);
        Self {
            inner: Arc::new(ObjectInner {
                type_name: std::any::type_name::<T>(),
                value: Box::new(value),
                record: Some(Box::new(view)),
            }),
        }
    }

    /// Fully qualified Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.value.downcast_ref::<T>()
    }

    pub fn record(&self) -> Option<HostValue> {
        let view = self.inner.record.as_ref()?;
        view(self.inner.value.as_ref())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type_name", &self.inner.type_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point {
        x: f64,
        y: f64,
    }

    #[test]
    fn test_record_view() {
        let point = HostObject::with_record(Point { x: 1.0, y: 2.0 }, |p| {
            let mut map = BTreeMap::new();
            map.insert("x".to_string(), HostValue::from(p.x));
            map.insert("y".to_string(), HostValue::from(p.y));
            HostValue::Map(map)
        });

        assert!(point.is::<Point>());
        assert!(point.type_name().ends_with("Point"));
        let record = point.record().unwrap();
        assert_eq!(record.as_map().unwrap()["y"], HostValue::Number(2.0));

        let bare = HostObject::new(Point { x: 0.0, y: 0.0 });
        assert!(bare.record().is_none());
        assert_eq!(bare.downcast_ref::<Point>().map(|p| p.x + p.y), Some(0.0));
    }

    #[test]
    fn test_reference_equality() {
        let a = HostObject::new(5u8);
        let b = a.clone();
        let c = HostObject::new(5u8);
        assert_eq!(HostValue::Pointer(a.clone()), HostValue::Pointer(b));
        assert_ne!(HostValue::Pointer(a.clone()), HostValue::Pointer(c));
        assert_ne!(HostValue::Pointer(a.clone()), HostValue::Custom(a));
    }

    #[test]
    fn test_integers_unify_into_numbers() {
        assert_eq!(HostValue::from(3i32), HostValue::Number(3.0));
        assert_eq!(HostValue::from(3u64), HostValue::from(3.0f64));
        assert_eq!(HostValue::from(None::<i32>), HostValue::Null);
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({ "a": [1, 2.5, "x", null, true], "b": {} });
        let value = HostValue::from_json(json.clone());
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_json_corner_cases() {
        assert_eq!(
            HostValue::Number(f64::NAN).to_json().unwrap(),
            serde_json::Value::Null
        );
        assert_eq!(HostValue::Undefined.to_json().unwrap(), serde_json::Value::Null);

        let dt = NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            HostValue::DateTime(dt).to_json().unwrap(),
            serde_json::json!("2020-01-02T03:04:05Z")
        );

        let err = HostValue::Pointer(HostObject::new(1u8)).to_json().unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::Pointer.to_string(), "pointer");
        assert_eq!(Kind::Boolean.to_string(), "boolean");
    }
}
