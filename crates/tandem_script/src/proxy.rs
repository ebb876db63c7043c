//! Live proxies onto script-side objects and arrays
//!
//! A [`ProxyHandle`] is an anchor (a named global, or a registry slot for a
//! captured value) plus a path of keys. Every operation resolves the path
//! afresh, so a proxy always sees the current script-side state and never
//! holds on to an intermediate object.

use std::fmt;
use std::sync::{Arc, Weak};

use rquickjs::{Array, Object, Value};

use crate::engine::{ContextLink, SlotRef};
use crate::error::{Error, LifecycleError, Result};
use crate::marshal::{self, Shape};
use crate::scope::Scope;
use crate::value::HostValue;

/// One step of a proxy path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    /// Negative indices count from the end
    Index(i64),
}

impl Key {
    fn as_name(&self) -> String {
        match self {
            Key::Name(name) => name.clone(),
            Key::Index(index) => index.to_string(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => write!(f, ".{name}"),
            Key::Index(index) => write!(f, "[{index}]"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

macro_rules! key_from_index {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Key {
                fn from(index: $ty) -> Self {
                    Key::Index(index as i64)
                }
            }
        )*
    };
}

key_from_index!(i32, i64, isize, u32, usize);

/// `start:stop:step`, with Python semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl Slice {
    pub fn new(start: Option<i64>, stop: Option<i64>) -> Self {
        Self {
            start,
            stop,
            step: None,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Concrete indices selected in a sequence of `len` items.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Error::InvalidArgument("slice step cannot be zero".into()));
        }
        let len = len as i64;
        let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(b) if b < 0 => (b + len).max(lower),
            Some(b) => b.min(upper),
        };
        let start = clamp(self.start, if step > 0 { lower } else { upper });
        let stop = clamp(self.stop, if step > 0 { upper } else { lower });

        let mut indices = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            indices.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(indices)
    }

    fn is_contiguous(&self) -> bool {
        self.step.unwrap_or(1) == 1
    }
}

/// Kind of container a proxy points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Array,
    Object,
}

#[derive(Clone)]
enum Anchor {
    Global(String),
    Slot(Arc<SlotRef>),
}

/// Live reference to a script object or array.
#[derive(Clone)]
pub struct ProxyHandle {
    link: Weak<ContextLink>,
    anchor: Anchor,
    path: Vec<Key>,
}

enum Target<'js> {
    Array(Array<'js>),
    Object(Object<'js>),
}

/// Python-style index normalization; out of range is `NotFound`.
fn normalize(index: i64, len: usize, what: &dyn fmt::Display) -> Result<usize> {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(Error::not_found(format!("index {index} of {what}")))
    }
}

impl ProxyHandle {
    pub(crate) fn global(link: Weak<ContextLink>, name: &str) -> Self {
        Self {
            link,
            anchor: Anchor::Global(name.to_string()),
            path: Vec::new(),
        }
    }

    /// Proxy over a value no global reaches, kept alive by a registry slot.
    pub(crate) fn captured<'js>(scope: &Scope<'_, 'js>, value: Value<'js>) -> Result<Self> {
        Ok(Self {
            link: scope.link.clone(),
            anchor: Anchor::Slot(Arc::new(scope.capture(value)?)),
            path: Vec::new(),
        })
    }

    /// Proxy one level further down.
    pub fn child(&self, key: impl Into<Key>) -> Self {
        let mut child = self.clone();
        child.path.push(key.into());
        child
    }

    pub fn path(&self) -> &[Key] {
        &self.path
    }

    /// Whether both proxies address the same location.
    pub fn same_target(&self, other: &Self) -> bool {
        let anchors = match (&self.anchor, &other.anchor) {
            (Anchor::Global(a), Anchor::Global(b)) => a == b,
            (Anchor::Slot(a), Anchor::Slot(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        anchors && Weak::ptr_eq(&self.link, &other.link) && self.path == other.path
    }

    /// Run `f` on the current target. `f` gets its own copy of the proxy.
    fn with<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'a, 'js> FnOnce(&ProxyHandle, &Scope<'a, 'js>, Target<'js>) -> Result<R>
            + Send
            + 'static,
        R: Send + 'static,
    {
        let link = self
            .link
            .upgrade()
            .ok_or(LifecycleError::ContextDestroyed)?;
        let engine = link.engine()?;
        let this = self.clone();
        engine.enter(link.id(), move |scope| {
            let value = this.resolve_in(scope)?;
            let target = this.target(scope, value)?;
            f(&this, scope, target)
        })
    }

    /// The script value this proxy currently points at.
    pub(crate) fn resolve_in<'js>(&self, scope: &Scope<'_, 'js>) -> Result<Value<'js>> {
        let link = self
            .link
            .upgrade()
            .ok_or(LifecycleError::ContextDestroyed)?;
        if link.engine_id() != scope.engine.id() {
            return Err(LifecycleError::ForeignEngine.into());
        }

        let mut current = match &self.anchor {
            Anchor::Global(name) => scope.global(name)?,
            Anchor::Slot(slot) => scope.fetch(slot)?,
        };
        for (depth, key) in self.path.iter().enumerate() {
            let parent = self.describe_prefix(depth);
            current = match self.target(scope, current)? {
                Target::Array(array) => {
                    let Key::Index(index) = key else {
                        return Err(Error::not_found(format!("key '{}' in {parent}", key.as_name())));
                    };
                    let index = normalize(*index, array.len(), &parent)?;
                    scope.check(array.get(index))?
                }
                Target::Object(object) => {
                    let name = key.as_name();
                    if !scope.helper::<_, bool>("hasOwn", (object.clone(), name.as_str()))? {
                        return Err(Error::not_found(format!("key '{name}' in {parent}")));
                    }
                    scope.check(object.get(name.as_str()))?
                }
            };
        }
        Ok(current)
    }

    fn target<'js>(&self, scope: &Scope<'_, 'js>, value: Value<'js>) -> Result<Target<'js>> {
        match marshal::classify(scope, &value)? {
            Shape::Array => value
                .into_array()
                .map(Target::Array)
                .ok_or_else(|| Error::InvalidArgument(format!("{self} is not an array"))),
            Shape::Object => value
                .into_object()
                .map(Target::Object)
                .ok_or_else(|| Error::InvalidArgument(format!("{self} is not an object"))),
            other => Err(Error::InvalidArgument(format!(
                "{self} is not a container ({other:?})"
            ))),
        }
    }

    fn describe_prefix(&self, depth: usize) -> String {
        let mut text = match &self.anchor {
            Anchor::Global(name) => name.clone(),
            Anchor::Slot(slot) => format!("<captured {}>", slot.handle()),
        };
        for key in &self.path[..depth] {
            text.push_str(&key.to_string());
        }
        text
    }

    /// Host view of an element: plain containers stay live as child proxies,
    /// hook-eligible objects go through the hooks, the rest is converted.
    fn surface<'js>(&self, scope: &Scope<'_, 'js>, value: Value<'js>, key: Key) -> Result<HostValue> {
        match marshal::classify(scope, &value)? {
            Shape::Array => Ok(HostValue::Proxy(self.child(key))),
            Shape::Object => {
                if let Some(object) = value.as_object() {
                    if let Some(converted) = crate::hooks::to_host(scope, object, 0)? {
                        return Ok(converted);
                    }
                }
                Ok(HostValue::Proxy(self.child(key)))
            }
            _ => marshal::from_js(scope, value),
        }
    }

    /// Like [`surface`](Self::surface) for a value no longer reachable
    /// through this proxy's path.
    fn surface_detached<'js>(scope: &Scope<'_, 'js>, value: Value<'js>) -> Result<HostValue> {
        match marshal::classify(scope, &value)? {
            Shape::Array | Shape::Object => Ok(HostValue::Proxy(Self::captured(scope, value)?)),
            _ => marshal::from_js(scope, value),
        }
    }

    pub fn kind(&self) -> Result<ProxyKind> {
        self.with(move |_, _, target| {
            Ok(match target {
                Target::Array(_) => ProxyKind::Array,
                Target::Object(_) => ProxyKind::Object,
            })
        })
    }

    /// Element count for arrays, own enumerable key count for objects.
    pub fn len(&self) -> Result<usize> {
        self.with(move |_, scope, target| match target {
            Target::Array(array) => Ok(array.len()),
            Target::Object(object) => {
                let keys: Vec<String> = scope.helper("ownKeys", (object,))?;
                Ok(keys.len())
            }
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<HostValue> {
        let key = key.into();
        self.with(move |this, scope, target| match target {
            Target::Array(array) => {
                let index = this.array_index(&key, array.len())?;
                let value = scope.check(array.get(index))?;
                this.surface(scope, value, Key::Index(index as i64))
            }
            Target::Object(object) => {
                let name = key.as_name();
                if !scope.helper::<_, bool>("hasOwn", (object.clone(), name.as_str()))? {
                    return Err(Error::not_found(format!("key '{name}' in {this}")));
                }
                let value = scope.check(object.get(name.as_str()))?;
                this.surface(scope, value, Key::Name(name))
            }
        })
    }

    /// Assign an existing index, or any key of an object.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<HostValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.with(move |this, scope, target| {
            let value = marshal::to_js(scope, &value)?;
            match target {
                Target::Array(array) => {
                    let index = this.array_index(&key, array.len())?;
                    scope.check(array.set(index, value))
                }
                Target::Object(object) => scope.check(object.set(key.as_name(), value)),
            }
        })
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.with(move |this, scope, target| match target {
            Target::Array(array) => {
                let index = this.array_index(&key, array.len())?;
                splice(scope, &array, index, 1, &[])?;
                Ok(())
            }
            Target::Object(object) => {
                let name = key.as_name();
                if !scope.helper::<_, bool>("hasOwn", (object.clone(), name.as_str()))? {
                    return Err(Error::not_found(format!("key '{name}' in {this}")));
                }
                scope.helper::<_, bool>("remove", (object, name))?;
                Ok(())
            }
        })
    }

    pub fn getattr(&self, name: &str) -> Result<HostValue> {
        self.get(Key::from(name))
    }

    pub fn setattr(&self, name: &str, value: impl Into<HostValue>) -> Result<()> {
        self.set(Key::from(name), value)
    }

    pub fn delattr(&self, name: &str) -> Result<()> {
        self.delete(Key::from(name))
    }

    /// Key membership for objects, element membership for arrays.
    pub fn contains(&self, needle: impl Into<HostValue>) -> Result<bool> {
        let needle = needle.into();
        self.with(move |_, scope, target| match target {
            Target::Array(array) => {
                for item in array.iter::<Value>() {
                    if marshal::from_js(scope, scope.check(item)?)? == needle {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Target::Object(object) => {
                let name = match &needle {
                    HostValue::String(name) => name.clone(),
                    HostValue::Number(n) => n.to_string(),
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "object keys are strings, not {}",
                            other.type_name()
                        )))
                    }
                };
                scope.helper("hasOwn", (object, name))
            }
        })
    }

    /// Own enumerable keys (indices, for arrays).
    pub fn keys(&self) -> Result<Vec<String>> {
        self.with(move |_, scope, target| match target {
            Target::Array(array) => Ok((0..array.len()).map(|i| i.to_string()).collect()),
            Target::Object(object) => scope.helper("ownKeys", (object,)),
        })
    }

    /// Restartable iterator over elements (arrays) or keys (objects).
    pub fn iter(&self) -> ProxyIter {
        ProxyIter {
            proxy: self.clone(),
            position: 0,
            done: false,
        }
    }

    pub fn append(&self, value: impl Into<HostValue>) -> Result<()> {
        let value = value.into();
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            let value = marshal::to_js(scope, &value)?;
            scope.check(array.set(array.len(), value))
        })
    }

    /// Insert before `index`; out-of-range indices clamp to the ends.
    pub fn insert(&self, index: i64, value: impl Into<HostValue>) -> Result<()> {
        let value = value.into();
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            let len = array.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            let value = marshal::to_js(scope, &value)?;
            splice(scope, &array, at as usize, 0, &[value])?;
            Ok(())
        })
    }

    /// Remove and return the element at `index` (default: the last one).
    pub fn pop(&self, index: Option<i64>) -> Result<HostValue> {
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            if array.is_empty() {
                return Err(Error::not_found(format!("element to pop from empty {this}")));
            }
            let index = normalize(index.unwrap_or(-1), array.len(), this)?;
            let removed = splice(scope, &array, index, 1, &[])?;
            let value = scope.check(removed.get(0))?;
            Self::surface_detached(scope, value)
        })
    }

    pub fn slice(&self, slice: Slice) -> Result<Vec<HostValue>> {
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            slice
                .indices(array.len())?
                .into_iter()
                .map(|index| {
                    let value = scope.check(array.get(index))?;
                    this.surface(scope, value, Key::Index(index as i64))
                })
                .collect()
        })
    }

    /// Replace a slice. Extended slices (step other than 1) need exactly as
    /// many values as they select.
    pub fn set_slice(&self, slice: Slice, values: Vec<HostValue>) -> Result<()> {
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            let indices = slice.indices(array.len())?;
            let values = values
                .iter()
                .map(|value| marshal::to_js(scope, value))
                .collect::<Result<Vec<_>>>()?;

            if slice.is_contiguous() {
                // An empty selection still has an insertion point.
                let start = match indices.first() {
                    Some(first) => *first,
                    None => Slice::new(slice.start, None)
                        .indices(array.len())?
                        .first()
                        .copied()
                        .unwrap_or(array.len()),
                };
                splice(scope, &array, start, indices.len(), &values)?;
                return Ok(());
            }

            if indices.len() != values.len() {
                return Err(Error::InvalidArgument(format!(
                    "attempt to assign sequence of size {} to extended slice of size {}",
                    values.len(),
                    indices.len()
                )));
            }
            for (index, value) in indices.into_iter().zip(values) {
                scope.check(array.set(index, value))?;
            }
            Ok(())
        })
    }

    pub fn delete_slice(&self, slice: Slice) -> Result<()> {
        self.with(move |this, scope, target| {
            let array = this.expect_array(target)?;
            let mut indices = slice.indices(array.len())?;
            indices.sort_unstable_by(|a, b| b.cmp(a));
            for index in indices {
                splice(scope, &array, index, 1, &[])?;
            }
            Ok(())
        })
    }

    /// One-shot full conversion of the current state.
    pub fn materialize(&self) -> Result<HostValue> {
        self.with(move |_, scope, target| {
            let value = match target {
                Target::Array(array) => array.into_value(),
                Target::Object(object) => object.into_value(),
            };
            marshal::from_js(scope, value)
        })
    }

    fn array_index(&self, key: &Key, len: usize) -> Result<usize> {
        match key {
            Key::Index(index) => normalize(*index, len, self),
            Key::Name(name) => match name.parse::<i64>() {
                Ok(index) => normalize(index, len, self),
                Err(_) => Err(Error::InvalidArgument(format!(
                    "{self} is an array; '{name}' is not an index"
                ))),
            },
        }
    }

    fn expect_array<'js>(&self, target: Target<'js>) -> Result<Array<'js>> {
        match target {
            Target::Array(array) => Ok(array),
            Target::Object(_) => Err(Error::InvalidArgument(format!("{self} is not an array"))),
        }
    }
}

fn splice<'js>(
    scope: &Scope<'_, 'js>,
    array: &Array<'js>,
    start: usize,
    count: usize,
    items: &[Value<'js>],
) -> Result<Array<'js>> {
    let items = items.to_vec();
    scope.helper("splice", (array.clone(), start, count, items))
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe_prefix(self.path.len()))
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyHandle({self})")
    }
}

/// Lazy iterator over a proxy, re-reading the live state on every step.
#[derive(Clone)]
pub struct ProxyIter {
    proxy: ProxyHandle,
    position: usize,
    done: bool,
}

impl Iterator for ProxyIter {
    type Item = Result<HostValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let position = self.position;
        let proxy = &self.proxy;
        let step = proxy.with(move |this, scope, target| match target {
            Target::Array(array) => {
                if position >= array.len() {
                    return Ok(None);
                }
                let value = scope.check(array.get(position))?;
                this
                    .surface(scope, value, Key::Index(position as i64))
                    .map(Some)
            }
            Target::Object(object) => {
                let keys: Vec<String> = scope.helper("ownKeys", (object,))?;
                Ok(keys.into_iter().nth(position).map(HostValue::String))
            }
        });

        self.position += 1;
        match step {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'p> IntoIterator for &'p ProxyHandle {
    type Item = Result<HostValue>;
    type IntoIter = ProxyIter;

    fn into_iter(self) -> ProxyIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    fn numbers(values: &[HostValue]) -> Vec<f64> {
        values.iter().filter_map(HostValue::as_f64).collect()
    }

    fn list(ctx: &Context) -> Vec<f64> {
        let value = ctx.get("a").unwrap();
        numbers(value.as_array().unwrap())
    }

    #[test]
    fn test_slice_indices() {
        let s = |start, stop, step| Slice { start, stop, step };
        assert_eq!(s(None, None, None).indices(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(s(Some(1), Some(-1), None).indices(4).unwrap(), vec![1, 2]);
        assert_eq!(s(None, None, Some(-1)).indices(3).unwrap(), vec![2, 1, 0]);
        assert_eq!(s(Some(-10), Some(10), Some(2)).indices(5).unwrap(), vec![0, 2, 4]);
        assert_eq!(s(Some(3), Some(1), None).indices(5).unwrap(), Vec::<usize>::new());
        assert_eq!(s(Some(1), None, Some(i64::MAX)).indices(3).unwrap(), vec![1]);
        assert_eq!(s(None, None, Some(i64::MIN)).indices(3).unwrap(), vec![2]);
        assert!(matches!(
            s(None, None, Some(0)).indices(3),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_live_view() {
        let ctx = Context::new().unwrap();
        ctx.eval("var a = [1, 2, 3]").unwrap();
        let proxy = ctx.proxy("a").unwrap();
        assert_eq!(proxy.kind().unwrap(), ProxyKind::Array);
        assert_eq!(proxy.len().unwrap(), 3);

        ctx.eval("a.push(4)").unwrap();
        assert_eq!(proxy.len().unwrap(), 4);
        assert_eq!(proxy.get(-1).unwrap(), HostValue::Number(4.0));

        proxy.set(0, 10).unwrap();
        assert_eq!(ctx.eval("a[0]").unwrap(), HostValue::Number(10.0));
    }

    #[test]
    fn test_missing_is_not_found() {
        let ctx = Context::new().unwrap();
        ctx.eval("var o = { x: 1 }; var a = [1]").unwrap();
        let o = ctx.proxy("o").unwrap();
        assert!(matches!(o.get("y"), Err(Error::NotFound { .. })));
        assert!(matches!(o.delattr("y"), Err(Error::NotFound { .. })));
        let a = ctx.proxy("a").unwrap();
        assert!(matches!(a.get(5), Err(Error::NotFound { .. })));
        assert!(matches!(a.get(-2), Err(Error::NotFound { .. })));
        assert!(matches!(ctx.proxy("nope"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_nested_containers_are_child_proxies() {
        let ctx = Context::new().unwrap();
        ctx.eval("var o = { inner: { list: [1, 2] }, when: new Date(0) }").unwrap();
        let o = ctx.proxy("o").unwrap();

        let inner = match o.getattr("inner").unwrap() {
            HostValue::Proxy(inner) => inner,
            other => panic!("expected a child proxy, got {other:?}"),
        };
        let list = inner.getattr("list").unwrap();
        let list = list.as_proxy().unwrap();
        list.append(3).unwrap();
        assert_eq!(ctx.eval("o.inner.list.length").unwrap(), HostValue::Number(3.0));

        // Replacing the intermediate object is seen by the child.
        ctx.eval("o.inner = { list: [9] }").unwrap();
        assert_eq!(list.get(0).unwrap(), HostValue::Number(9.0));

        assert!(matches!(o.getattr("when").unwrap(), HostValue::DateTime(_)));
        assert_eq!(o.to_string(), "o");
        assert_eq!(list.to_string(), "o.inner.list");
    }

    #[test]
    fn test_object_operations() {
        let ctx = Context::new().unwrap();
        ctx.eval("var o = { a: 1, b: 2 }").unwrap();
        let o = ctx.proxy("o").unwrap();

        o.setattr("c", "three").unwrap();
        assert_eq!(o.keys().unwrap(), vec!["a", "b", "c"]);
        assert!(o.contains("b").unwrap());
        o.delattr("b").unwrap();
        assert!(!o.contains("b").unwrap());
        assert_eq!(o.len().unwrap(), 2);

        let keys: Vec<HostValue> = o.iter().collect::<Result<_>>().unwrap();
        assert_eq!(keys, vec![HostValue::from("a"), HostValue::from("c")]);
    }

    #[test]
    fn test_iteration_sees_mutation() {
        let ctx = Context::new().unwrap();
        ctx.eval("var a = [1, 2]").unwrap();
        let a = ctx.proxy("a").unwrap();

        let mut iter = a.iter();
        assert_eq!(iter.next().unwrap().unwrap(), HostValue::Number(1.0));
        ctx.eval("a.push(3)").unwrap();
        let rest: Vec<HostValue> = iter.collect::<Result<_>>().unwrap();
        assert_eq!(numbers(&rest), vec![2.0, 3.0]);

        // Restartable
        assert_eq!(a.iter().count(), 3);
    }

    #[test]
    fn test_list_mutations() {
        let ctx = Context::new().unwrap();
        ctx.eval("var a = [0, 1, 2, 3, 4]").unwrap();
        let a = ctx.proxy("a").unwrap();

        a.insert(100, 5).unwrap();
        a.insert(-100, -1).unwrap();
        assert_eq!(list(&ctx), vec![-1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(a.pop(None).unwrap(), HostValue::Number(5.0));
        assert_eq!(a.pop(Some(0)).unwrap(), HostValue::Number(-1.0));
        assert!(a.contains(3).unwrap());
        a.delete(-1).unwrap();
        assert_eq!(list(&ctx), vec![0.0, 1.0, 2.0, 3.0]);

        assert_eq!(
            numbers(&a.slice(Slice::new(Some(1), None)).unwrap()),
            vec![1.0, 2.0, 3.0]
        );
        a.set_slice(Slice::new(Some(1), Some(3)), vec![7.into()]).unwrap();
        assert_eq!(list(&ctx), vec![0.0, 7.0, 3.0]);

        a.set_slice(Slice::new(None, None).with_step(2), vec![8.into(), 9.into()])
            .unwrap();
        assert_eq!(list(&ctx), vec![8.0, 7.0, 9.0]);
        assert!(matches!(
            a.set_slice(Slice::new(None, None).with_step(2), vec![1.into()]),
            Err(Error::InvalidArgument(_))
        ));

        a.delete_slice(Slice::new(None, None).with_step(-2)).unwrap();
        assert_eq!(list(&ctx), vec![7.0]);

        a.set_slice(Slice::new(Some(1), Some(1)), vec![1.into(), 2.into()]).unwrap();
        assert_eq!(list(&ctx), vec![7.0, 1.0, 2.0]);
    }

    #[test]
    fn test_popped_container_stays_live() {
        let ctx = Context::new().unwrap();
        ctx.eval("var a = [[1, 2]]").unwrap();
        let a = ctx.proxy("a").unwrap();
        let popped = a.pop(None).unwrap();
        let inner = popped.as_proxy().unwrap();
        assert_eq!(inner.len().unwrap(), 2);
        inner.append(3).unwrap();
        assert_eq!(
            inner.materialize().unwrap(),
            HostValue::from(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_proxy_pushes_underlying_object() {
        let ctx = Context::new().unwrap();
        ctx.eval("var o = { n: 1 }").unwrap();
        let o = ctx.proxy("o").unwrap();
        ctx.set("alias", o.clone()).unwrap();
        assert_eq!(ctx.eval("alias === o").unwrap(), HostValue::Bool(true));
    }

    #[test]
    fn test_proxy_after_context_is_gone() {
        let ctx = Context::new().unwrap();
        ctx.eval("var a = [1]").unwrap();
        let thread = ctx.new_thread(false).unwrap();
        let proxy = thread.proxy("a").unwrap();
        drop(thread);
        assert!(matches!(
            proxy.len(),
            Err(Error::Lifecycle(LifecycleError::ContextDestroyed))
        ));

        let proxy = ctx.proxy("a").unwrap();
        drop(ctx);
        assert!(matches!(proxy.len(), Err(Error::Lifecycle(_))));
    }
}
