//! Host exceptions and the per-thread "current exception" state
//!
//! A [`HostException`] is what host callables raise. It keeps the fully
//! qualified type name of the original error and, optionally, the original
//! error value itself, so that an exception that crossed into script and
//! back can be recognized (same identity) and downcast again.
//!
//! While the bridge is marshalling a failed host call into script, the
//! exception is *current* on that thread (see [`current_exception`]). The
//! bridge clears it before control returns to script, so a later, unrelated
//! host call never observes a stale error.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

struct Inner {
    type_name: String,
    message: String,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

/// Host-origin exception with shared identity.
///
/// Cloning is cheap and preserves identity; use [`ptr_eq`](Self::ptr_eq)
/// to check whether two values are the same raised exception.
#[derive(Clone)]
pub struct HostException {
    inner: Arc<Inner>,
}

impl HostException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                type_name: type_name.into(),
                message: message.into(),
                payload: None,
            }),
        }
    }

    /// Wrap a typed error. The qualified type name is taken from `E` and the
    /// error itself is kept for [`downcast_ref`](Self::downcast_ref).
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                type_name: std::any::type_name::<E>().to_string(),
                message: error.to_string(),
                payload: Some(Arc::new(error)),
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// The original typed error, if this exception was built with
    /// [`from_error`](Self::from_error) and `E` matches.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.inner.payload.as_ref()?.downcast_ref::<E>()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostException")
            .field("type_name", &self.inner.type_name)
            .field("message", &self.inner.message)
            .finish()
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.inner.type_name, self.inner.message)
    }
}

impl std::error::Error for HostException {}

thread_local! {
    static CURRENT: RefCell<Option<HostException>> = const { RefCell::new(None) };
}

/// The exception currently being raised on this thread, if any.
pub fn current_exception() -> Option<HostException> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Mark `exception` as raised on this thread. Returns the exception that was
/// already pending, which the caller is expected to have handled.
pub fn raise(exception: HostException) -> Option<HostException> {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(exception));
    if let Some(stale) = &previous {
        tracing::warn!(exception = %stale, "replacing an exception that was never cleared");
    }
    previous
}

/// Clear and return the current exception.
pub fn take_current() -> Option<HostException> {
    CURRENT.with(|current| current.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Oops(u32);

    impl fmt::Display for Oops {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "oops #{}", self.0)
        }
    }

    impl std::error::Error for Oops {}

    #[test]
    fn test_from_error_keeps_type_and_payload() {
        let exc = HostException::from_error(Oops(3));
        assert!(exc.type_name().ends_with("Oops"));
        assert!(exc.type_name().contains("::"));
        assert_eq!(exc.message(), "oops #3");
        assert_eq!(exc.downcast_ref::<Oops>().map(|o| o.0), Some(3));
        assert!(exc.downcast_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn test_identity() {
        let a = HostException::new("ValueError", "bad");
        let b = a.clone();
        let c = HostException::new("ValueError", "bad");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.to_string(), "ValueError: bad");
    }

    #[test]
    fn test_current_exception_is_per_thread() {
        assert!(current_exception().is_none());
        raise(HostException::new("E", "one"));
        assert_eq!(current_exception().map(|e| e.message().to_string()), Some("one".into()));

        std::thread::spawn(|| assert!(current_exception().is_none()))
            .join()
            .unwrap();

        assert!(take_current().is_some());
        assert!(current_exception().is_none());
        assert!(take_current().is_none());
    }
}
