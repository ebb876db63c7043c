//! Error translator
//!
//! Script exceptions caught by the host become [`Error::Script`], unless the
//! thrown object is a wrapper the bridge created: a host exception comes back
//! as `Error::Foreign` with its identity intact, and a bridge error raised
//! inside a host callable comes back as the original `Error`.

use std::path::Path;
use std::sync::Arc;

use rquickjs::{Exception, Function, Object, Value};
use tandem_core::{exception, Handle, HostException};
use tracing::trace;

use crate::engine::{HostSlot, HostSlotGuard};
use crate::error::{Error, Result, ScriptError};
use crate::scope::Scope;

/// Host error for a failed engine call. Clears the pending script exception.
pub(crate) fn caught<'js>(
    scope: &Scope<'_, 'js>,
    error: rquickjs::Error,
    file: Option<&Path>,
) -> Error {
    match error {
        rquickjs::Error::Exception => {
            let thrown = scope.ctx.catch();
            from_thrown(scope, &thrown, file)
        }
        rquickjs::Error::Io(source) => match file {
            Some(path) => Error::Io {
                path: path.to_path_buf(),
                source: Arc::new(source),
            },
            None => Error::Interpreter(source.to_string()),
        },
        other => Error::Interpreter(other.to_string()),
    }
}

fn from_thrown<'js>(scope: &Scope<'_, 'js>, thrown: &Value<'js>, file: Option<&Path>) -> Error {
    if let Some(handle) = wrapped_handle(scope, thrown) {
        match scope.engine.host_slot(handle) {
            Some(HostSlot::Exception(exc)) => return Error::Foreign(exc),
            Some(HostSlot::Fault(err)) => return err,
            _ => {}
        }
    }
    Error::Script(describe(thrown, file))
}

fn wrapped_handle<'js>(scope: &Scope<'_, 'js>, value: &Value<'js>) -> Option<Handle> {
    let key: Option<String> = scope.helpers().call("refOf", (value.clone(),)).ok()?;
    key.as_deref().and_then(Handle::from_key)
}

/// Read name, message and location off a thrown value.
pub(crate) fn describe(thrown: &Value<'_>, file: Option<&Path>) -> ScriptError {
    let loaded = file.map(|path| path.display().to_string());

    let Some(object) = thrown.as_object() else {
        // `throw 42` and friends
        return ScriptError {
            name: "Error".to_string(),
            message: primitive_text(thrown),
            file: loaded,
            line: None,
            stack: None,
        };
    };

    let name = text_field(object, "name").unwrap_or_else(|| "Error".to_string());
    let message = text_field(object, "message").unwrap_or_default();
    let stack = text_field(object, "stack");

    let line_number = object.get::<_, Option<u32>>("lineNumber").ok().flatten();
    let (reported_file, line) = match text_field(object, "fileName").zip(line_number) {
        Some((file, line)) => (Some(file), Some(line)),
        None => match stack.as_deref().and_then(stack_location) {
            Some((file, line)) => (Some(file), Some(line)),
            None => (None, None),
        },
    };

    // Loaded files are evaluated under their base name; report the path.
    let from_loaded = |reported: &str| {
        file.and_then(Path::file_name)
            .is_some_and(|name| name == reported)
    };
    let file = match reported_file {
        Some(reported) if from_loaded(&reported) => loaded,
        None => loaded,
        reported => reported,
    };
    trace!(name, ?file, ?line, "script error caught");

    ScriptError {
        name,
        message,
        file,
        line,
        stack,
    }
}

fn text_field(object: &Object<'_>, key: &str) -> Option<String> {
    object.get::<_, Option<String>>(key).ok().flatten()
}

fn primitive_text(value: &Value<'_>) -> String {
    if let Some(text) = value.as_string() {
        return text.to_string().unwrap_or_default();
    }
    if let Some(n) = value.as_number() {
        return n.to_string();
    }
    if let Some(b) = value.as_bool() {
        return b.to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    "undefined".to_string()
}

/// First `file:line` frame of an interpreter stack trace.
///
/// Frames look like `    at f (file.js:3)`, `    at file.js:2` or, with
/// columns, `    at f (file.js:3:7)`.
pub(crate) fn stack_location(stack: &str) -> Option<(String, u32)> {
    stack.lines().find_map(|frame| {
        let frame = frame.trim().strip_prefix("at ")?;
        let location = match (frame.rfind('('), frame.ends_with(')')) {
            (Some(open), true) => &frame[open + 1..frame.len() - 1],
            _ => frame,
        };
        if location == "native" {
            return None;
        }

        let mut parts = location.rsplitn(3, ':');
        let last = parts.next()?;
        let middle = parts.next()?;
        match (middle.parse::<u32>(), last.parse::<u32>(), parts.next()) {
            // file:line:column
            (Ok(line), Ok(_), Some(file)) => Some((file.to_string(), line)),
            // file:line
            (Err(_), Ok(line), Some(rest)) => Some((format!("{rest}:{middle}"), line)),
            (_, Ok(line), None) => Some((middle.to_string(), line)),
            _ => None,
        }
    })
}

/// Throw `error` into script. Called on the way back from a host callable.
pub(crate) fn throw<'js>(scope: &Scope<'_, 'js>, error: Error) -> rquickjs::Error {
    let object = match &error {
        Error::Foreign(exc) => foreign_error(scope, exc),
        other => fault_error(scope, other.clone()),
    };
    // The exception is owned by the script from here on.
    exception::take_current();

    match object {
        Ok(value) => scope.ctx.throw(value),
        Err(_) => Exception::throw_message(&scope.ctx, &error.to_string()),
    }
}

/// Script `Error` object standing for a host exception.
pub(crate) fn foreign_error<'js>(scope: &Scope<'_, 'js>, exc: &HostException) -> Result<Value<'js>> {
    let handle = scope.engine.store_host(HostSlot::Exception(exc.clone()));
    let anchor = scope.anchor(HostSlotGuard::new(scope.engine, handle))?;
    let error: Value = scope.helper(
        "makeError",
        (exc.type_name(), exc.message(), Some(exc.type_name())),
    )?;
    tag(scope, &error, handle, anchor)?;
    Ok(error)
}

fn fault_error<'js>(scope: &Scope<'_, 'js>, error: Error) -> Result<Value<'js>> {
    let name = error.kind_name();
    let message = error.to_string();
    let handle = scope.engine.store_host(HostSlot::Fault(error));
    let anchor = scope.anchor(HostSlotGuard::new(scope.engine, handle))?;
    let object: Value = scope.helper("makeError", (name, message, None::<&str>))?;
    tag(scope, &object, handle, anchor)?;
    Ok(object)
}

fn tag<'js>(
    scope: &Scope<'_, 'js>,
    target: &Value<'js>,
    handle: Handle,
    anchor: Function<'js>,
) -> Result<()> {
    scope.tag(target, handle, Some(anchor), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::value::HostValue;
    use crate::Context;

    #[test]
    fn test_stack_location_formats() {
        assert_eq!(
            stack_location("    at /tmp/a.js:2\n"),
            Some(("/tmp/a.js".to_string(), 2))
        );
        assert_eq!(
            stack_location("    at f (lib.js:10:4)\n    at <eval> (eval_script:1)\n"),
            Some(("lib.js".to_string(), 10))
        );
        assert_eq!(
            stack_location("    at push (native)\n    at g (x.js:7)\n"),
            Some(("x.js".to_string(), 7))
        );
        assert_eq!(
            stack_location("    at C:\\scripts\\a.js:5\n"),
            Some(("C:\\scripts\\a.js".to_string(), 5))
        );
        assert_eq!(stack_location("no frames here"), None);
    }

    #[test]
    fn test_syntax_error() {
        let ctx = Context::new().unwrap();
        match ctx.eval("var = 1;").unwrap_err() {
            Error::Script(err) => assert_eq!(err.name, "SyntaxError"),
            other => panic!("expected a script error, got {other:?}"),
        }
    }

    #[test]
    fn test_runtime_error_fields() {
        let ctx = Context::new().unwrap();
        match ctx.eval("null.x").unwrap_err() {
            Error::Script(err) => {
                assert_eq!(err.name, "TypeError");
                assert!(!err.message.is_empty());
            }
            other => panic!("expected a script error, got {other:?}"),
        }
    }

    #[test]
    fn test_thrown_primitive() {
        let ctx = Context::new().unwrap();
        match ctx.eval("throw 42").unwrap_err() {
            Error::Script(err) => {
                assert_eq!(err.name, "Error");
                assert_eq!(err.message, "42");
            }
            other => panic!("expected a script error, got {other:?}"),
        }
    }

    #[test]
    fn test_bridge_error_comes_back_unchanged() {
        let ctx = Context::new().unwrap();
        ctx.declare_thread_only("session").unwrap();
        let err = ctx.eval("session").unwrap_err();
        match err {
            Error::NotInitialized { name } => assert_eq!(name, "session"),
            other => panic!("expected not-initialized, got {other:?}"),
        }

        // Swallowed by script, it reads as an ordinary error record.
        let seen = ctx
            .eval("try { session; } catch (e) { e.name }")
            .unwrap();
        assert_eq!(seen, HostValue::from("NotInitializedError"));
    }

    #[test]
    fn test_reentrant_error_name() {
        let err = Error::from(LifecycleError::Reentrant);
        assert_eq!(err.kind_name(), "LifecycleError");
    }
}
