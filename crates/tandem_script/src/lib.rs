//! Tandem Script Bridge
//!
//! Embeds QuickJS (through `rquickjs`) in a host process and moves values,
//! callables and errors across the boundary in both directions.
//!
//! ## Architecture
//!
//! - **Marshaller:** host values to script values and back, recursive, with
//!   identity kept for functions, host objects and host exceptions
//! - **Function bridge:** host closures callable from script, script
//!   functions callable from the host
//! - **Type hooks:** per-engine converters for custom host types
//! - **Proxies:** live views onto script objects and arrays
//! - **Contexts:** one engine, many execution contexts; explicit
//!   suspend/resume lets another host thread drive the same environment
//!
//! ```no_run
//! use tandem_script::{Context, HostValue};
//!
//! let ctx = Context::new()?;
//! ctx.register("double", 1, |args| {
//!     Ok(HostValue::Number(args[0].as_f64().unwrap_or(0.0) * 2.0))
//! })?;
//! assert_eq!(ctx.eval("double(21)")?, HostValue::Number(42.0));
//! # Ok::<(), tandem_script::Error>(())
//! ```

mod bridge;
pub mod config;
mod context;
mod engine;
pub mod error;
pub mod hooks;
mod marshal;
pub mod proxy;
mod scope;
mod translate;
pub mod value;

pub use bridge::{HostFunction, Invocable};
pub use config::Config;
pub use context::{Context, ContextBuilder};
pub use engine::{ContextState, SuspendToken};
pub use error::{Error, LifecycleError, Result, ScriptError};
pub use hooks::{ConstructorHelper, ForeignObject, ForeignRef, TypeHelper, TypeHook};
pub use marshal::MAX_DEPTH;
pub use proxy::{Key, ProxyHandle, ProxyIter, ProxyKind, Slice};
pub use value::{HostObject, HostValue, Kind};

pub use rquickjs;
pub use tandem_core::exception::{current_exception, raise, take_current};
pub use tandem_core::{Handle, HostException};
