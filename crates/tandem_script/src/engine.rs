//! Engine: one interpreter runtime, its realms, and the worker that drives them
//!
//! The engine owns all bookkeeping behind the public `Context` handles.
//! Arenas hold the realms, the execution contexts, the host values that
//! script objects refer to, and the registry slots host code refers to.
//!
//! Scheduling:
//! - Script code only ever runs on the engine's worker thread. Host threads
//!   submit jobs and block until theirs has run.
//! - A host callable invoked by script runs on the thread that submitted the
//!   entry. While it runs the worker waits for its reply and serves jobs
//!   admitted in the meantime, nested under the suspended frames.
//! - Admission happens on the submitting thread: an entry is admitted only
//!   when every entry already admitted belongs to a suspended context.
//!
//! Locking rules:
//! - `state` is never held while script code runs.
//! - Finalizers (closures dropped by the collector) only push onto
//!   `releases`; the queue is drained on the next entry or collection.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use rquickjs::loader::{FileResolver, ScriptLoader};
use rquickjs::{Ctx, Runtime};
use tandem_core::{exception, Arena, Handle, HostException};
use tracing::{debug, trace, warn};

use crate::bridge::{self, HostFunction};
use crate::config::Config;
use crate::error::{Error, LifecycleError, Result};
use crate::hooks::TypeHook;
use crate::scope::{self, Helpers, Scope};
use crate::value::{HostObject, HostValue};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Script recursion runs on the worker, so it gets a generous stack.
const WORKER_STACK: usize = 8 * 1024 * 1024;

/// Host value a script object stands for.
#[derive(Clone)]
pub(crate) enum HostSlot {
    Pointer(HostObject),
    Function(HostFunction),
    Exception(HostException),
    /// Bridge error travelling through script code
    Fault(Error),
}

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Ready,
    Suspended,
    Destroyed,
}

/// Receipt for a suspended context, consumed by `Context::resume`.
///
/// Tokens are not `Clone`; each one is valid for exactly one resume.
pub struct SuspendToken {
    engine_id: u64,
    context: Handle,
    serial: u64,
}

impl SuspendToken {
    /// Context this token resumes.
    pub fn context(&self) -> Handle {
        self.context
    }
}

impl fmt::Debug for SuspendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendToken")
            .field("context", &self.context)
            .field("serial", &self.serial)
            .finish()
    }
}

struct Realm {
    context: Arc<rquickjs::Context>,
    prelude: bool,
    /// Thread-only accessors already defined on this realm's global object
    accessors: HashSet<String>,
}

impl Realm {
    fn new(context: rquickjs::Context) -> Self {
        Self {
            context: Arc::new(context),
            prelude: false,
            accessors: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Ready,
    Suspended { serial: u64 },
}

struct ContextRecord {
    realm: Handle,
    isolated: bool,
    link: Weak<ContextLink>,
    state: RecordState,
}

struct ScriptSlot {
    realm: Handle,
}

/// One admitted job.
struct Entry {
    /// `None` while the engine itself is doing maintenance
    context: Option<Handle>,
    driver: ThreadId,
    /// Host calls made by this entry's script, served by `driver`
    calls: Option<Sender<PendingCall>>,
}

#[derive(Default)]
struct State {
    realms: Arena<Realm>,
    contexts: Arena<ContextRecord>,
    host_slots: Arena<HostSlot>,
    script_slots: Arena<ScriptSlot>,
    thread_only: BTreeSet<String>,
    entries: Arena<Entry>,
    /// Entries executing on the worker, innermost last
    running: Vec<Handle>,
    /// Realm handed to isolated contexts created while the runtime is held
    spare: Option<Handle>,
    next_serial: u64,
    next_call: u64,
    gc_pending: bool,
}

impl State {
    /// First admitted entry that keeps others out: one whose context is
    /// not suspended.
    fn blocker(&self) -> Option<&Entry> {
        self.entries.iter().map(|(_, entry)| entry).find(|entry| {
            entry.context.is_none_or(|context| {
                !matches!(
                    self.contexts.get(context).map(|record| record.state),
                    Ok(RecordState::Suspended { .. })
                )
            })
        })
    }
}

#[derive(Default)]
struct Releases {
    host: Vec<Handle>,
    script: Vec<Handle>,
}

type Job = Box<dyn FnOnce() + Send>;
pub(crate) type Outcome = std::result::Result<HostValue, HostException>;

enum Message {
    Run(Job),
    Returned { call: u64, outcome: Outcome },
}

/// The thread every interpreter operation runs on.
struct Worker {
    outbox: Option<Sender<Message>>,
    inbox: Arc<Mutex<Receiver<Message>>>,
    /// Replies that arrived while a nested entry was waiting on its own
    returned: Mutex<HashMap<u64, Outcome>>,
    handle: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn worker_stopped() -> Error {
    Error::Interpreter("the engine worker has stopped".into())
}

impl Worker {
    fn spawn(engine: u64) -> Result<Self> {
        let (outbox, inbox) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(inbox));
        let serving = inbox.clone();
        let handle = thread::Builder::new()
            .name(format!("tandem-engine-{engine}"))
            .stack_size(WORKER_STACK)
            .spawn(move || serve(engine, &serving))
            .map_err(|err| Error::Interpreter(format!("failed to start the engine worker: {err}")))?;
        Ok(Self {
            outbox: Some(outbox),
            inbox,
            returned: Mutex::default(),
            handle: Some(handle),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        let outbox = self.outbox.as_ref().ok_or_else(worker_stopped)?;
        outbox.send(message).map_err(|_| worker_stopped())
    }

    fn reply_to(&self) -> Result<Sender<Message>> {
        self.outbox.clone().ok_or_else(worker_stopped)
    }

    fn recv(&self) -> Option<Message> {
        lock(&self.inbox).recv().ok()
    }

    fn stop(&mut self) {
        drop(self.outbox.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("engine worker panicked");
            }
        }
    }
}

fn serve(engine: u64, inbox: &Mutex<Receiver<Message>>) {
    debug!(engine, "engine worker started");
    loop {
        let message = lock(inbox).recv();
        match message {
            Ok(Message::Run(job)) => run_job(engine, job),
            Ok(Message::Returned { call, .. }) => {
                trace!(engine, call, "dropped a reply nobody waits for");
            }
            Err(_) => break,
        }
    }
    debug!(engine, "engine worker stopped");
}

fn run_job(engine: u64, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!(engine, "engine job panicked");
    }
}

/// Host call made by script, run on the thread driving the entry.
struct PendingCall {
    function: HostFunction,
    args: Vec<HostValue>,
    reply: CallReply,
}

impl PendingCall {
    fn run(self) {
        if let Some(stale) = exception::take_current() {
            trace!(exception = %stale, "cleared a stale current exception");
        }
        trace!(function = self.function.name(), argc = self.args.len(), "calling host function");
        let outcome = self.function.call(&self.args);
        self.reply.send(outcome);
    }
}

/// Sends a host call's outcome back to the worker, exactly once.
struct CallReply {
    call: u64,
    worker: Option<Sender<Message>>,
}

impl CallReply {
    fn send(mut self, outcome: Outcome) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.send(Message::Returned {
                call: self.call,
                outcome,
            });
        }
    }

    fn cancel(mut self) {
        self.worker = None;
    }
}

impl Drop for CallReply {
    fn drop(&mut self) {
        // Only reached when the callable panicked.
        if let Some(worker) = self.worker.take() {
            let outcome = Err(HostException::new(
                "tandem::Abandoned",
                "the host callable panicked",
            ));
            let _ = worker.send(Message::Returned {
                call: self.call,
                outcome,
            });
        }
    }
}

/// Keeps one entry admitted. Dropping it lets the next one in.
struct Admission {
    engine: Arc<Engine>,
    id: Handle,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let entry = self.engine.state().entries.remove(self.id);
        drop(entry);
    }
}

/// Marks an entry as executing on the worker.
struct Running<'e> {
    engine: &'e Engine,
    entry: Handle,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.state();
        if let Some(pos) = state.running.iter().rposition(|id| *id == self.entry) {
            state.running.remove(pos);
        }
    }
}

/// What an entry needs from the bookkeeping before it touches the realm.
struct Prepared {
    realm: Handle,
    context: Handle,
    link: Weak<ContextLink>,
    prelude: bool,
    released: Vec<String>,
    accessors: Vec<String>,
}

/// Run `f` in `context` while an outer `Context::with` on this thread holds
/// the runtime.
fn with_held<R>(context: &rquickjs::Context, f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> R {
    // SAFETY: only the worker touches the runtime and it is inside an outer
    // `Context::with`, so this thread holds the runtime lock. The closure is
    // generic over `'js`, so the `Ctx` cannot escape it.
    let ctx = unsafe { Ctx::from_raw(context.as_raw()) };
    f(ctx)
}

pub(crate) struct Engine {
    id: u64,
    config: Config,
    state: Mutex<State>,
    releases: Mutex<Releases>,
    hooks: RwLock<Vec<Arc<dyn TypeHook>>>,
    worker: Worker,
    // Declared last: realms and everything they reference go first.
    runtime: Runtime,
}

fn interpreter(err: rquickjs::Error) -> Error {
    Error::Interpreter(err.to_string())
}

impl Engine {
    /// Create an engine and its top-level context. The returned link is the
    /// only owner of the engine.
    pub(crate) fn create(config: Config, hooks: Vec<Arc<dyn TypeHook>>) -> Result<Arc<ContextLink>> {
        let runtime = Runtime::new().map_err(interpreter)?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        if let Some(root) = &config.module_path {
            let root = root.to_string_lossy();
            runtime.set_loader(
                FileResolver::default().with_path(root.as_ref()),
                ScriptLoader::default(),
            );
        }

        let main = rquickjs::Context::full(&runtime).map_err(interpreter)?;
        let spare = rquickjs::Context::full(&runtime).map_err(interpreter)?;
        let mut state = State::default();
        let realm = state.realms.insert(Realm::new(main));
        state.spare = Some(state.realms.insert(Realm::new(spare)));

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(id)?;
        let engine = Arc::new(Engine {
            id,
            config,
            state: Mutex::new(state),
            releases: Mutex::new(Releases::default()),
            hooks: RwLock::new(hooks),
            worker,
            runtime,
        });
        debug!(engine = engine.id, "engine created");

        let owner = EngineRef::Owner(engine.clone());
        Ok(engine.attach(realm, false, owner))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn releases(&self) -> MutexGuard<'_, Releases> {
        lock(&self.releases)
    }

    fn attach(&self, realm: Handle, isolated: bool, engine: EngineRef) -> Arc<ContextLink> {
        let mut state = self.state();
        let id = state.contexts.insert(ContextRecord {
            realm,
            isolated,
            link: Weak::new(),
            state: RecordState::Ready,
        });
        let link = Arc::new(ContextLink {
            engine,
            engine_id: self.id,
            id,
        });
        if let Ok(record) = state.contexts.get_mut(id) {
            record.link = Arc::downgrade(&link);
        }
        debug!(engine = self.id, context = %id, realm = %realm, isolated, "execution context created");
        link
    }

    /// New execution context sharing `parent`'s realm, or with a fresh one.
    pub(crate) fn new_context(
        self: &Arc<Self>,
        parent: Handle,
        isolated: bool,
    ) -> Result<Arc<ContextLink>> {
        let borrowed = EngineRef::Borrowed(Arc::downgrade(self));
        if !isolated {
            let realm = self
                .state()
                .contexts
                .get(parent)
                .map_err(|_| LifecycleError::ContextDestroyed)?
                .realm;
            return Ok(self.attach(realm, false, borrowed));
        }
        // Attached inside the job so no collection can see the realm unowned.
        let admission = self.admit(None, None)?;
        self.submit(admission, None, move |engine, _| {
            let realm = engine.fresh_realm()?;
            Ok(engine.attach(realm, true, borrowed))
        })
    }

    /// On the worker. While an outer entry holds the runtime no realm can be
    /// built, so the spare one is handed out instead.
    fn fresh_realm(&self) -> Result<Handle> {
        {
            let mut state = self.state();
            if !state.running.is_empty() {
                return state
                    .spare
                    .take()
                    .ok_or_else(|| LifecycleError::EngineBusy { context: None }.into());
            }
        }
        let context = rquickjs::Context::full(&self.runtime).map_err(interpreter)?;
        Ok(self.state().realms.insert(Realm::new(context)))
    }

    pub(crate) fn context_state(&self, context: Handle) -> ContextState {
        match self.state().contexts.get(context) {
            Ok(record) if record.link.strong_count() == 0 => ContextState::Destroyed,
            Ok(record) => match record.state {
                RecordState::Ready => ContextState::Ready,
                RecordState::Suspended { .. } => ContextState::Suspended,
            },
            Err(_) => ContextState::Destroyed,
        }
    }

    pub(crate) fn is_isolated(&self, context: Handle) -> bool {
        self.state()
            .contexts
            .get(context)
            .is_ok_and(|record| record.isolated)
    }

    // ---- scheduling ----

    fn admit(
        self: &Arc<Self>,
        context: Option<Handle>,
        calls: Option<Sender<PendingCall>>,
    ) -> Result<Admission> {
        let thread = thread::current().id();
        let mut state = self.state();

        if let Some(id) = context {
            let record = state
                .contexts
                .get(id)
                .map_err(|_| LifecycleError::ContextDestroyed)?;
            if let RecordState::Suspended { .. } = record.state {
                return Err(LifecycleError::Suspended { context: id }.into());
            }
        }
        if let Some(blocker) = state.blocker() {
            return Err(if blocker.driver == thread {
                LifecycleError::Reentrant
            } else {
                LifecycleError::EngineBusy {
                    context: blocker.context,
                }
            }
            .into());
        }

        let id = state.entries.insert(Entry {
            context,
            driver: thread,
            calls,
        });
        Ok(Admission {
            engine: self.clone(),
            id,
        })
    }

    /// Hand `job` to the worker and wait for it, serving the host calls its
    /// script makes on this thread.
    fn submit<R, J>(
        self: &Arc<Self>,
        admission: Admission,
        calls: Option<Receiver<PendingCall>>,
        job: J,
    ) -> Result<R>
    where
        R: Send + 'static,
        J: FnOnce(&Arc<Engine>, Handle) -> Result<R> + Send + 'static,
    {
        let (done, result) = mpsc::channel();
        let engine = self.clone();
        let run: Job = Box::new(move || {
            let outcome = job(&engine, admission.id);
            drop(admission);
            engine.settle();
            drop(engine);
            let _ = done.send(outcome);
        });
        self.worker.send(Message::Run(run))?;

        if let Some(calls) = calls {
            // Ends once the admission is gone.
            for call in calls {
                call.run();
            }
        }
        result.recv().map_err(|_| worker_stopped())?
    }

    /// Run `f` inside `context`'s realm.
    pub(crate) fn enter<R, F>(self: &Arc<Self>, context: Handle, f: F) -> Result<R>
    where
        F: for<'a, 'js> FnOnce(&Scope<'a, 'js>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (calls, incoming) = mpsc::channel();
        let admission = self.admit(Some(context), Some(calls))?;
        self.submit(admission, Some(incoming), move |engine, entry| {
            engine.run_entry(entry, context, f)
        })
    }

    /// On the worker: run admitted `entry`.
    fn run_entry<R, F>(self: &Arc<Self>, entry: Handle, context: Handle, f: F) -> Result<R>
    where
        F: for<'a, 'js> FnOnce(&Scope<'a, 'js>) -> Result<R>,
    {
        let (prepared, js, nested) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let record = state
                .contexts
                .get(context)
                .map_err(|_| LifecycleError::ContextDestroyed)?;
            let realm = state.realms.get(record.realm)?;
            let accessors: Vec<String> = state
                .thread_only
                .iter()
                .filter(|name| !realm.accessors.contains(*name))
                .cloned()
                .collect();
            let prepared = Prepared {
                realm: record.realm,
                context,
                link: record.link.clone(),
                prelude: realm.prelude,
                released: Vec::new(),
                accessors,
            };
            let js = realm.context.clone();
            let nested = !state.running.is_empty();
            state.running.push(entry);
            (prepared, js, nested)
        };
        let _running = Running { engine: self, entry };

        let prepared = Prepared {
            released: self.take_script_releases(prepared.realm),
            ..prepared
        };
        let finalized = self.take_host_releases();
        trace!(engine = self.id, context = %context, nested, "entering engine");

        let result = if nested {
            with_held(&js, |ctx| self.run_in(ctx, prepared, f))
        } else {
            js.with(|ctx| self.run_in(ctx, prepared, f))
        };

        drop(finalized);
        result
    }

    fn run_in<'js, R, F>(self: &Arc<Self>, ctx: Ctx<'js>, prepared: Prepared, f: F) -> Result<R>
    where
        F: for<'a, 'b> FnOnce(&Scope<'a, 'b>) -> Result<R>,
    {
        let realm = prepared.realm;
        if !prepared.prelude {
            scope::install_prelude(&ctx).map_err(|err| {
                Error::Interpreter(format!("failed to install the registry: {err}"))
            })?;
            self.mark_realm(realm, |r| r.prelude = true);
        }
        let scope = Scope::new(ctx, self, realm, prepared.context, prepared.link)?;
        for key in prepared.released {
            scope.helper::<_, ()>("release", (key,))?;
        }
        for name in prepared.accessors {
            // A non-configurable global of the same name keeps its value
            // in this realm.
            if let Err(err) = bridge::install_thread_only(&scope, &name) {
                warn!(engine = self.id, name, error = %err, "thread-only accessor not installed");
            }
            self.mark_realm(realm, |r| {
                r.accessors.insert(name);
            });
        }
        f(&scope)
    }

    fn mark_realm(&self, realm: Handle, mark: impl FnOnce(&mut Realm)) {
        if let Ok(realm) = self.state().realms.get_mut(realm) {
            mark(realm);
        }
    }

    /// The entry the worker is executing, for host callbacks.
    pub(crate) fn active(&self) -> Result<(Handle, Handle, Weak<ContextLink>)> {
        let state = self.state();
        let context = state
            .running
            .last()
            .and_then(|entry| state.entries.get(*entry).ok())
            .and_then(|entry| entry.context)
            .ok_or(LifecycleError::EngineBusy { context: None })?;
        let record = state
            .contexts
            .get(context)
            .map_err(|_| LifecycleError::ContextDestroyed)?;
        Ok((context, record.realm, record.link.clone()))
    }

    /// On the worker: run `function` on the thread driving the innermost
    /// entry and wait for its outcome. Entries admitted meanwhile run
    /// nested here.
    pub(crate) fn call_host(&self, function: &HostFunction, args: Vec<HostValue>) -> Result<Outcome> {
        let (call, calls) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let calls = state
                .running
                .last()
                .and_then(|entry| state.entries.get(*entry).ok())
                .and_then(|entry| entry.calls.clone())
                .ok_or(LifecycleError::EngineBusy { context: None })?;
            state.next_call += 1;
            (state.next_call, calls)
        };
        let pending = PendingCall {
            function: function.clone(),
            args,
            reply: CallReply {
                call,
                worker: Some(self.worker.reply_to()?),
            },
        };
        if let Err(SendError(pending)) = calls.send(pending) {
            pending.reply.cancel();
            return Err(Error::Interpreter("the calling thread has gone away".into()));
        }
        drop(calls);
        self.await_call(call)
    }

    fn await_call(&self, call: u64) -> Result<Outcome> {
        loop {
            if let Some(outcome) = lock(&self.worker.returned).remove(&call) {
                return Ok(outcome);
            }
            match self.worker.recv() {
                Some(Message::Run(job)) => run_job(self.id, job),
                Some(Message::Returned { call: done, outcome }) if done == call => {
                    return Ok(outcome);
                }
                Some(Message::Returned { call: done, outcome }) => {
                    lock(&self.worker.returned).insert(done, outcome);
                }
                None => return Err(worker_stopped()),
            }
        }
    }

    /// On the worker, once the outermost job is done: run a deferred
    /// collection and rebuild the spare realm.
    fn settle(&self) {
        let (collect, rebuild) = {
            let mut state = self.state();
            if !state.running.is_empty() {
                return;
            }
            (std::mem::take(&mut state.gc_pending), state.spare.is_none())
        };
        if collect {
            if let Err(err) = self.collect() {
                warn!(engine = self.id, error = %err, "deferred collection failed");
            }
        }
        if rebuild {
            match rquickjs::Context::full(&self.runtime) {
                Ok(context) => {
                    let mut state = self.state();
                    let spare = state.realms.insert(Realm::new(context));
                    state.spare = Some(spare);
                }
                Err(err) => warn!(engine = self.id, error = %err, "spare realm not built"),
            }
        }
    }

    // ---- suspension ----

    pub(crate) fn suspend(&self, context: Handle) -> Result<SuspendToken> {
        let mut guard = self.state();
        let state = &mut *guard;
        let record = state
            .contexts
            .get_mut(context)
            .map_err(|_| LifecycleError::ContextDestroyed)?;
        if let RecordState::Suspended { .. } = record.state {
            return Err(LifecycleError::Suspended { context }.into());
        }

        let serial = state.next_serial;
        state.next_serial += 1;
        record.state = RecordState::Suspended { serial };
        debug!(engine = self.id, context = %context, serial, "execution context suspended");

        Ok(SuspendToken {
            engine_id: self.id,
            context,
            serial,
        })
    }

    pub(crate) fn resume(&self, context: Handle, token: &SuspendToken) -> Result<()> {
        if token.engine_id != self.id || token.context != context {
            return Err(LifecycleError::ForeignToken.into());
        }

        let mut state = self.state();
        let record = state
            .contexts
            .get_mut(context)
            .map_err(|_| LifecycleError::ContextDestroyed)?;
        match record.state {
            RecordState::Suspended { serial } if serial == token.serial => {
                record.state = RecordState::Ready;
            }
            _ => return Err(LifecycleError::TokenConsumed.into()),
        }
        debug!(engine = self.id, context = %context, serial = token.serial, "execution context resumed");
        Ok(())
    }

    /// Fails when a host callable is about to return into a suspended context.
    pub(crate) fn ensure_running(&self, context: Handle) -> Result<()> {
        match self.state().contexts.get(context) {
            Ok(record) => match record.state {
                RecordState::Ready => Ok(()),
                RecordState::Suspended { .. } => {
                    Err(LifecycleError::ReturnedWhileSuspended { context }.into())
                }
            },
            Err(_) => Err(LifecycleError::ContextDestroyed.into()),
        }
    }

    // ---- host slots ----

    pub(crate) fn store_host(&self, slot: HostSlot) -> Handle {
        self.state().host_slots.insert(slot)
    }

    pub(crate) fn host_slot(&self, handle: Handle) -> Option<HostSlot> {
        self.state().host_slots.get(handle).ok().cloned()
    }

    fn take_host_releases(&self) -> Vec<HostSlot> {
        let handles = std::mem::take(&mut self.releases().host);
        if handles.is_empty() {
            return Vec::new();
        }
        let mut state = self.state();
        handles
            .into_iter()
            .filter_map(|handle| state.host_slots.remove(handle).ok())
            .collect()
    }

    // ---- registry slots ----

    pub(crate) fn new_script_slot(self: &Arc<Self>, realm: Handle) -> SlotRef {
        let handle = self.state().script_slots.insert(ScriptSlot { realm });
        SlotRef {
            engine: Arc::downgrade(self),
            engine_id: self.id,
            realm,
            handle,
        }
    }

    /// Registry keys released for `realm`; other realms' releases stay queued.
    fn take_script_releases(&self, realm: Handle) -> Vec<String> {
        let handles = std::mem::take(&mut self.releases().script);
        if handles.is_empty() {
            return Vec::new();
        }

        let mut keys = Vec::new();
        let mut elsewhere = Vec::new();
        {
            let mut state = self.state();
            for handle in handles {
                match state.script_slots.get(handle) {
                    Ok(slot) if slot.realm == realm => {
                        let _ = state.script_slots.remove(handle);
                        keys.push(handle.to_key());
                    }
                    Ok(_) => elsewhere.push(handle),
                    Err(_) => {}
                }
            }
        }
        if !elsewhere.is_empty() {
            self.releases().script.extend(elsewhere);
        }
        keys
    }

    // ---- thread-only bindings ----

    pub(crate) fn declare_thread_only(&self, name: &str) -> bool {
        let added = self.state().thread_only.insert(name.to_string());
        if added {
            debug!(engine = self.id, name, "thread-only binding declared");
        }
        added
    }

    pub(crate) fn is_thread_only(&self, name: &str) -> bool {
        self.state().thread_only.contains(name)
    }

    // ---- hooks ----

    pub(crate) fn hooks(&self) -> Vec<Arc<dyn TypeHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn register_hook(&self, hook: Arc<dyn TypeHook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        hooks.push(hook);
        debug!(engine = self.id, hooks = hooks.len(), "type hook registered");
    }

    // ---- collection ----

    /// Full collection. While script frames are live (from inside a host
    /// callable, or with every admitted context suspended) the collection
    /// is deferred until the engine is idle.
    pub(crate) fn gc(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let thread = thread::current().id();
            let inside = state.entries.iter().any(|(_, entry)| entry.driver == thread);
            if inside || (!state.entries.is_empty() && state.blocker().is_none()) {
                state.gc_pending = true;
                debug!(engine = self.id, "collection deferred until the engine is idle");
                return Ok(());
            }
        }
        let admission = self.admit(None, None)?;
        self.submit(admission, None, |engine, _| engine.collect())
    }

    /// On the worker, with no script frames live.
    fn collect(&self) -> Result<()> {
        {
            let mut state = self.state();
            if !state.running.is_empty() {
                state.gc_pending = true;
                return Ok(());
            }
        }
        let released = std::mem::take(&mut self.releases().script);

        let (work, doomed, swept) = {
            let mut guard = self.state();
            let state = &mut *guard;

            let swept = state
                .contexts
                .extract_if(|_, record| record.link.strong_count() == 0);
            let mut live: HashSet<Handle> = state.contexts.iter().map(|(_, r)| r.realm).collect();
            live.extend(state.spare);
            let doomed = state.realms.extract_if(|handle, _| !live.contains(&handle));
            state
                .script_slots
                .extract_if(|_, slot| !live.contains(&slot.realm));

            let mut slots: HashMap<Handle, Vec<String>> = HashMap::new();
            for handle in released {
                if let Ok(slot) = state.script_slots.remove(handle) {
                    slots.entry(slot.realm).or_default().push(handle.to_key());
                }
            }
            let mut contexts: HashMap<Handle, Vec<String>> = HashMap::new();
            for (id, record) in &swept {
                if live.contains(&record.realm) {
                    contexts.entry(record.realm).or_default().push(id.to_key());
                }
            }

            let mut work = Vec::new();
            for (handle, realm) in state.realms.iter() {
                let keys = slots.remove(&handle).unwrap_or_default();
                let stacks = contexts.remove(&handle).unwrap_or_default();
                if realm.prelude && !(keys.is_empty() && stacks.is_empty()) {
                    work.push((realm.context.clone(), keys, stacks));
                }
            }
            (work, doomed, swept)
        };

        for (js, keys, stacks) in work {
            js.with(|ctx| -> Result<()> {
                let helpers = Helpers::load(&ctx).map_err(interpreter)?;
                let outcome = keys
                    .into_iter()
                    .try_for_each(|key| helpers.call::<_, ()>("release", (key,)))
                    .and_then(|()| {
                        stacks
                            .into_iter()
                            .try_for_each(|key| helpers.call::<_, ()>("releaseContext", (key,)))
                    });
                outcome.map_err(|err| {
                    // Leave no exception pending in the realm.
                    let _ = ctx.catch();
                    interpreter(err)
                })
            })?;
        }

        // Realms go before the sweep so their finalizers are drained below.
        let realms = doomed.len();
        drop(doomed);
        self.runtime.run_gc();
        let finalized = self.take_host_releases();

        debug!(
            engine = self.id,
            contexts = swept.len(),
            realms,
            finalized = finalized.len(),
            "collection finished"
        );
        drop(finalized);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.worker.stop();
        debug!(engine = self.id, "engine destroyed");
    }
}

pub(crate) enum EngineRef {
    /// Held by the top-level context: keeps the engine alive
    Owner(Arc<Engine>),
    Borrowed(Weak<Engine>),
}

/// Identity of one execution context. Dropping the last link marks the
/// context for the next collection.
pub(crate) struct ContextLink {
    engine: EngineRef,
    engine_id: u64,
    id: Handle,
}

impl ContextLink {
    pub(crate) fn engine(&self) -> Result<Arc<Engine>> {
        match &self.engine {
            EngineRef::Owner(engine) => Ok(engine.clone()),
            EngineRef::Borrowed(engine) => engine
                .upgrade()
                .ok_or_else(|| LifecycleError::EngineDestroyed.into()),
        }
    }

    pub(crate) fn id(&self) -> Handle {
        self.id
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub(crate) fn is_owner(&self) -> bool {
        matches!(self.engine, EngineRef::Owner(_))
    }
}

/// Owns one host slot on behalf of a script object. Dropping it (when the
/// collector finalizes the object) queues the slot for release.
pub(crate) struct HostSlotGuard {
    engine: Weak<Engine>,
    handle: Handle,
}

impl HostSlotGuard {
    pub(crate) fn new(engine: &Arc<Engine>, handle: Handle) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            handle,
        }
    }
}

impl Drop for HostSlotGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.releases().host.push(self.handle);
        }
    }
}

/// Host-side owner of a registry slot holding a script value.
pub(crate) struct SlotRef {
    engine: Weak<Engine>,
    engine_id: u64,
    realm: Handle,
    handle: Handle,
}

impl SlotRef {
    pub(crate) fn key(&self) -> String {
        self.handle.to_key()
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn realm(&self) -> Handle {
        self.realm
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.releases().script.push(self.handle);
        }
    }
}
