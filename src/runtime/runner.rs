//! Engine thread backed by `deno_core::JsRuntime`.
//!
//! Each instance owns one OS thread running a single-threaded Tokio runtime.
//! The isolate is created, driven and dropped on that thread only. The loop
//! wakes on new tasks, timer deadlines and the close signal; every pass drains
//! the microtask queue before it waits again.

use crate::runtime::bridge::{HostBridge, HostChannel, InvocationGate};
use crate::runtime::config::EngineConfig;
use crate::runtime::dispatcher::{InstanceId, LifecycleState, Mailbox, Task};
use crate::runtime::error::{InitError, ScriptError};
use crate::runtime::host_value::{self, HostValue};
use crate::runtime::ops::host_extension;
use crate::runtime::timers::{DueTimer, SharedTimers, TimerCallback, TimerTable};
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

const BOOTSTRAP_JS: &str = include_str!("js/bootstrap.js");

/// State shared between the registry and an engine thread.
pub(crate) struct InstanceShared {
    pub(crate) id: InstanceId,
    pub(crate) mailbox: Mailbox,
    pub(crate) gate: Arc<InvocationGate>,
}

impl InstanceShared {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            mailbox: Mailbox::new(id),
            gate: Arc::new(InvocationGate::default()),
        }
    }
}

/// A running engine thread.
pub(crate) struct EngineThread {
    pub(crate) thread: JoinHandle<()>,
    pub(crate) isolate: v8::IsolateHandle,
}

type InitSignal = Result<v8::IsolateHandle, InitError>;

/// Start the engine thread for `shared` and wait until it is `Running` or failed.
pub(crate) fn spawn_engine_thread(
    config: &EngineConfig,
    shared: Arc<InstanceShared>,
    channel: HostChannel,
) -> Result<EngineThread, InitError> {
    config.validate()?;
    shared.mailbox.set_state(LifecycleState::Starting);

    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<InitSignal>(1);
    let mut builder = std::thread::Builder::new().name(config.thread_name(shared.id));
    if let Some(stack_size) = config.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let engine_config = config.clone();
    let thread = builder
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(InitError::EventLoop(err)));
                    return;
                }
            };

            let mut core = match EngineCore::new(&engine_config, shared, channel) {
                Ok(core) => core,
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            let isolate = core.js_runtime.v8_isolate().thread_safe_handle();
            if !core
                .shared
                .mailbox
                .transition(LifecycleState::Starting, LifecycleState::Running)
            {
                let _ = init_tx.send(Err(InitError::EngineExited));
                core.teardown();
                return;
            }
            let _ = init_tx.send(Ok(isolate));

            tokio_rt.block_on(core.run());
            core.teardown();
        })
        .map_err(InitError::ThreadSpawn)?;

    match init_rx.recv() {
        Ok(Ok(isolate)) => Ok(EngineThread { thread, isolate }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(InitError::EngineExited)
        }
    }
}

struct EngineCore {
    js_runtime: JsRuntime,
    shared: Arc<InstanceShared>,
    bridge: HostBridge,
    timers: SharedTimers,
    created: Instant,
    started: bool,
}

impl EngineCore {
    fn new(
        config: &EngineConfig,
        shared: Arc<InstanceShared>,
        channel: HostChannel,
    ) -> Result<Self, InitError> {
        let bridge = HostBridge::new(
            shared.id,
            channel,
            Arc::clone(&shared.gate),
            config.enable_console,
        );
        let timers: SharedTimers = Rc::new(RefCell::new(TimerTable::new()));
        let extension = host_extension(bridge.clone(), Rc::clone(&timers));

        let create_params = config.max_heap_size.map(|max| {
            let initial = config.initial_heap_size.unwrap_or(0);
            v8::CreateParams::default().heap_limits(initial, max)
        });

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![extension],
            create_params,
            ..Default::default()
        });

        js_runtime
            .execute_script("ext:dimina/bootstrap.js", BOOTSTRAP_JS.to_string())
            .map_err(|err| InitError::Bootstrap(ScriptError::from(err)))?;

        let mut core = Self {
            js_runtime,
            shared,
            bridge,
            timers,
            created: Instant::now(),
            started: false,
        };

        if let Some(script) = config.bootstrap_script.clone() {
            core.js_runtime
                .execute_script("<bootstrap>", script)
                .map_err(|err| InitError::Bootstrap(ScriptError::from(err)))?;
            core.drain_microtasks();
        }

        tracing::debug!(instance = core.shared.id, "engine initialized");
        Ok(core)
    }

    async fn run(&mut self) {
        loop {
            if self.shared.mailbox.is_closing() {
                break;
            }
            self.drain_microtasks();

            let fired = self.fire_due_timers();
            if self.shared.mailbox.is_closing() {
                break;
            }

            let ran = match self.shared.mailbox.pop() {
                Some(task) => {
                    self.run_task(task);
                    true
                }
                None => false,
            };

            if !fired && !ran {
                self.wait_for_work().await;
            }
        }
    }

    /// Park until a task or close request arrives, or the earliest timer is due.
    async fn wait_for_work(&mut self) {
        let deadline = self.timers.borrow_mut().next_deadline();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.shared.mailbox.notified() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            None => self.shared.mailbox.notified().await,
        }
    }

    fn run_task(&mut self, task: Task) {
        if !self.started {
            self.started = true;
            tracing::info!(
                instance = self.shared.id,
                elapsed = ?self.created.elapsed(),
                "first task started"
            );
        }

        let result = match task {
            Task::Source { code } => self.evaluate("<task>", code),
            Task::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(code) => self.evaluate("<task>", code),
                Err(err) => Err(ScriptError::new(
                    "TypeError",
                    format!("task payload is not valid UTF-8: {}", err),
                )),
            },
            Task::File(path) => match std::fs::read_to_string(&path) {
                Ok(code) => {
                    let code = format!("{}\n//# sourceURL={}", code, path.display());
                    self.evaluate("<file>", code)
                }
                Err(err) => Err(ScriptError::new(
                    "Error",
                    format!("failed to read {}: {}", path.display(), err),
                )),
            },
            Task::CancelTimer(id) => {
                self.timers.borrow_mut().cancel(id);
                Ok(())
            }
            // Errors go to the caller; only report them if it stopped waiting.
            Task::Eval { code, responder } => match responder.send(self.evaluate_value(code)) {
                Err(Err(error)) => Err(error),
                _ => Ok(()),
            },
        };

        if let Err(error) = result {
            self.report(error);
        }
    }

    fn evaluate(&mut self, name: &'static str, code: String) -> Result<(), ScriptError> {
        self.js_runtime
            .execute_script(name, code)
            .map(|_| ())
            .map_err(ScriptError::from)
    }

    fn evaluate_value(&mut self, code: String) -> Result<HostValue, ScriptError> {
        let value = self
            .js_runtime
            .execute_script("<eval>", code)
            .map_err(ScriptError::from)?;

        let scope = &mut self.js_runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let value = v8::Local::new(tc, value);
        host_value::from_v8(tc, value).map_err(|message| ScriptError::new("InternalError", message))
    }

    /// Fire every timer that was due when the pass started.
    fn fire_due_timers(&mut self) -> bool {
        let slots = self.timers.borrow_mut().collect_due(Instant::now());
        let mut fired = false;

        for slot in slots {
            if self.shared.mailbox.is_closing() {
                break;
            }
            let Some(timer) = self.timers.borrow_mut().begin_fire(slot) else {
                continue;
            };
            fired = true;

            if let Err(error) = self.call_timer(&timer) {
                self.report(error);
            }
            if timer.repeating {
                self.timers.borrow_mut().rearm(&timer, Instant::now());
            }
            self.drain_microtasks();
        }

        fired
    }

    fn call_timer(
        &mut self,
        timer: &DueTimer<v8::Global<v8::Function>>,
    ) -> Result<(), ScriptError> {
        match timer.callback.as_ref() {
            TimerCallback::Callable(function) => self.call_function(function),
            TimerCallback::SourceText(source) => self.evaluate("<timer>", source.clone()),
        }
    }

    fn call_function(&mut self, function: &v8::Global<v8::Function>) -> Result<(), ScriptError> {
        let scope = &mut self.js_runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let callback = v8::Local::new(tc, function);
        let receiver = tc.get_current_context().global(tc).into();

        if callback.call(tc, receiver, &[]).is_some() {
            return Ok(());
        }
        match tc.exception() {
            Some(exception) => {
                let error = JsError::from_v8_exception(tc, exception);
                Err(ScriptError::from_js_error(&error))
            }
            None => Err(ScriptError::new("Error", "execution terminated")),
        }
    }

    fn drain_microtasks(&mut self) {
        self.js_runtime.v8_isolate().perform_microtask_checkpoint();
    }

    fn report(&self, error: ScriptError) {
        if self.shared.mailbox.is_closing() {
            tracing::debug!(instance = self.shared.id, "error during close: {}", error);
            return;
        }
        self.bridge.report_error(error);
    }

    /// Release everything in reverse order of acquisition, then mark `Closed`.
    fn teardown(self) {
        let Self {
            js_runtime,
            shared,
            timers,
            ..
        } = self;

        shared.gate.close();
        let discarded = shared.mailbox.discard_pending();
        let cancelled = timers.borrow_mut().cancel_all();
        drop(js_runtime);
        drop(timers);

        shared.mailbox.set_state(LifecycleState::Closed);
        tracing::debug!(
            instance = shared.id,
            discarded_tasks = discarded,
            cancelled_timers = cancelled,
            "engine closed"
        );
    }
}
