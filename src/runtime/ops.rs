//! Ops backing the script-visible globals.
//!
//! The bootstrap script wires `console`, the timer functions and
//! `DiminaServiceBridge` to these ops. All of them run on the engine thread and
//! reach the instance through `OpState`.
//!
//! Bridge payloads are converted inside the op bodies so that every
//! marshaling failure surfaces as `InternalError`. Those ops can run script
//! getters while walking the payload, so they are reentrant and only borrow
//! `OpState` after the walk.

use super::bridge::{ConsoleLevel, HostBridge};
use super::error::BridgeError;
use super::host_value::{self, HostValue};
use super::timers::{coerce_delay, SharedTimers, TimerCallback, TimerId};
use deno_core::{op2, v8, OpState};
use deno_error::JsErrorBox;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

deno_core::extension!(
    dimina_host,
    ops = [
        op_dimina_console,
        op_dimina_timer_schedule,
        op_dimina_timer_schedule_source,
        op_dimina_timer_cancel,
        op_dimina_invoke,
        op_dimina_publish,
    ],
    options = {
        bridge: HostBridge,
        timers: SharedTimers,
    },
    state = |state, options| {
        state.put(options.bridge);
        state.put(options.timers);
    },
);

/// Build the host extension for one instance.
pub(crate) fn host_extension(bridge: HostBridge, timers: SharedTimers) -> deno_core::Extension {
    dimina_host::init_ops(bridge, timers)
}

#[op2(fast)]
fn op_dimina_console(state: &mut OpState, level: u32, #[string] message: &str) {
    state
        .borrow::<HostBridge>()
        .console(ConsoleLevel::from_code(level), message.to_string());
}

#[op2]
fn op_dimina_timer_schedule(
    state: &mut OpState,
    #[global] callback: v8::Global<v8::Function>,
    delay: f64,
    repeating: bool,
) -> u32 {
    schedule(state, TimerCallback::Callable(callback), delay, repeating)
}

#[op2(fast)]
fn op_dimina_timer_schedule_source(
    state: &mut OpState,
    #[string] source: &str,
    delay: f64,
    repeating: bool,
) -> u32 {
    schedule(
        state,
        TimerCallback::SourceText(source.to_string()),
        delay,
        repeating,
    )
}

#[op2(fast)]
fn op_dimina_timer_cancel(state: &mut OpState, id: u32) {
    state.borrow::<SharedTimers>().borrow_mut().cancel(id);
}

#[op2(reentrant)]
#[serde]
fn op_dimina_invoke<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: Rc<RefCell<OpState>>,
    payload: v8::Local<'s, v8::Value>,
) -> Result<HostValue, JsErrorBox> {
    let payload = marshal(scope, payload)?;
    let bridge = state.borrow().borrow::<HostBridge>().clone();
    bridge.invoke(payload).map_err(BridgeError::into_js_error)
}

#[op2(nofast, reentrant)]
fn op_dimina_publish<'s>(
    scope: &mut v8::HandleScope<'s>,
    state: Rc<RefCell<OpState>>,
    #[string] channel: String,
    payload: v8::Local<'s, v8::Value>,
) -> Result<(), JsErrorBox> {
    let payload = marshal(scope, payload)?;
    let bridge = state.borrow().borrow::<HostBridge>().clone();
    bridge.publish(channel, payload);
    Ok(())
}

fn marshal<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<HostValue, JsErrorBox> {
    host_value::from_v8(scope, value)
        .map_err(|message| BridgeError::Marshal(message).into_js_error())
}

fn schedule(
    state: &mut OpState,
    callback: TimerCallback<v8::Global<v8::Function>>,
    delay: f64,
    repeating: bool,
) -> TimerId {
    let id = state.borrow::<SharedTimers>().borrow_mut().schedule(
        callback,
        coerce_delay(delay),
        repeating,
        Instant::now(),
    );
    tracing::trace!(
        instance = state.borrow::<HostBridge>().instance(),
        timer = id,
        repeating,
        "timer scheduled"
    );
    id
}
