//! Script-to-host bridge: blocking `invoke`, fire-and-forget `publish`, and
//! console forwarding.
//!
//! Everything the engine sends to the host travels as a [`HostEvent`] over one
//! unbounded channel. `invoke` parks the engine thread on a
//! [`PendingInvocation`] until a host thread answers through the
//! [`InvokeResponder`] or the instance starts closing.

use super::dispatcher::InstanceId;
use super::error::{BridgeError, ScriptError};
use super::host_value::HostValue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Console severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            1 => ConsoleLevel::Info,
            2 => ConsoleLevel::Warn,
            3 => ConsoleLevel::Error,
            _ => ConsoleLevel::Log,
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Messages from engine instances to the host.
#[derive(Debug)]
pub enum HostEvent {
    /// A blocking call. The engine thread waits until `responder` is used or dropped.
    Invoke {
        instance: InstanceId,
        payload: HostValue,
        responder: InvokeResponder,
    },
    Publish {
        instance: InstanceId,
        channel: String,
        payload: HostValue,
    },
    Console {
        instance: InstanceId,
        level: ConsoleLevel,
        message: String,
    },
    /// An uncaught exception from a task or timer callback.
    ScriptError {
        instance: InstanceId,
        error: ScriptError,
    },
}

/// Sending half of the host mailbox, shared by all instances of a registry.
#[derive(Clone)]
pub(crate) struct HostChannel {
    sender: mpsc::UnboundedSender<HostEvent>,
}

impl HostChannel {
    pub(crate) fn new() -> (Self, HostReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, HostReceiver { receiver })
    }

    pub(crate) fn send(&self, event: HostEvent) -> Result<(), BridgeError> {
        self.sender
            .send(event)
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// The host's end of the event mailbox.
pub struct HostReceiver {
    receiver: mpsc::UnboundedReceiver<HostEvent>,
}

impl HostReceiver {
    /// Wait for the next event. Returns `None` once every instance and the
    /// registry are gone.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        self.receiver.recv().await
    }

    /// Blocking variant for host threads outside any async runtime.
    pub fn blocking_recv(&mut self) -> Option<HostEvent> {
        self.receiver.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<HostEvent> {
        self.receiver.try_recv().ok()
    }
}

enum InvocationState {
    Waiting,
    Resolved(Result<HostValue, BridgeError>),
    Closing,
}

/// Single-assignment result cell for one `invoke` call.
pub(crate) struct PendingInvocation {
    state: Mutex<InvocationState>,
    ready: Condvar,
}

impl PendingInvocation {
    fn new() -> Self {
        Self {
            state: Mutex::new(InvocationState::Waiting),
            ready: Condvar::new(),
        }
    }

    /// Store the result. Only the first resolution counts.
    fn complete(&self, result: Result<HostValue, BridgeError>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, InvocationState::Waiting) {
            return false;
        }
        *state = InvocationState::Resolved(result);
        self.ready.notify_all();
        true
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if matches!(*state, InvocationState::Waiting) {
            *state = InvocationState::Closing;
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<HostValue, BridgeError> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, InvocationState::Closing) {
                InvocationState::Waiting => {
                    *state = InvocationState::Waiting;
                    self.ready.wait(&mut state);
                }
                InvocationState::Resolved(result) => return result,
                InvocationState::Closing => return Err(BridgeError::InstanceClosing),
            }
        }
    }
}

/// Host-side handle that answers one `invoke` call.
///
/// Dropping it without answering fails the call with
/// [`BridgeError::HostDropped`].
pub struct InvokeResponder {
    pending: Option<Arc<PendingInvocation>>,
}

impl InvokeResponder {
    fn new(pending: Arc<PendingInvocation>) -> Self {
        Self {
            pending: Some(pending),
        }
    }

    /// Return a value to the script. Returns false if the call was already
    /// cancelled by instance teardown.
    pub fn resolve(mut self, value: impl Into<HostValue>) -> bool {
        let value = value.into();
        let result = match value.check_limits() {
            Ok(()) => Ok(value),
            Err(message) => Err(BridgeError::Marshal(message)),
        };
        self.finish(result)
    }

    /// Raise an `InternalError` in the script with `message`.
    pub fn reject(mut self, message: impl Into<String>) -> bool {
        self.finish(Err(BridgeError::HostRejected(message.into())))
    }

    fn finish(&mut self, result: Result<HostValue, BridgeError>) -> bool {
        match self.pending.take() {
            Some(pending) => pending.complete(result),
            None => false,
        }
    }
}

impl Drop for InvokeResponder {
    fn drop(&mut self) {
        self.finish(Err(BridgeError::HostDropped));
    }
}

impl fmt::Debug for InvokeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeResponder")
            .field("answered", &self.pending.is_none())
            .finish()
    }
}

#[derive(Default)]
struct GateState {
    closing: bool,
    in_flight: Option<Arc<PendingInvocation>>,
}

/// Tracks the invocation in flight so teardown can fail it.
#[derive(Default)]
pub(crate) struct InvocationGate {
    state: Mutex<GateState>,
}

impl InvocationGate {
    fn begin(&self) -> Result<Arc<PendingInvocation>, BridgeError> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(BridgeError::InstanceClosing);
        }
        let pending = Arc::new(PendingInvocation::new());
        state.in_flight = Some(Arc::clone(&pending));
        Ok(pending)
    }

    fn finish(&self) {
        self.state.lock().in_flight = None;
    }

    /// Refuse new invocations and fail the one in flight, if any.
    pub(crate) fn close(&self) {
        let in_flight = {
            let mut state = self.state.lock();
            state.closing = true;
            state.in_flight.take()
        };
        if let Some(pending) = in_flight {
            pending.cancel();
        }
    }
}

/// Per-instance bridge handed to the ops through `OpState`.
#[derive(Clone)]
pub(crate) struct HostBridge {
    instance: InstanceId,
    channel: HostChannel,
    gate: Arc<InvocationGate>,
    console_enabled: bool,
}

impl HostBridge {
    pub(crate) fn new(
        instance: InstanceId,
        channel: HostChannel,
        gate: Arc<InvocationGate>,
        console_enabled: bool,
    ) -> Self {
        Self {
            instance,
            channel,
            gate,
            console_enabled,
        }
    }

    pub(crate) fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Send `payload` to the host and block until it answers.
    pub(crate) fn invoke(&self, payload: HostValue) -> Result<HostValue, BridgeError> {
        payload.check_limits().map_err(BridgeError::Marshal)?;

        let pending = self.gate.begin()?;
        let event = HostEvent::Invoke {
            instance: self.instance,
            payload,
            responder: InvokeResponder::new(Arc::clone(&pending)),
        };
        let result = match self.channel.send(event) {
            Ok(()) => pending.wait(),
            // The responder inside the rejected event already failed the call.
            Err(err) => Err(err),
        };
        self.gate.finish();
        result
    }

    /// Queue `payload` for the host without waiting. Failures are logged.
    pub(crate) fn publish(&self, channel: String, payload: HostValue) {
        if let Err(message) = payload.check_limits() {
            tracing::warn!(
                instance = self.instance,
                %channel,
                "dropping publish: {}",
                message
            );
            return;
        }
        let event = HostEvent::Publish {
            instance: self.instance,
            channel,
            payload,
        };
        if let Err(err) = self.channel.send(event) {
            tracing::warn!(instance = self.instance, "dropping publish: {}", err);
        }
    }

    pub(crate) fn console(&self, level: ConsoleLevel, message: String) {
        if !self.console_enabled {
            return;
        }
        match level {
            ConsoleLevel::Error => {
                tracing::error!(target: "dimina_jscore::console", instance = self.instance, "{}", message)
            }
            ConsoleLevel::Warn => {
                tracing::warn!(target: "dimina_jscore::console", instance = self.instance, "{}", message)
            }
            ConsoleLevel::Info | ConsoleLevel::Log => {
                tracing::info!(target: "dimina_jscore::console", instance = self.instance, %level, "{}", message)
            }
        }
        let _ = self.channel.send(HostEvent::Console {
            instance: self.instance,
            level,
            message,
        });
    }

    pub(crate) fn report_error(&self, error: ScriptError) {
        tracing::error!(instance = self.instance, "uncaught exception: {}", error);
        let _ = self.channel.send(HostEvent::ScriptError {
            instance: self.instance,
            error,
        });
    }
}
