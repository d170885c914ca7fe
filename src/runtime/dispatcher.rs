//! Cross-thread task mailbox for a single engine instance.
//!
//! Host threads push tasks under the mailbox lock; the engine thread pops them
//! one at a time. The lock also guards the lifecycle state, so a submission can
//! never slip in after the instance started closing.

use super::error::{Rejected, ScriptError};
use super::host_value::HostValue;
use super::timers::TimerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Notify};

/// Identifier of an engine instance, unique among live instances.
pub type InstanceId = u32;

/// Lifecycle of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}

/// Receives the completion value of a [`Task::Eval`].
pub type EvalResponder = oneshot::Sender<Result<HostValue, ScriptError>>;

/// A unit of work submitted by the host.
#[derive(Debug)]
pub enum Task {
    /// Script source text.
    Source { code: String },
    /// Script source as raw bytes. Must be valid UTF-8.
    Bytes(Vec<u8>),
    /// Script file, read on the engine thread.
    File(PathBuf),
    /// Cancel a timer from outside the engine thread.
    CancelTimer(TimerId),
    /// Script source whose completion value is sent back to the host.
    Eval {
        code: String,
        responder: EvalResponder,
    },
}

impl Task {
    pub fn source(code: impl Into<String>) -> Self {
        Task::Source { code: code.into() }
    }

    /// An `Eval` task and the receiver for its result.
    pub fn eval(
        code: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Result<HostValue, ScriptError>>) {
        let (responder, receiver) = oneshot::channel();
        let task = Task::Eval {
            code: code.into(),
            responder,
        };
        (task, receiver)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Task::Source { code } | Task::Eval { code, .. } => code.is_empty(),
            Task::Bytes(bytes) => bytes.is_empty(),
            Task::File(path) => path.as_os_str().is_empty(),
            Task::CancelTimer(_) => false,
        }
    }
}

impl From<&str> for Task {
    fn from(code: &str) -> Self {
        Task::source(code)
    }
}

impl From<String> for Task {
    fn from(code: String) -> Self {
        Task::Source { code }
    }
}

struct MailboxInner {
    state: LifecycleState,
    queue: VecDeque<Task>,
}

pub(crate) struct Mailbox {
    id: InstanceId,
    inner: Mutex<MailboxInner>,
    wake: Notify,
}

impl Mailbox {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            inner: Mutex::new(MailboxInner {
                state: LifecycleState::Uninitialized,
                queue: VecDeque::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Enqueue a task. Wakes the loop only on the empty to non-empty edge.
    pub(crate) fn push(&self, task: Task) -> Result<(), Rejected> {
        if task.is_empty() {
            return Err(Rejected::EmptyTask);
        }

        let was_empty = {
            let mut inner = self.inner.lock();
            if inner.state != LifecycleState::Running {
                return Err(Rejected::NotRunning(self.id, inner.state));
            }
            let was_empty = inner.queue.is_empty();
            inner.queue.push_back(task);
            was_empty
        };

        if was_empty {
            self.wake.notify_one();
        }
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.inner.lock().queue.pop_front()
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.inner.lock().state = state;
    }

    /// Move `from` to `to`. Returns false if the state was something else.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        true
    }

    /// Mark the instance closing and wake the loop. Submissions fail from here on.
    pub(crate) fn begin_close(&self) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            match inner.state {
                LifecycleState::Closing | LifecycleState::Closed => false,
                _ => {
                    inner.state = LifecycleState::Closing;
                    true
                }
            }
        };
        self.wake.notify_one();
        changed
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(
            self.inner.lock().state,
            LifecycleState::Closing | LifecycleState::Closed
        )
    }

    /// Drop every queued task. Returns how many were discarded.
    pub(crate) fn discard_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.queue.len();
        inner.queue.clear();
        count
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }
}
