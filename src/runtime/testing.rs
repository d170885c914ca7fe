//! Host-side test harness: a thread that drains a registry's events, records
//! them, and answers invocations.

use super::bridge::{ConsoleLevel, HostEvent, HostReceiver, InvokeResponder};
use super::dispatcher::InstanceId;
use super::error::ScriptError;
use super::host_value::HostValue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const WAIT: Duration = Duration::from_secs(10);

/// How the recorder answers an `invoke`.
pub(crate) enum InvokeReply {
    Resolve(HostValue),
    Reject(String),
    /// Keep the responder until the test calls [`HostRecorder::release_held`].
    Hold,
}

#[derive(Default)]
pub(crate) struct Recorded {
    pub(crate) console: Vec<(InstanceId, ConsoleLevel, String)>,
    pub(crate) errors: Vec<(InstanceId, ScriptError)>,
    pub(crate) published: Vec<(InstanceId, String, HostValue)>,
    pub(crate) invokes: Vec<(InstanceId, HostValue)>,
    held: Vec<InvokeResponder>,
}

struct Shared {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

pub(crate) struct HostRecorder {
    shared: Arc<Shared>,
}

impl HostRecorder {
    pub(crate) fn spawn<H>(mut receiver: HostReceiver, mut handler: H) -> Self
    where
        H: FnMut(InstanceId, &HostValue) -> InvokeReply + Send + 'static,
    {
        let shared = Arc::new(Shared {
            recorded: Mutex::new(Recorded::default()),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);

        thread::Builder::new()
            .name("host-recorder".to_string())
            .spawn(move || {
                while let Some(event) = receiver.blocking_recv() {
                    let mut recorded = worker.recorded.lock();
                    match event {
                        HostEvent::Console {
                            instance,
                            level,
                            message,
                        } => recorded.console.push((instance, level, message)),
                        HostEvent::ScriptError { instance, error } => {
                            recorded.errors.push((instance, error))
                        }
                        HostEvent::Publish {
                            instance,
                            channel,
                            payload,
                        } => recorded.published.push((instance, channel, payload)),
                        HostEvent::Invoke {
                            instance,
                            payload,
                            responder,
                        } => {
                            let reply = handler(instance, &payload);
                            recorded.invokes.push((instance, payload));
                            match reply {
                                InvokeReply::Resolve(value) => {
                                    responder.resolve(value);
                                }
                                InvokeReply::Reject(message) => {
                                    responder.reject(message);
                                }
                                InvokeReply::Hold => recorded.held.push(responder),
                            }
                        }
                    }
                    worker.changed.notify_all();
                }
            })
            .expect("failed to spawn host recorder");

        Self { shared }
    }

    /// Recorder that rejects every invocation.
    pub(crate) fn passive(receiver: HostReceiver) -> Self {
        Self::spawn(receiver, |_, _| InvokeReply::Reject("no handler".to_string()))
    }

    pub(crate) fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.shared.recorded.lock()
    }

    pub(crate) fn console_lines(&self, instance: InstanceId) -> Vec<String> {
        lines_for(&self.recorded(), instance)
    }

    /// Wait until `instance` has logged at least `count` lines.
    pub(crate) fn wait_for_console(&self, instance: InstanceId, count: usize) -> Vec<String> {
        self.wait_until(|recorded| {
            let lines = lines_for(recorded, instance);
            (lines.len() >= count).then_some(lines)
        })
        .unwrap_or_else(|| {
            panic!(
                "timed out waiting for {} console lines from instance {}; got {:?}",
                count,
                instance,
                self.console_lines(instance)
            )
        })
    }

    pub(crate) fn wait_for_errors(&self, count: usize) -> Vec<(InstanceId, ScriptError)> {
        self.wait_until(|recorded| {
            (recorded.errors.len() >= count).then(|| recorded.errors.clone())
        })
        .unwrap_or_else(|| panic!("timed out waiting for {} script errors", count))
    }

    pub(crate) fn wait_for_invokes(&self, count: usize) {
        self.wait_until(|recorded| (recorded.invokes.len() >= count).then_some(()))
            .unwrap_or_else(|| panic!("timed out waiting for {} invocations", count));
    }

    pub(crate) fn wait_for_publishes(&self, count: usize) -> Vec<(InstanceId, String, HostValue)> {
        self.wait_until(|recorded| {
            (recorded.published.len() >= count).then(|| recorded.published.clone())
        })
        .unwrap_or_else(|| panic!("timed out waiting for {} publishes", count))
    }

    /// Answer every held invocation with `value`.
    pub(crate) fn release_held(&self, value: HostValue) {
        let held = std::mem::take(&mut self.recorded().held);
        for responder in held {
            responder.resolve(value.clone());
        }
    }

    fn wait_until<T>(&self, mut check: impl FnMut(&Recorded) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + WAIT;
        let mut recorded = self.shared.recorded.lock();
        loop {
            if let Some(value) = check(&recorded) {
                return Some(value);
            }
            if self
                .shared
                .changed
                .wait_until(&mut recorded, deadline)
                .timed_out()
            {
                return check(&recorded);
            }
        }
    }
}

fn lines_for(recorded: &Recorded, instance: InstanceId) -> Vec<String> {
    recorded
        .console
        .iter()
        .filter(|(id, _, _)| *id == instance)
        .map(|(_, _, message)| message.clone())
        .collect()
}
