//! Instance registry: creation, lookup, submission and teardown ordering.

use crate::runtime::bridge::{HostChannel, HostReceiver};
use crate::runtime::config::EngineConfig;
use crate::runtime::dispatcher::{InstanceId, LifecycleState, Task};
use crate::runtime::error::{CreateError, DestroyError, EvalError, Rejected, ScriptError};
use crate::runtime::host_value::HostValue;
use crate::runtime::runner::{spawn_engine_thread, EngineThread, InstanceShared};
use crate::runtime::timers::TimerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

struct InstanceEntry {
    shared: Arc<InstanceShared>,
    // None while the engine is starting or being destroyed.
    engine: Option<EngineThread>,
}

/// Table of live engine instances.
///
/// An id stays in the table until its engine thread has joined, so it cannot
/// be reused while the previous instance is still tearing down.
pub struct InstanceRegistry {
    config: EngineConfig,
    channel: HostChannel,
    instances: Mutex<HashMap<InstanceId, InstanceEntry>>,
}

impl InstanceRegistry {
    /// Create a registry and the receiver for every event its instances send.
    pub fn new(config: EngineConfig) -> (Self, HostReceiver) {
        let (channel, receiver) = HostChannel::new();
        let registry = Self {
            config,
            channel,
            instances: Mutex::new(HashMap::new()),
        };
        (registry, receiver)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start an engine for `id`. Returns once the engine is running or has
    /// failed to initialize; a failed instance is never registered.
    pub fn create(&self, id: InstanceId) -> Result<(), CreateError> {
        let shared = {
            let mut instances = self.instances.lock();
            if instances.contains_key(&id) {
                return Err(CreateError::AlreadyExists(id));
            }
            let shared = Arc::new(InstanceShared::new(id));
            instances.insert(
                id,
                InstanceEntry {
                    shared: Arc::clone(&shared),
                    engine: None,
                },
            );
            shared
        };

        match spawn_engine_thread(&self.config, shared, self.channel.clone()) {
            Ok(engine) => {
                if let Some(entry) = self.instances.lock().get_mut(&id) {
                    entry.engine = Some(engine);
                }
                tracing::info!(instance = id, "instance created");
                Ok(())
            }
            Err(err) => {
                self.instances.lock().remove(&id);
                tracing::error!(instance = id, "instance initialization failed: {}", err);
                Err(CreateError::InitFailed(err))
            }
        }
    }

    /// Queue a task on an instance.
    pub fn submit(&self, id: InstanceId, task: impl Into<Task>) -> Result<(), Rejected> {
        let shared = self.lookup(id).ok_or(Rejected::NotFound(id))?;
        shared.mailbox.push(task.into())
    }

    pub fn submit_source(&self, id: InstanceId, code: impl Into<String>) -> Result<(), Rejected> {
        self.submit(id, Task::source(code))
    }

    /// Run `code` on an instance and wait for its completion value.
    ///
    /// The script runs in order with the instance's other tasks. Blocks the
    /// calling thread, so it must not be called from inside an async runtime;
    /// use [`evaluate_async`](Self::evaluate_async) there.
    pub fn evaluate(
        &self,
        id: InstanceId,
        code: impl Into<String>,
    ) -> Result<HostValue, EvalError> {
        let receiver = self.submit_eval(id, code.into())?;
        match receiver.blocking_recv() {
            Ok(result) => result.map_err(EvalError::Script),
            Err(_) => Err(EvalError::Closed(id)),
        }
    }

    pub async fn evaluate_async(
        &self,
        id: InstanceId,
        code: impl Into<String>,
    ) -> Result<HostValue, EvalError> {
        let receiver = self.submit_eval(id, code.into())?;
        match receiver.await {
            Ok(result) => result.map_err(EvalError::Script),
            Err(_) => Err(EvalError::Closed(id)),
        }
    }

    fn submit_eval(
        &self,
        id: InstanceId,
        code: String,
    ) -> Result<oneshot::Receiver<Result<HostValue, ScriptError>>, Rejected> {
        let (task, receiver) = Task::eval(code);
        self.submit(id, task)?;
        Ok(receiver)
    }

    /// Cancel a timer from a host thread. The cancellation runs on the engine
    /// thread in order with the instance's other tasks.
    pub fn cancel_timer(&self, id: InstanceId, timer: TimerId) -> Result<(), Rejected> {
        self.submit(id, Task::CancelTimer(timer))
    }

    /// Tear an instance down and wait for its engine thread to exit.
    ///
    /// A pending `invoke` is failed with `InstanceClosing`. With
    /// `terminate_on_destroy`, running script is interrupted as well.
    pub fn destroy(&self, id: InstanceId) -> Result<(), DestroyError> {
        let (shared, engine) = {
            let mut instances = self.instances.lock();
            let entry = instances.get_mut(&id).ok_or(DestroyError::NotFound(id))?;
            let engine = entry.engine.take().ok_or(DestroyError::NotFound(id))?;
            (Arc::clone(&entry.shared), engine)
        };

        shared.mailbox.begin_close();
        shared.gate.close();
        if self.config.terminate_on_destroy {
            engine.isolate.terminate_execution();
        }

        if engine.thread.join().is_err() {
            tracing::error!(instance = id, "engine thread panicked during teardown");
            shared.mailbox.set_state(LifecycleState::Closed);
        }

        self.instances.lock().remove(&id);
        tracing::info!(instance = id, "instance destroyed");
        Ok(())
    }

    pub fn state(&self, id: InstanceId) -> Option<LifecycleState> {
        self.lookup(id).map(|shared| shared.mailbox.state())
    }

    /// Ids of all registered instances, in ascending order.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Destroy every running instance.
    pub fn shutdown(&self) {
        for id in self.instance_ids() {
            if let Err(err) = self.destroy(id) {
                tracing::debug!(instance = id, "skipped during shutdown: {}", err);
            }
        }
    }

    fn lookup(&self, id: InstanceId) -> Option<Arc<InstanceShared>> {
        self.instances
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.shared))
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
