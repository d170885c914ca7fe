//! Host for Dimina service-layer JavaScript engines.
//!
//! Every instance runs its own isolate on a dedicated thread. The host submits
//! tasks through an [`InstanceRegistry`] and receives console output, script
//! errors, `publish` messages and blocking `invoke` calls as [`HostEvent`]s.

pub mod runtime;

pub use runtime::{
    init_tracing, BridgeError, ConfigError, ConsoleLevel, CreateError, DestroyError,
    EngineConfig, EvalError, EvalResponder, HostEvent, HostReceiver, HostValue, InitError,
    InstanceId, InstanceRegistry, InvokeResponder, LifecycleState, Rejected, ScriptError, Task,
    TimerId,
};
