//! Multi-instance JavaScript engine host.
//!
//! Each instance owns one V8 isolate (through `deno_core`) running on a
//! dedicated OS thread with a Tokio event loop. Host threads reach an instance
//! only through the [`InstanceRegistry`]; scripts reach the host only through
//! the [`HostEvent`] channel.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host_value;
pub mod logging;
mod ops;
pub mod registry;
mod runner;
pub mod timers;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use bridge::{ConsoleLevel, HostEvent, HostReceiver, InvokeResponder};
pub use config::EngineConfig;
pub use dispatcher::{EvalResponder, InstanceId, LifecycleState, Task};
pub use error::{
    BridgeError, ConfigError, CreateError, DestroyError, EvalError, InitError, Rejected,
    ScriptError,
};
pub use host_value::HostValue;
pub use logging::init_tracing;
pub use registry::InstanceRegistry;
pub use timers::TimerId;
