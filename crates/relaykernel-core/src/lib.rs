//! # RelayKernel Core
//!
//! Backend-agnostic core of the RelayKernel command-dispatch engine: it
//! bridges a request/response messaging abstraction to an accelerator's
//! command queue. One [`Command`](command::Command) is created per kernel
//! invocation; completion tokens express data-flow ordering between the
//! launch, the per-output read-backs, and the barrier the completion
//! callback is armed on.
//!
//! ## Core Abstractions
//!
//! - [`DeviceHandle`](handle::DeviceHandle) - retain/release ownership of
//!   native device resources
//! - [`DeviceQueue`](device::DeviceQueue) - asynchronous submission
//!   channel on a compute device
//! - [`KernelFacade`](facade::KernelFacade) - kernel + queue + launch
//!   configuration shared by all commands invoking one kernel
//! - [`Command`](command::Command) - one in-flight kernel invocation
//! - [`ResponsePromise`](promise::ResponsePromise) - write-once reply
//!   delivery across the device-thread boundary
//! - [`DeviceRegistry`](registry::DeviceRegistry) - explicit device
//!   discovery, no global state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod facade;
pub mod handle;
pub mod output;
pub mod promise;
pub mod registry;

pub use command::{Command, CommandId, KeepAlive};
pub use config::LaunchConfig;
pub use device::{
    CompletionCallback, CompletionStatus, DeviceQueue, EventToken, HostBuffer, KernelHandle,
    MemHandle, RawEvent, RawKernel, RawMem,
};
pub use error::{RelayKernelError, Result};
pub use facade::KernelFacade;
pub use handle::{DeviceHandle, ResourceOps};
pub use output::{MapResults, OutputSlot, OutputSpec, OutputValue, Reply, ScalarType};
pub use promise::{response_channel, ResponseFuture, ResponsePromise};
pub use registry::{DeviceId, DeviceInfo, DeviceRegistry, PlatformProvider};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::command::{Command, CommandId};
    pub use crate::config::LaunchConfig;
    pub use crate::device::{
        CompletionStatus, DeviceQueue, EventToken, HostBuffer, KernelHandle, MemHandle,
    };
    pub use crate::error::{RelayKernelError, Result};
    pub use crate::facade::KernelFacade;
    pub use crate::handle::{DeviceHandle, ResourceOps};
    pub use crate::output::{OutputSpec, OutputValue, Reply, ScalarType};
    pub use crate::promise::{response_channel, ResponseFuture, ResponsePromise};
    pub use crate::registry::{DeviceId, DeviceInfo, DeviceRegistry, PlatformProvider};
}
