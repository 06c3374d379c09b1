//! # RelayKernel
//!
//! Asynchronous command dispatch from request/response messaging to an
//! accelerator's command queue.
//!
//! RelayKernel launches one compute-kernel invocation per request, tracks
//! its input/output transfer dependencies as opaque completion tokens,
//! and, when the device signals completion, converts the raw output
//! buffers into a reply delivered to the original requester. The calling
//! thread never blocks: ordering is data flow between completion tokens,
//! enforced by the device queue.
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaykernel::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let runtime = RelayKernel::builder().backend(Backend::Cpu).build()?;
//!
//!     let input = runtime.device().create_buffer(16);
//!     let output = runtime.device().create_buffer(16);
//!     let kernel = runtime.device().create_kernel(
//!         "scale",
//!         &[&input, &output],
//!         Arc::new(|_, args| {
//!             let data = args.read(0)?;
//!             args.write(1, &data)
//!         }),
//!     )?;
//!
//!     let facade = Arc::new(runtime.facade(kernel, LaunchConfig::new(vec![4])));
//!     let reply = Invocation::new(facade)
//!         .write_argument(input, Arc::from(&[0u8; 16][..]))?
//!         .argument(output)
//!         .output(1, ScalarType::F32, 4)
//!         .submit()?
//!         .wait()
//!         .await?;
//!
//!     println!("reply: {:?}", reply);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use relaykernel_core::*;

// Re-export the CPU backend (always available)
pub use relaykernel_cpu::{CpuDevice, CpuPlatform, CpuQueue, KernelArgs, KernelFn, RefStats, ResourceKind};

use std::fmt;
use std::sync::Arc;

use relaykernel_core::command::{Command, KeepAlive};
use relaykernel_core::config::LaunchConfig;
use relaykernel_core::device::{DeviceQueue, EventToken, KernelHandle, MemHandle};
use relaykernel_core::error::Result;
use relaykernel_core::facade::KernelFacade;
use relaykernel_core::output::{OutputSpec, ScalarType};
use relaykernel_core::promise::{response_channel, ResponseFuture};
use relaykernel_core::registry::DeviceRegistry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Backend, Invocation, RelayKernel, RelayKernelBuilder};
    pub use relaykernel_core::prelude::*;
    pub use relaykernel_cpu::{CpuDevice, CpuPlatform, CpuQueue, KernelArgs};
}

/// Which device backend a runtime executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Pick the best available backend.
    Auto,
    /// CPU simulation backend.
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Main RelayKernel runtime facade.
///
/// Owns the device, its queue, and the discovery registry, and hands out
/// the pieces an [`Invocation`] needs.
pub struct RelayKernel {
    backend: Backend,
    registry: DeviceRegistry,
    device: CpuDevice,
    queue: Arc<CpuQueue>,
}

impl RelayKernel {
    /// Create a new runtime builder.
    pub fn builder() -> RelayKernelBuilder {
        RelayKernelBuilder::new()
    }

    /// Create a runtime with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The active backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The device discovery registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The runtime's device.
    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    /// The runtime's command queue.
    pub fn queue(&self) -> Arc<dyn DeviceQueue> {
        Arc::clone(&self.queue) as Arc<dyn DeviceQueue>
    }

    /// The concrete CPU queue, for inspection and failure injection.
    pub fn cpu_queue(&self) -> &Arc<CpuQueue> {
        &self.queue
    }

    /// Build a facade for `kernel` on this runtime's queue.
    pub fn facade(&self, kernel: KernelHandle, config: LaunchConfig) -> KernelFacade {
        KernelFacade::new(self.queue(), kernel, config)
    }
}

impl fmt::Debug for RelayKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayKernel")
            .field("backend", &self.backend)
            .field("devices", &self.registry.device_count())
            .finish()
    }
}

/// Builder for [`RelayKernel`].
pub struct RelayKernelBuilder {
    backend: Backend,
    device_name: String,
}

impl RelayKernelBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: Backend::Auto,
            device_name: "relaykernel-cpu".to_string(),
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the device name reported by discovery.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<RelayKernel> {
        let backend = match self.backend {
            Backend::Auto | Backend::Cpu => Backend::Cpu,
        };
        let device = CpuDevice::new(self.device_name);
        let queue = CpuQueue::new(device.clone())?;
        let mut registry = DeviceRegistry::new();
        registry.register(Arc::new(CpuPlatform::new(vec![device.clone()])));
        tracing::info!(%backend, device = device.name(), "RelayKernel runtime initialized");
        Ok(RelayKernel {
            backend,
            registry,
            device,
            queue,
        })
    }
}

impl Default for RelayKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One kernel invocation under assembly.
///
/// Collects the argument buffers, input-write preconditions, declared
/// output slots, and the keep-alive payload, then constructs and enqueues
/// the [`Command`]. Argument order is binding order; output slots refer to
/// arguments by index.
pub struct Invocation {
    facade: Arc<KernelFacade>,
    input_events: Vec<EventToken>,
    arguments: Vec<MemHandle>,
    outputs: Vec<OutputSpec>,
    payload: Option<KeepAlive>,
}

impl Invocation {
    /// Start assembling an invocation of `facade`.
    pub fn new(facade: Arc<KernelFacade>) -> Self {
        Self {
            facade,
            input_events: Vec::new(),
            arguments: Vec::new(),
            outputs: Vec::new(),
            payload: None,
        }
    }

    /// Bind an argument buffer as-is.
    pub fn argument(mut self, buffer: MemHandle) -> Self {
        self.arguments.push(buffer);
        self
    }

    /// Bind an argument buffer and submit an asynchronous write of `data`
    /// into it; the write's completion token becomes a launch
    /// precondition.
    pub fn write_argument(mut self, buffer: MemHandle, data: Arc<[u8]>) -> Result<Self> {
        let token = self
            .facade
            .queue()
            .submit_buffer_write(&buffer, data, &[])?;
        self.input_events.push(token);
        self.arguments.push(buffer);
        Ok(self)
    }

    /// Add an extra launch precondition established elsewhere.
    pub fn wait_on(mut self, token: EventToken) -> Self {
        self.input_events.push(token);
        self
    }

    /// Declare an output slot reading back `len` elements of `ty` from
    /// argument `arg_index`. Declaration order is reply order.
    pub fn output(mut self, arg_index: usize, ty: ScalarType, len: usize) -> Self {
        self.outputs.push(OutputSpec::new(arg_index, ty, len));
        self
    }

    /// Attach an opaque payload kept alive until the command is destroyed,
    /// shielding input data the device is still reading asynchronously.
    pub fn payload(mut self, payload: KeepAlive) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Build the command without enqueuing it.
    pub fn build(self) -> Result<(Arc<Command>, ResponseFuture)> {
        let (promise, future) = response_channel();
        let command = Command::new(
            promise,
            self.facade,
            self.input_events,
            self.arguments,
            self.outputs,
            self.payload,
        )?;
        Ok((command, future))
    }

    /// Build and enqueue the command, returning the reply future.
    pub fn submit(self) -> Result<ResponseFuture> {
        let (command, future) = self.build()?;
        command.enqueue()?;
        Ok(future)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("arguments", &self.arguments.len())
            .field("inputs", &self.input_events.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
