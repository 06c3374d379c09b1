//! CPU simulation backend for RelayKernel.
//!
//! This backend executes kernels on the host, simulating an accelerator's
//! behavior: a FIFO worker thread plays the device runtime, completion
//! callbacks fire from that thread, and every native resource carries an
//! observable simulated reference count. It is primarily used for testing
//! and as a fallback when no accelerator is available.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod device;
mod kernel;
mod queue;

pub use device::{CpuDevice, CpuPlatform, RefStats, ResourceKind};
pub use kernel::{KernelArgs, KernelFn};
pub use queue::CpuQueue;
