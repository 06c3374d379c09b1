//! Host-closure kernels.
//!
//! The simulation backend stands in for a compiled device kernel with a
//! host closure over the bound argument buffers. Arguments are bound at
//! kernel creation, before any command references the kernel, matching
//! how a real facade prepares a kernel before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use relaykernel_core::config::LaunchConfig;
use relaykernel_core::device::RawMem;
use relaykernel_core::error::{RelayKernelError, Result};

/// Kernel body: reads and writes its bound argument buffers.
pub type KernelFn = Arc<dyn Fn(&LaunchConfig, &mut KernelArgs<'_>) -> Result<()> + Send + Sync>;

/// A registered host kernel with its argument buffers bound in call order.
#[derive(Clone)]
pub(crate) struct CpuKernel {
    pub(crate) name: String,
    pub(crate) args: Vec<RawMem>,
    pub(crate) func: KernelFn,
}

impl CpuKernel {
    pub(crate) fn new(name: String, args: Vec<RawMem>, func: KernelFn) -> Self {
        Self { name, args, func }
    }
}

/// View over a kernel's bound argument buffers during execution.
pub struct KernelArgs<'a> {
    ids: &'a [RawMem],
    buffers: &'a mut HashMap<u64, Vec<u8>>,
}

impl<'a> KernelArgs<'a> {
    pub(crate) fn new(ids: &'a [RawMem], buffers: &'a mut HashMap<u64, Vec<u8>>) -> Self {
        Self { ids, buffers }
    }

    /// Number of bound arguments.
    pub fn arg_count(&self) -> usize {
        self.ids.len()
    }

    fn resolve(&self, index: usize) -> Result<u64> {
        self.ids
            .get(index)
            .map(|raw| raw.0)
            .ok_or_else(|| {
                RelayKernelError::command(format!(
                    "kernel argument {} out of range ({} bound)",
                    index,
                    self.ids.len()
                ))
            })
    }

    /// Copy out the bytes of argument `index`.
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let id = self.resolve(index)?;
        self.buffers.get(&id).cloned().ok_or_else(|| {
            RelayKernelError::command(format!("kernel argument {} buffer was destroyed", index))
        })
    }

    /// Overwrite the bytes of argument `index`. `data` must match the
    /// buffer's length.
    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let id = self.resolve(index)?;
        let buffer = self.buffers.get_mut(&id).ok_or_else(|| {
            RelayKernelError::command(format!("kernel argument {} buffer was destroyed", index))
        })?;
        if buffer.len() != data.len() {
            return Err(RelayKernelError::command(format!(
                "kernel argument {} is {} bytes, write of {} bytes rejected",
                index,
                buffer.len(),
                data.len()
            )));
        }
        buffer.copy_from_slice(data);
        Ok(())
    }
}
