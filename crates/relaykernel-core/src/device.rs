//! Device queue abstraction.
//!
//! A [`DeviceQueue`] is an ordered, asynchronous execution channel on a
//! compute device. Submission calls return immediately with a completion
//! token; actual execution and the eventual completion callbacks happen on
//! a thread owned by the device runtime. Ordering between operations is
//! expressed purely as data flow through wait lists of tokens, never by
//! blocking the submitting thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::LaunchConfig;
use crate::error::{RelayKernelError, Result};
use crate::handle::DeviceHandle;

/// Raw identifier of a device-side event object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent(pub u64);

/// Raw identifier of a device-side memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawMem(pub u64);

/// Raw identifier of a compiled device kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawKernel(pub u64);

/// Owning handle to a device event. Used both as a wait precondition for
/// later submissions and as the target of a completion callback.
pub type EventToken = DeviceHandle<RawEvent>;

/// Owning handle to a device memory object.
pub type MemHandle = DeviceHandle<RawMem>;

/// Owning handle to a compiled kernel.
pub type KernelHandle = DeviceHandle<RawKernel>;

/// Terminal status a device operation reports to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The operation completed successfully.
    Complete,
    /// The operation failed with a vendor error code.
    Error(i32),
}

impl CompletionStatus {
    /// Whether this is the successful terminal state.
    pub fn is_complete(&self) -> bool {
        matches!(self, CompletionStatus::Complete)
    }
}

/// One-shot completion callback, invoked on a device-runtime thread.
pub type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Shared host-side byte storage a buffer read writes into.
///
/// The destination of an asynchronous read must outlive the submission, so
/// the storage is shared between the submitter and the device runtime and
/// sized lazily at read-back time.
#[derive(Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize the storage to `len` bytes, zero-filling new space.
    pub fn resize(&self, len: usize) {
        self.bytes.lock().resize(len, 0);
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Overwrite the storage with `src`. Fails if the lengths differ, which
    /// indicates a submission sized against stale storage.
    pub fn copy_from_slice(&self, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        if bytes.len() != src.len() {
            return Err(RelayKernelError::command(format!(
                "host buffer length mismatch: storage is {} bytes, source is {}",
                bytes.len(),
                src.len()
            )));
        }
        bytes.copy_from_slice(src);
        Ok(())
    }

    /// Snapshot the storage contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostBuffer({} bytes)", self.len())
    }
}

/// An ordered asynchronous execution channel on a compute device.
///
/// All submissions return immediately. Returned tokens carry one owned
/// device-side reference, transferred to the caller (handles are adopted,
/// not retained). Implementations must not invoke a callback passed to
/// [`DeviceQueue::register_callback`] when registration fails; on failure
/// the callback box is dropped unfired.
pub trait DeviceQueue: Send + Sync + 'static {
    /// Submit a kernel launch over the configured index range, ordered
    /// after every token in `wait`.
    fn submit_kernel_launch(
        &self,
        kernel: &KernelHandle,
        config: &LaunchConfig,
        wait: &[EventToken],
    ) -> Result<EventToken>;

    /// Submit an asynchronous write of `data` into `dest`, ordered after
    /// every token in `wait`. The queue holds `data` until the write
    /// executes.
    fn submit_buffer_write(
        &self,
        dest: &MemHandle,
        data: Arc<[u8]>,
        wait: &[EventToken],
    ) -> Result<EventToken>;

    /// Submit an asynchronous read of `len` bytes from `source` into
    /// `dest`, ordered after every token in `wait`.
    fn submit_buffer_read(
        &self,
        source: &MemHandle,
        dest: HostBuffer,
        len: usize,
        wait: &[EventToken],
    ) -> Result<EventToken>;

    /// Submit a marker with no work of its own that completes once every
    /// token in `wait` has completed.
    fn submit_barrier(&self, wait: &[EventToken]) -> Result<EventToken>;

    /// Register a one-shot callback fired when `token` reaches a terminal
    /// status. If the token already completed, the callback fires
    /// immediately on the registering thread.
    fn register_callback(&self, token: &EventToken, callback: CompletionCallback) -> Result<()>;

    /// Force submission of all queued work to the device. Work already
    /// submitted remains valid even if the flush fails.
    fn flush(&self) -> Result<()>;
}
