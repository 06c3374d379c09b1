//! Simulated device queue.
//!
//! `CpuQueue` is an ordered, asynchronous execution channel over a
//! [`CpuDevice`]: submissions return immediately with a completion token
//! and a dedicated worker thread executes operations in FIFO order,
//! resolving wait lists against an event table and firing completion
//! callbacks from the worker thread, the way a device runtime would.
//!
//! Failures can be injected per submission class to exercise the dispatch
//! engine's error paths without a misbehaving device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use relaykernel_core::config::LaunchConfig;
use relaykernel_core::device::{
    CompletionCallback, CompletionStatus, DeviceQueue, EventToken, HostBuffer, KernelHandle,
    MemHandle, RawEvent, RawKernel, RawMem,
};
use relaykernel_core::error::{RelayKernelError, Result};

use crate::device::CpuDevice;
use crate::kernel::KernelArgs;

// Vendor-style status codes reported through completion callbacks.
const STATUS_EXEC_FAILED: i32 = -5;
const STATUS_INVALID_VALUE: i32 = -30;
const STATUS_INVALID_MEM: i32 = -38;
const STATUS_INVALID_KERNEL: i32 = -48;
const STATUS_INVALID_EVENT: i32 = -58;

enum QueueOp {
    Launch {
        kernel: RawKernel,
        config: LaunchConfig,
        wait: Vec<RawEvent>,
        event: RawEvent,
    },
    Write {
        dest: RawMem,
        data: Arc<[u8]>,
        wait: Vec<RawEvent>,
        event: RawEvent,
    },
    Read {
        source: RawMem,
        dest: HostBuffer,
        len: usize,
        wait: Vec<RawEvent>,
        event: RawEvent,
    },
    Barrier {
        wait: Vec<RawEvent>,
        event: RawEvent,
    },
}

struct EventEntry {
    status: Option<CompletionStatus>,
    callbacks: Vec<CompletionCallback>,
}

/// Device-side event state: terminal status plus registered callbacks.
///
/// Entries are never removed; the table is the simulation's ground truth
/// for what completed, independent of host-side handle lifetimes.
#[derive(Default)]
struct EventTable {
    entries: Mutex<HashMap<u64, EventEntry>>,
    completed: Condvar,
}

impl EventTable {
    fn create(&self, raw: RawEvent) {
        self.entries.lock().insert(
            raw.0,
            EventEntry {
                status: None,
                callbacks: Vec::new(),
            },
        );
    }

    fn status(&self, raw: RawEvent) -> Option<CompletionStatus> {
        self.entries.lock().get(&raw.0).and_then(|e| e.status)
    }

    /// Mark `raw` terminal and fire its callbacks. Callbacks run after the
    /// table lock is dropped; they may re-enter the table.
    fn complete(&self, raw: RawEvent, status: CompletionStatus) {
        let callbacks = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&raw.0) {
                Some(entry) => {
                    entry.status = Some(status);
                    std::mem::take(&mut entry.callbacks)
                }
                None => Vec::new(),
            }
        };
        self.completed.notify_all();
        for callback in callbacks {
            callback(status);
        }
    }

    /// Block until `raw` is terminal and return its status.
    fn wait_one(&self, raw: RawEvent) -> CompletionStatus {
        let mut entries = self.entries.lock();
        loop {
            match entries.get(&raw.0) {
                None => return CompletionStatus::Error(STATUS_INVALID_EVENT),
                Some(entry) => match entry.status {
                    Some(status) => return status,
                    None => {
                        self.completed.wait(&mut entries);
                    }
                },
            }
        }
    }

    /// Block until every event in `raws` is terminal. The first error
    /// status encountered propagates.
    fn wait_all(&self, raws: &[RawEvent]) -> CompletionStatus {
        for raw in raws {
            let status = self.wait_one(*raw);
            if !status.is_complete() {
                return status;
            }
        }
        CompletionStatus::Complete
    }

    /// Register a callback on `raw`. Fires immediately, on the calling
    /// thread, if the event is already terminal.
    fn register(&self, raw: RawEvent, callback: CompletionCallback) -> Result<()> {
        let fire_now = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(&raw.0).ok_or_else(|| {
                RelayKernelError::callback(format!("event {} does not exist", raw.0))
            })?;
            match entry.status {
                Some(status) => Some((callback, status)),
                None => {
                    entry.callbacks.push(callback);
                    None
                }
            }
        };
        if let Some((callback, status)) = fire_now {
            callback(status);
        }
        Ok(())
    }
}

/// Simulated device queue with a FIFO worker thread.
pub struct CpuQueue {
    device: CpuDevice,
    sender: Mutex<mpsc::Sender<QueueOp>>,
    events: Arc<EventTable>,
    fail_next_launch: AtomicBool,
    fail_next_read: AtomicBool,
    fail_next_callback: AtomicBool,
    fail_next_flush: AtomicBool,
}

impl CpuQueue {
    /// Create a queue on `device`, spawning its worker thread. The worker
    /// exits when the last queue handle is dropped.
    pub fn new(device: CpuDevice) -> Result<Arc<Self>> {
        let (sender, receiver) = mpsc::channel();
        let events = Arc::new(EventTable::default());
        let worker_device = device.clone();
        let worker_events = Arc::clone(&events);
        std::thread::Builder::new()
            .name("relaykernel-cpu-queue".to_string())
            .spawn(move || worker_loop(worker_device, worker_events, receiver))
            .map_err(|e| {
                RelayKernelError::invalid_config(format!("failed to spawn queue worker: {}", e))
            })?;
        Ok(Arc::new(Self {
            device,
            sender: Mutex::new(sender),
            events,
            fail_next_launch: AtomicBool::new(false),
            fail_next_read: AtomicBool::new(false),
            fail_next_callback: AtomicBool::new(false),
            fail_next_flush: AtomicBool::new(false),
        }))
    }

    /// The device this queue executes on.
    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    /// Terminal status of `token`, if it completed.
    pub fn event_status(&self, token: &EventToken) -> Option<CompletionStatus> {
        token.raw().and_then(|raw| self.events.status(raw))
    }

    /// Make the next kernel launch submission fail.
    pub fn inject_launch_failure(&self) {
        self.fail_next_launch.store(true, Ordering::SeqCst);
    }

    /// Make the next buffer read submission fail.
    pub fn inject_read_failure(&self) {
        self.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Make the next callback registration fail.
    pub fn inject_callback_failure(&self) {
        self.fail_next_callback.store(true, Ordering::SeqCst);
    }

    /// Make the next flush fail.
    pub fn inject_flush_failure(&self) {
        self.fail_next_flush.store(true, Ordering::SeqCst);
    }

    fn new_event(&self) -> (RawEvent, EventToken) {
        let raw = RawEvent(self.device.next_id());
        self.device.created_event(raw);
        self.events.create(raw);
        let token = EventToken::adopted(self.device.event_ops(), raw);
        (raw, token)
    }

    fn send(&self, op: QueueOp) -> std::result::Result<(), mpsc::SendError<QueueOp>> {
        self.sender.lock().send(op)
    }
}

fn raw_waits(wait: &[EventToken]) -> Vec<RawEvent> {
    wait.iter().filter_map(EventToken::raw).collect()
}

impl DeviceQueue for CpuQueue {
    fn submit_kernel_launch(
        &self,
        kernel: &KernelHandle,
        config: &LaunchConfig,
        wait: &[EventToken],
    ) -> Result<EventToken> {
        if self.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(RelayKernelError::launch("injected launch failure"));
        }
        config
            .validate()
            .map_err(|e| RelayKernelError::launch(e.to_string()))?;
        let kernel = kernel
            .raw()
            .ok_or_else(|| RelayKernelError::launch("null kernel handle"))?;
        let (raw, token) = self.new_event();
        trace!(event = raw.0, "kernel launch submitted");
        self.send(QueueOp::Launch {
            kernel,
            config: config.clone(),
            wait: raw_waits(wait),
            event: raw,
        })
        .map_err(|_| RelayKernelError::launch("queue worker is gone"))?;
        Ok(token)
    }

    fn submit_buffer_write(
        &self,
        dest: &MemHandle,
        data: Arc<[u8]>,
        wait: &[EventToken],
    ) -> Result<EventToken> {
        let dest = dest
            .raw()
            .ok_or_else(|| RelayKernelError::transfer("null memory handle"))?;
        let (raw, token) = self.new_event();
        trace!(event = raw.0, bytes = data.len(), "buffer write submitted");
        self.send(QueueOp::Write {
            dest,
            data,
            wait: raw_waits(wait),
            event: raw,
        })
        .map_err(|_| RelayKernelError::transfer("queue worker is gone"))?;
        Ok(token)
    }

    fn submit_buffer_read(
        &self,
        source: &MemHandle,
        dest: HostBuffer,
        len: usize,
        wait: &[EventToken],
    ) -> Result<EventToken> {
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(RelayKernelError::transfer("injected read failure"));
        }
        let source = source
            .raw()
            .ok_or_else(|| RelayKernelError::transfer("null memory handle"))?;
        let (raw, token) = self.new_event();
        trace!(event = raw.0, bytes = len, "buffer read submitted");
        self.send(QueueOp::Read {
            source,
            dest,
            len,
            wait: raw_waits(wait),
            event: raw,
        })
        .map_err(|_| RelayKernelError::transfer("queue worker is gone"))?;
        Ok(token)
    }

    fn submit_barrier(&self, wait: &[EventToken]) -> Result<EventToken> {
        let (raw, token) = self.new_event();
        trace!(event = raw.0, waits = wait.len(), "barrier submitted");
        self.send(QueueOp::Barrier {
            wait: raw_waits(wait),
            event: raw,
        })
        .map_err(|_| RelayKernelError::callback("queue worker is gone"))?;
        Ok(token)
    }

    fn register_callback(&self, token: &EventToken, callback: CompletionCallback) -> Result<()> {
        if self.fail_next_callback.swap(false, Ordering::SeqCst) {
            return Err(RelayKernelError::callback(
                "injected callback registration failure",
            ));
        }
        let raw = token
            .raw()
            .ok_or_else(|| RelayKernelError::callback("null event token"))?;
        self.events.register(raw, callback)
    }

    fn flush(&self) -> Result<()> {
        if self.fail_next_flush.swap(false, Ordering::SeqCst) {
            return Err(RelayKernelError::flush("injected flush failure"));
        }
        // The worker drains eagerly; there is nothing buffered to push.
        Ok(())
    }
}

impl std::fmt::Debug for CpuQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuQueue")
            .field("device", &self.device.name())
            .finish()
    }
}

fn worker_loop(device: CpuDevice, events: Arc<EventTable>, receiver: mpsc::Receiver<QueueOp>) {
    trace!("queue worker started");
    while let Ok(op) = receiver.recv() {
        match op {
            QueueOp::Launch {
                kernel,
                config,
                wait,
                event,
            } => {
                let status = match events.wait_all(&wait) {
                    CompletionStatus::Complete => run_kernel(&device, kernel, &config),
                    propagated => propagated,
                };
                events.complete(event, status);
            }
            QueueOp::Write {
                dest,
                data,
                wait,
                event,
            } => {
                let status = match events.wait_all(&wait) {
                    CompletionStatus::Complete => write_buffer(&device, dest, &data),
                    propagated => propagated,
                };
                events.complete(event, status);
            }
            QueueOp::Read {
                source,
                dest,
                len,
                wait,
                event,
            } => {
                let status = match events.wait_all(&wait) {
                    CompletionStatus::Complete => read_buffer(&device, source, &dest, len),
                    propagated => propagated,
                };
                events.complete(event, status);
            }
            QueueOp::Barrier { wait, event } => {
                let status = events.wait_all(&wait);
                events.complete(event, status);
            }
        }
    }
    trace!("queue worker exiting");
}

fn run_kernel(device: &CpuDevice, kernel: RawKernel, config: &LaunchConfig) -> CompletionStatus {
    let kernel = {
        let kernels = device.inner().kernels.lock();
        match kernels.get(&kernel.0) {
            Some(kernel) => kernel.clone(),
            None => return CompletionStatus::Error(STATUS_INVALID_KERNEL),
        }
    };
    let mut buffers = device.inner().buffers.lock();
    let mut args = KernelArgs::new(&kernel.args, &mut buffers);
    match (kernel.func)(config, &mut args) {
        Ok(()) => CompletionStatus::Complete,
        Err(err) => {
            error!(kernel = %kernel.name, %err, "kernel execution failed");
            CompletionStatus::Error(STATUS_EXEC_FAILED)
        }
    }
}

fn write_buffer(device: &CpuDevice, dest: RawMem, data: &[u8]) -> CompletionStatus {
    let mut buffers = device.inner().buffers.lock();
    match buffers.get_mut(&dest.0) {
        None => CompletionStatus::Error(STATUS_INVALID_MEM),
        Some(buffer) if data.len() > buffer.len() => {
            CompletionStatus::Error(STATUS_INVALID_VALUE)
        }
        Some(buffer) => {
            buffer[..data.len()].copy_from_slice(data);
            CompletionStatus::Complete
        }
    }
}

fn read_buffer(
    device: &CpuDevice,
    source: RawMem,
    dest: &HostBuffer,
    len: usize,
) -> CompletionStatus {
    let buffers = device.inner().buffers.lock();
    match buffers.get(&source.0) {
        None => CompletionStatus::Error(STATUS_INVALID_MEM),
        Some(buffer) if len > buffer.len() => CompletionStatus::Error(STATUS_INVALID_VALUE),
        Some(buffer) => match dest.copy_from_slice(&buffer[..len]) {
            Ok(()) => CompletionStatus::Complete,
            Err(_) => CompletionStatus::Error(STATUS_INVALID_VALUE),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn wait_for(status: impl Fn() -> bool) {
        for _ in 0..500 {
            if status() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for queue");
    }

    #[test]
    fn test_write_launch_read_pipeline() {
        let device = CpuDevice::default();
        let queue = CpuQueue::new(device.clone()).unwrap();

        let input = device.create_buffer(4);
        let output = device.create_buffer(4);
        let kernel = device
            .create_kernel("double", &[&input, &output], Arc::new(|_, args| {
                let data = args.read(0)?;
                let doubled: Vec<u8> = data.iter().map(|&b| b * 2).collect();
                args.write(1, &doubled)
            }))
            .unwrap();

        let write = queue
            .submit_buffer_write(&input, Arc::from(&[1u8, 2, 3, 4][..]), &[])
            .unwrap();
        let launch = queue
            .submit_kernel_launch(
                &kernel,
                &LaunchConfig::new(vec![4]),
                std::slice::from_ref(&write),
            )
            .unwrap();

        let dest = HostBuffer::new();
        dest.resize(4);
        let read = queue
            .submit_buffer_read(&output, dest.clone(), 4, std::slice::from_ref(&launch))
            .unwrap();
        let barrier = queue.submit_barrier(std::slice::from_ref(&read)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        queue
            .register_callback(
                &barrier,
                Box::new(move |status| {
                    done_tx.send(status).ok();
                }),
            )
            .unwrap();
        queue.flush().unwrap();

        let status = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.is_complete());
        assert_eq!(dest.to_vec(), vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_callback_after_completion_fires_immediately() {
        let device = CpuDevice::default();
        let queue = CpuQueue::new(device.clone()).unwrap();
        let buffer = device.create_buffer(1);

        let write = queue
            .submit_buffer_write(&buffer, Arc::from(&[7u8][..]), &[])
            .unwrap();
        wait_for(|| queue.event_status(&write).is_some());

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        queue
            .register_callback(
                &write,
                Box::new(move |status| {
                    assert!(status.is_complete());
                    flag.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_error_status_propagates_through_waits() {
        let device = CpuDevice::default();
        let queue = CpuQueue::new(device.clone()).unwrap();
        let small = device.create_buffer(2);

        // Write larger than the buffer fails at execution time.
        let bad = queue
            .submit_buffer_write(&small, Arc::from(&[0u8; 8][..]), &[])
            .unwrap();
        let barrier = queue.submit_barrier(std::slice::from_ref(&bad)).unwrap();
        wait_for(|| queue.event_status(&barrier).is_some());
        assert_eq!(
            queue.event_status(&barrier),
            Some(CompletionStatus::Error(STATUS_INVALID_VALUE))
        );
    }

    #[test]
    fn test_failure_injection_is_one_shot() {
        let device = CpuDevice::default();
        let queue = CpuQueue::new(device.clone()).unwrap();
        let buffer = device.create_buffer(4);
        let kernel = device
            .create_kernel("noop", &[&buffer], Arc::new(|_, _| Ok(())))
            .unwrap();
        let config = LaunchConfig::new(vec![1]);

        queue.inject_launch_failure();
        assert!(queue.submit_kernel_launch(&kernel, &config, &[]).is_err());
        assert!(queue.submit_kernel_launch(&kernel, &config, &[]).is_ok());

        queue.inject_flush_failure();
        assert!(queue.flush().is_err());
        assert!(queue.flush().is_ok());
    }

    #[test]
    fn test_launch_rejects_invalid_config() {
        let device = CpuDevice::default();
        let queue = CpuQueue::new(device.clone()).unwrap();
        let buffer = device.create_buffer(4);
        let kernel = device
            .create_kernel("noop", &[&buffer], Arc::new(|_, _| Ok(())))
            .unwrap();

        let err = queue
            .submit_kernel_launch(&kernel, &LaunchConfig::new(vec![]), &[])
            .unwrap_err();
        assert!(matches!(err, RelayKernelError::LaunchSubmission(_)));
    }
}
