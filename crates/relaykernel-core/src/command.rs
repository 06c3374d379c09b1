//! The command dispatch engine.
//!
//! One [`Command`] per kernel invocation. A command owns the precondition
//! tokens established by prior buffer writes, the argument buffer handles,
//! the declared output slots, and the response promise. `enqueue` drives
//! the launch → read-back → barrier → callback protocol; the device
//! runtime later fires the callback exactly once on its own thread, which
//! decodes the outputs and delivers the reply.
//!
//! While a command is in flight it is kept alive by one extra `Arc`
//! reference owned by the completion closure ("owned by the device
//! queue"). That reference is taken exactly once at the start of `enqueue`
//! and dropped exactly once: on a synchronous submission failure, or when
//! the completion closure returns.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::device::{CompletionCallback, CompletionStatus, DeviceQueue, EventToken, MemHandle};
use crate::error::{RelayKernelError, Result};
use crate::facade::KernelFacade;
use crate::output::{OutputSlot, OutputSpec, Reply};
use crate::promise::ResponsePromise;

/// Correlation id for one command, used in log output only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque payload held for the command's lifetime to keep input argument
/// data alive while the device is still reading it asynchronously.
pub type KeepAlive = Box<dyn Any + Send + Sync>;

/// One kernel invocation in flight on a device queue.
pub struct Command {
    id: CommandId,
    /// Write-once delivery target. Emptied on first delivery; a late or
    /// duplicate completion finds nothing to deliver.
    promise: Mutex<Option<ResponsePromise>>,
    facade: Arc<KernelFacade>,
    /// Preconditions established by prior operations, unordered.
    input_events: Vec<EventToken>,
    /// Launch token first, then one read token per slot in declaration
    /// order, then exactly one trailing barrier token.
    output_events: Mutex<Vec<EventToken>>,
    /// Argument buffers, owned for the command's duration.
    arguments: Vec<MemHandle>,
    /// Declared output slots, fixed at construction.
    outputs: Vec<OutputSlot>,
    payload: Option<KeepAlive>,
    enqueued: AtomicBool,
}

impl Command {
    /// Create a command. `output_specs` must reference argument indices
    /// within `arguments`; slot order is the declaration order replies
    /// preserve.
    pub fn new(
        promise: ResponsePromise,
        facade: Arc<KernelFacade>,
        input_events: Vec<EventToken>,
        arguments: Vec<MemHandle>,
        output_specs: Vec<OutputSpec>,
        payload: Option<KeepAlive>,
    ) -> Result<Arc<Self>> {
        for spec in &output_specs {
            if spec.arg_index >= arguments.len() {
                return Err(RelayKernelError::command(format!(
                    "output slot references argument {} but only {} arguments are bound",
                    spec.arg_index,
                    arguments.len()
                )));
            }
        }
        let outputs = output_specs.into_iter().map(OutputSlot::new).collect();
        Ok(Arc::new(Self {
            id: CommandId::generate(),
            promise: Mutex::new(Some(promise)),
            facade,
            input_events,
            output_events: Mutex::new(Vec::new()),
            arguments,
            outputs,
            payload,
            enqueued: AtomicBool::new(false),
        }))
    }

    /// This command's correlation id.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Number of declared output slots.
    pub fn output_slot_count(&self) -> usize {
        self.outputs.len()
    }

    /// Whether the keep-alive payload is still held.
    pub fn holds_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Submit this invocation to the device queue.
    ///
    /// Every submission failure (launch, read-back, callback registration)
    /// is logged, delivered to the requester through the response promise,
    /// and returned from this call; the in-flight self-reference is
    /// released on each of those paths. A flush failure is logged only.
    pub fn enqueue(self: &Arc<Self>) -> Result<()> {
        trace!(command = %self.id, "command::enqueue");
        if self.enqueued.swap(true, Ordering::SeqCst) {
            // The first submission is still in flight; its promise must not
            // be consumed by this misuse.
            return Err(RelayKernelError::command("command already enqueued"));
        }

        // Reference held by the device queue until the completion closure
        // runs (or a submission fails below).
        let in_flight = Arc::clone(self);
        let queue = Arc::clone(self.facade.queue());

        let launch = match queue.submit_kernel_launch(
            self.facade.kernel(),
            self.facade.launch_config(),
            &self.input_events,
        ) {
            Ok(token) => token,
            Err(err) => {
                error!(command = %self.id, %err, "kernel launch submission failed");
                drop(in_flight);
                self.deliver(Err(err.clone()));
                return Err(err);
            }
        };
        self.output_events.lock().push(launch.clone());

        if let Err(err) = self.submit_read_backs(&launch) {
            error!(command = %self.id, %err, "read-back submission failed");
            drop(in_flight);
            self.deliver(Err(err.clone()));
            return Err(err);
        }

        let barrier = {
            let events = self.output_events.lock();
            queue.submit_barrier(events.as_slice())
        };
        let barrier = match barrier {
            Ok(token) => token,
            Err(err) => {
                error!(command = %self.id, %err, "barrier submission failed");
                drop(in_flight);
                self.deliver(Err(err.clone()));
                return Err(err);
            }
        };
        self.output_events.lock().push(barrier.clone());

        let callback: CompletionCallback = Box::new(move |status| {
            in_flight.complete(status);
        });
        if let Err(err) = queue.register_callback(&barrier, callback) {
            // The closure, and with it the in-flight reference, was
            // consumed by the failed registration. Reads already submitted
            // keep running on the device; their results are discarded.
            error!(command = %self.id, %err, "completion callback registration failed; submitted work is orphaned");
            self.deliver(Err(err.clone()));
            return Err(err);
        }

        if let Err(err) = queue.flush() {
            warn!(command = %self.id, %err, "queue flush failed; submitted work remains valid");
        }
        Ok(())
    }

    /// Submit one buffer read per declared output slot, each waiting on
    /// the launch-completion token, appending tokens in declaration order.
    fn submit_read_backs(&self, kernel_done: &EventToken) -> Result<()> {
        let queue = self.facade.queue();
        for (index, slot) in self.outputs.iter().enumerate() {
            let byte_len = slot.spec().byte_len();
            slot.storage().resize(byte_len);
            let source = &self.arguments[slot.spec().arg_index];
            let token = queue.submit_buffer_read(
                source,
                slot.storage().clone(),
                byte_len,
                std::slice::from_ref(kernel_done),
            )?;
            debug!(command = %self.id, slot = index, bytes = byte_len, "read-back submitted");
            self.output_events.lock().push(token);
        }
        Ok(())
    }

    /// Terminal completion, invoked on the device runtime's thread.
    fn complete(&self, status: CompletionStatus) {
        match status {
            CompletionStatus::Complete => self.handle_results(),
            CompletionStatus::Error(code) => {
                error!(command = %self.id, code, "device reported error status");
                self.deliver(Err(RelayKernelError::Device(code)));
            }
        }
    }

    /// Decode all output slots in declaration order, apply the facade's
    /// result mapping if present, and deliver the reply.
    fn handle_results(&self) {
        let mut values: Reply = Vec::with_capacity(self.outputs.len());
        for slot in &self.outputs {
            match slot.decode() {
                Ok(value) => values.push(value),
                Err(err) => {
                    error!(command = %self.id, %err, "output decoding failed");
                    self.deliver(Err(err));
                    return;
                }
            }
        }
        let reply = match self.facade.map_results() {
            Some(map) => map(values),
            None => values,
        };
        self.deliver(Ok(reply));
    }

    /// Deliver the outcome through the promise, at most once.
    fn deliver(&self, outcome: Result<Reply>) {
        match self.promise.lock().take() {
            Some(promise) => promise.deliver(outcome),
            None => {
                debug!(command = %self.id, "outcome already delivered; dropping duplicate");
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("inputs", &self.input_events.len())
            .field("arguments", &self.arguments.len())
            .field("outputs", &self.outputs.len())
            .field("enqueued", &self.enqueued.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::device::{
        DeviceQueue, HostBuffer, KernelHandle, RawEvent, RawKernel, RawMem,
    };
    use crate::handle::{DeviceHandle, ResourceOps};
    use crate::output::{OutputValue, ScalarType};
    use crate::promise::response_channel;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;

    /// Event ref-count table standing in for the device runtime's.
    #[derive(Default)]
    struct EventRefs {
        counts: Mutex<HashMap<u64, i64>>,
    }

    impl EventRefs {
        fn count(&self, raw: u64) -> i64 {
            self.counts.lock().get(&raw).copied().unwrap_or(0)
        }

        fn all_released(&self) -> bool {
            self.counts.lock().values().all(|&c| c == 0)
        }
    }

    impl ResourceOps<RawEvent> for EventRefs {
        fn retain(&self, raw: RawEvent) {
            *self.counts.lock().entry(raw.0).or_insert(0) += 1;
        }

        fn release(&self, raw: RawEvent) {
            *self.counts.lock().entry(raw.0).or_insert(0) -= 1;
        }
    }

    struct NoopOps;

    impl ResourceOps<RawKernel> for NoopOps {
        fn retain(&self, _raw: RawKernel) {}
        fn release(&self, _raw: RawKernel) {}
    }

    impl ResourceOps<RawMem> for NoopOps {
        fn retain(&self, _raw: RawMem) {}
        fn release(&self, _raw: RawMem) {}
    }

    /// Queue double that records submissions and lets tests fire the
    /// registered callback by hand.
    #[derive(Default)]
    struct MockQueue {
        refs: Arc<EventRefs>,
        next_event: AtomicU64,
        created: Mutex<Vec<RawEvent>>,
        callbacks: Mutex<Vec<CompletionCallback>>,
        launches: AtomicU64,
        reads: AtomicU64,
        barriers: AtomicU64,
        flushes: AtomicU64,
        fail_launch: AtomicBool,
        fail_read: AtomicBool,
        fail_register: AtomicBool,
    }

    impl MockQueue {
        fn new_event(&self) -> EventToken {
            let raw = RawEvent(self.next_event.fetch_add(1, Ordering::Relaxed) + 1);
            self.refs.retain(raw); // the owned reference transferred to the token
            self.created.lock().push(raw);
            DeviceHandle::adopted(Arc::clone(&self.refs) as Arc<dyn ResourceOps<RawEvent>>, raw)
        }

        fn fire(&self, status: CompletionStatus) -> usize {
            let callbacks: Vec<_> = self.callbacks.lock().drain(..).collect();
            let fired = callbacks.len();
            for callback in callbacks {
                callback(status);
            }
            fired
        }
    }

    impl DeviceQueue for MockQueue {
        fn submit_kernel_launch(
            &self,
            _kernel: &KernelHandle,
            _config: &LaunchConfig,
            _wait: &[EventToken],
        ) -> crate::error::Result<EventToken> {
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(RelayKernelError::launch("injected"));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(self.new_event())
        }

        fn submit_buffer_write(
            &self,
            _dest: &MemHandle,
            _data: Arc<[u8]>,
            _wait: &[EventToken],
        ) -> crate::error::Result<EventToken> {
            Ok(self.new_event())
        }

        fn submit_buffer_read(
            &self,
            _source: &MemHandle,
            dest: HostBuffer,
            len: usize,
            _wait: &[EventToken],
        ) -> crate::error::Result<EventToken> {
            if self.fail_read.load(Ordering::SeqCst) {
                return Err(RelayKernelError::transfer("injected"));
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            assert_eq!(dest.len(), len);
            Ok(self.new_event())
        }

        fn submit_barrier(&self, _wait: &[EventToken]) -> crate::error::Result<EventToken> {
            self.barriers.fetch_add(1, Ordering::SeqCst);
            Ok(self.new_event())
        }

        fn register_callback(
            &self,
            _token: &EventToken,
            callback: CompletionCallback,
        ) -> crate::error::Result<()> {
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(RelayKernelError::callback("injected"));
            }
            self.callbacks.lock().push(callback);
            Ok(())
        }

        fn flush(&self) -> crate::error::Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_facade(queue: &Arc<MockQueue>) -> Arc<KernelFacade> {
        let kernel = KernelHandle::adopted(
            Arc::new(NoopOps) as Arc<dyn ResourceOps<RawKernel>>,
            RawKernel(1),
        );
        Arc::new(KernelFacade::new(
            Arc::clone(queue) as Arc<dyn DeviceQueue>,
            kernel,
            LaunchConfig::new(vec![4]),
        ))
    }

    fn mem_handle(raw: u64) -> MemHandle {
        MemHandle::adopted(Arc::new(NoopOps) as Arc<dyn ResourceOps<RawMem>>, RawMem(raw))
    }

    #[test]
    fn test_zero_slot_command_submits_launch_and_barrier_only() {
        let queue = Arc::new(MockQueue::default());
        let (promise, mut future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        cmd.enqueue().unwrap();
        assert_eq!(queue.launches.load(Ordering::SeqCst), 1);
        assert_eq!(queue.reads.load(Ordering::SeqCst), 0);
        assert_eq!(queue.barriers.load(Ordering::SeqCst), 1);
        assert_eq!(queue.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.created.lock().len(), 2);

        assert_eq!(queue.fire(CompletionStatus::Complete), 1);
        let reply = future.try_wait().unwrap().unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn test_tokens_match_slots_plus_two() {
        let queue = Arc::new(MockQueue::default());
        let (promise, _future) = response_channel();
        let cmd = Command::new(
            promise,
            test_facade(&queue),
            vec![],
            vec![mem_handle(1), mem_handle(2)],
            vec![
                OutputSpec::new(0, ScalarType::F32, 1),
                OutputSpec::new(1, ScalarType::F64, 1),
            ],
            None,
        )
        .unwrap();

        cmd.enqueue().unwrap();
        let created: Vec<RawEvent> = queue.created.lock().clone();
        assert_eq!(created.len(), 4); // launch + 2 reads + barrier
        for raw in &created {
            assert_eq!(queue.refs.count(raw.0), 1, "command owns each token once");
        }
        queue.fire(CompletionStatus::Complete);
        drop(cmd);
        assert!(queue.refs.all_released());
    }

    #[test]
    fn test_in_flight_reference_accounting() {
        let queue = Arc::new(MockQueue::default());
        let (promise, _future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        assert_eq!(Arc::strong_count(&cmd), 1);
        cmd.enqueue().unwrap();
        assert_eq!(Arc::strong_count(&cmd), 2); // held by the registered callback
        queue.fire(CompletionStatus::Complete);
        assert_eq!(Arc::strong_count(&cmd), 1);
    }

    #[test]
    fn test_launch_failure_restores_state_and_reports() {
        let queue = Arc::new(MockQueue::default());
        queue.fail_launch.store(true, Ordering::SeqCst);
        let (promise, mut future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        let err = cmd.enqueue().unwrap_err();
        assert!(matches!(err, RelayKernelError::LaunchSubmission(_)));
        assert_eq!(Arc::strong_count(&cmd), 1);
        assert!(queue.callbacks.lock().is_empty());
        assert_eq!(queue.created.lock().len(), 0);
        assert_eq!(future.try_wait().unwrap(), Err(err));
    }

    #[test]
    fn test_read_failure_propagates_and_reports() {
        let queue = Arc::new(MockQueue::default());
        queue.fail_read.store(true, Ordering::SeqCst);
        let (promise, mut future) = response_channel();
        let cmd = Command::new(
            promise,
            test_facade(&queue),
            vec![],
            vec![mem_handle(1)],
            vec![OutputSpec::new(0, ScalarType::I32, 2)],
            None,
        )
        .unwrap();

        let err = cmd.enqueue().unwrap_err();
        assert!(matches!(err, RelayKernelError::TransferSubmission(_)));
        assert_eq!(Arc::strong_count(&cmd), 1);
        assert!(queue.callbacks.lock().is_empty());
        assert_eq!(future.try_wait().unwrap(), Err(err));
        drop(cmd);
        assert!(queue.refs.all_released());
    }

    #[test]
    fn test_callback_registration_failure_reports() {
        let queue = Arc::new(MockQueue::default());
        queue.fail_register.store(true, Ordering::SeqCst);
        let (promise, mut future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        let err = cmd.enqueue().unwrap_err();
        assert!(matches!(err, RelayKernelError::CallbackRegistration(_)));
        assert_eq!(Arc::strong_count(&cmd), 1);
        assert_eq!(future.try_wait().unwrap(), Err(err));
    }

    #[test]
    fn test_double_enqueue_rejected() {
        let queue = Arc::new(MockQueue::default());
        let (promise, _future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        cmd.enqueue().unwrap();
        let err = cmd.enqueue().unwrap_err();
        assert!(matches!(err, RelayKernelError::Command(_)));
        // The first submission is still in flight and completes normally.
        assert_eq!(queue.fire(CompletionStatus::Complete), 1);
    }

    #[test]
    fn test_duplicate_completion_is_inert() {
        let queue = Arc::new(MockQueue::default());
        let (promise, mut future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        cmd.enqueue().unwrap();
        queue.fire(CompletionStatus::Complete);
        assert!(future.try_wait().unwrap().is_ok());
        // A second terminal notification finds the promise already taken.
        cmd.complete(CompletionStatus::Complete);
        cmd.complete(CompletionStatus::Error(-1));
    }

    #[test]
    fn test_device_error_status_delivers_error() {
        let queue = Arc::new(MockQueue::default());
        let (promise, mut future) = response_channel();
        let cmd = Command::new(promise, test_facade(&queue), vec![], vec![], vec![], None).unwrap();

        cmd.enqueue().unwrap();
        queue.fire(CompletionStatus::Error(-36));
        assert_eq!(
            future.try_wait().unwrap(),
            Err(RelayKernelError::Device(-36))
        );
    }

    #[test]
    fn test_map_results_applied() {
        let queue = Arc::new(MockQueue::default());
        let kernel = KernelHandle::adopted(
            Arc::new(NoopOps) as Arc<dyn ResourceOps<RawKernel>>,
            RawKernel(1),
        );
        let facade = Arc::new(
            KernelFacade::new(
                Arc::clone(&queue) as Arc<dyn DeviceQueue>,
                kernel,
                LaunchConfig::new(vec![4]),
            )
            .with_map_results(|values| {
                let total: f64 = values.iter().map(OutputValue::sum_as_f64).sum();
                vec![OutputValue::F64(vec![total])]
            }),
        );
        let (promise, mut future) = response_channel();
        let cmd = Command::new(
            promise,
            facade,
            vec![],
            vec![mem_handle(1)],
            vec![OutputSpec::new(0, ScalarType::U8, 4)],
            None,
        )
        .unwrap();

        cmd.enqueue().unwrap();
        // Storage was zero-filled at read-back sizing; the mock performs no
        // copy, so the sum over four u8 zeros is 0.
        queue.fire(CompletionStatus::Complete);
        let reply = future.try_wait().unwrap().unwrap();
        assert_eq!(reply, vec![OutputValue::F64(vec![0.0])]);
    }

    #[test]
    fn test_slot_storage_sized_at_read_back() {
        let queue = Arc::new(MockQueue::default());
        let (promise, _future) = response_channel();
        let cmd = Command::new(
            promise,
            test_facade(&queue),
            vec![],
            vec![mem_handle(1), mem_handle(2)],
            vec![
                OutputSpec::new(0, ScalarType::U8, 4),
                OutputSpec::new(1, ScalarType::U8, 8),
            ],
            None,
        )
        .unwrap();

        cmd.enqueue().unwrap();
        assert_eq!(cmd.outputs[0].storage().len(), 4);
        assert_eq!(cmd.outputs[1].storage().len(), 8);
        queue.fire(CompletionStatus::Complete);
    }

    #[test]
    fn test_out_of_range_output_spec_rejected() {
        let queue = Arc::new(MockQueue::default());
        let (promise, _future) = response_channel();
        let result = Command::new(
            promise,
            test_facade(&queue),
            vec![],
            vec![mem_handle(1)],
            vec![OutputSpec::new(3, ScalarType::F32, 1)],
            None,
        );
        assert!(result.is_err());
    }
}
