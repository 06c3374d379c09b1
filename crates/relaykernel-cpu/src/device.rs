//! Simulated compute device.
//!
//! `CpuDevice` stands in for an accelerator: it owns device buffers and
//! compiled kernels behind raw ids, and keeps a native-style reference
//! count per resource. The count table is observable, so tests can assert
//! that retain and release calls balance exactly the way they must on a
//! real device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use relaykernel_core::device::{KernelHandle, MemHandle, RawEvent, RawKernel, RawMem};
use relaykernel_core::error::{RelayKernelError, Result};
use relaykernel_core::handle::ResourceOps;
use relaykernel_core::registry::{DeviceId, DeviceInfo, PlatformProvider};

use crate::kernel::{CpuKernel, KernelFn};

/// Kind of a simulated native resource, for ref-count inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Device memory object.
    Mem,
    /// Completion event.
    Event,
    /// Compiled kernel.
    Kernel,
}

/// Reference-count statistics for one simulated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefStats {
    /// Current reference count.
    pub count: i64,
    /// Total retain calls, including the owned reference at creation.
    pub retains: u64,
    /// Total release calls.
    pub releases: u64,
}

#[derive(Default)]
struct RefTable {
    entries: Mutex<HashMap<(ResourceKind, u64), RefStats>>,
}

impl RefTable {
    /// Record a freshly created resource carrying one owned reference.
    fn created(&self, kind: ResourceKind, id: u64) {
        self.entries.lock().insert(
            (kind, id),
            RefStats {
                count: 1,
                retains: 1,
                releases: 0,
            },
        );
    }

    fn retain(&self, kind: ResourceKind, id: u64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry((kind, id)).or_insert(RefStats {
            count: 0,
            retains: 0,
            releases: 0,
        });
        entry.count += 1;
        entry.retains += 1;
    }

    /// Returns the count after the release.
    fn release(&self, kind: ResourceKind, id: u64) -> i64 {
        let mut entries = self.entries.lock();
        let entry = entries.entry((kind, id)).or_insert(RefStats {
            count: 0,
            retains: 0,
            releases: 0,
        });
        entry.count -= 1;
        entry.releases += 1;
        entry.count
    }

    fn stats(&self, kind: ResourceKind, id: u64) -> Option<RefStats> {
        self.entries.lock().get(&(kind, id)).copied()
    }

    fn created_count(&self, kind: ResourceKind) -> usize {
        self.entries.lock().keys().filter(|(k, _)| *k == kind).count()
    }

    fn live_count(&self, kind: ResourceKind) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|((k, _), stats)| *k == kind && stats.count > 0)
            .count()
    }

    fn all_released(&self, kind: ResourceKind) -> bool {
        self.entries
            .lock()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .all(|(_, stats)| stats.count == 0 && stats.retains == stats.releases)
    }
}

pub(crate) struct DeviceInner {
    name: String,
    pub(crate) buffers: Mutex<HashMap<u64, Vec<u8>>>,
    pub(crate) kernels: Mutex<HashMap<u64, CpuKernel>>,
    refs: RefTable,
    next_id: AtomicU64,
}

/// Retain/release operations backed by the device's ref-count table.
///
/// A memory object or kernel whose count reaches zero is destroyed, like
/// its native counterpart. Event entries are kept as tombstones; the
/// completion bookkeeping outlives the last handle in the simulation.
pub(crate) struct CpuOps {
    inner: Arc<DeviceInner>,
}

impl ResourceOps<RawMem> for CpuOps {
    fn retain(&self, raw: RawMem) {
        self.inner.refs.retain(ResourceKind::Mem, raw.0);
    }

    fn release(&self, raw: RawMem) {
        if self.inner.refs.release(ResourceKind::Mem, raw.0) == 0 {
            self.inner.buffers.lock().remove(&raw.0);
        }
    }
}

impl ResourceOps<RawKernel> for CpuOps {
    fn retain(&self, raw: RawKernel) {
        self.inner.refs.retain(ResourceKind::Kernel, raw.0);
    }

    fn release(&self, raw: RawKernel) {
        if self.inner.refs.release(ResourceKind::Kernel, raw.0) == 0 {
            self.inner.kernels.lock().remove(&raw.0);
        }
    }
}

impl ResourceOps<RawEvent> for CpuOps {
    fn retain(&self, raw: RawEvent) {
        self.inner.refs.retain(ResourceKind::Event, raw.0);
    }

    fn release(&self, raw: RawEvent) {
        self.inner.refs.release(ResourceKind::Event, raw.0);
    }
}

/// Simulated compute device executing on the host.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct CpuDevice {
    inner: Arc<DeviceInner>,
    ops: Arc<CpuOps>,
}

impl CpuDevice {
    /// Create a device with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(DeviceInner {
            name: name.into(),
            buffers: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            refs: RefTable::default(),
            next_id: AtomicU64::new(1),
        });
        let ops = Arc::new(CpuOps {
            inner: Arc::clone(&inner),
        });
        Self { inner, ops }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocate a zero-filled device buffer of `len` bytes.
    pub fn create_buffer(&self, len: usize) -> MemHandle {
        let id = self.next_id();
        self.inner.buffers.lock().insert(id, vec![0; len]);
        self.inner.refs.created(ResourceKind::Mem, id);
        debug!(device = %self.inner.name, id, len, "buffer created");
        MemHandle::adopted(self.mem_ops(), RawMem(id))
    }

    /// Allocate a device buffer initialized with `data`.
    pub fn create_buffer_from(&self, data: &[u8]) -> MemHandle {
        let handle = self.create_buffer(data.len());
        if let Some(raw) = handle.raw() {
            if let Some(buffer) = self.inner.buffers.lock().get_mut(&raw.0) {
                buffer.copy_from_slice(data);
            }
        }
        handle
    }

    /// Snapshot a device buffer's contents.
    pub fn read_buffer(&self, handle: &MemHandle) -> Result<Vec<u8>> {
        let raw = handle
            .raw()
            .ok_or_else(|| RelayKernelError::command("null memory handle"))?;
        self.inner
            .buffers
            .lock()
            .get(&raw.0)
            .cloned()
            .ok_or_else(|| {
                RelayKernelError::command(format!("buffer {} does not exist", raw.0))
            })
    }

    /// Register a host-closure kernel with its argument buffers bound in
    /// call order. The returned handle owns one reference to the kernel.
    pub fn create_kernel(
        &self,
        name: impl Into<String>,
        args: &[&MemHandle],
        func: KernelFn,
    ) -> Result<KernelHandle> {
        let mut bound = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let raw = arg.raw().ok_or_else(|| {
                RelayKernelError::invalid_config(format!("argument {} is a null handle", index))
            })?;
            bound.push(raw);
        }
        let id = self.next_id();
        let name = name.into();
        self.inner
            .kernels
            .lock()
            .insert(id, CpuKernel::new(name.clone(), bound, func));
        self.inner.refs.created(ResourceKind::Kernel, id);
        debug!(device = %self.inner.name, id, kernel = %name, "kernel created");
        Ok(KernelHandle::adopted(self.kernel_ops(), RawKernel(id)))
    }

    /// Capabilities of this device.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(0),
            name: self.inner.name.clone(),
            vendor: "RelayKernel".to_string(),
            compute_units: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            max_work_group_size: 1024,
            // The host heap is the device memory; report a fixed figure.
            global_memory: 4 << 30,
        }
    }

    /// Ref-count statistics for one resource, if it was ever created.
    pub fn ref_stats(&self, kind: ResourceKind, id: u64) -> Option<RefStats> {
        self.inner.refs.stats(kind, id)
    }

    /// Number of resources of `kind` ever created.
    pub fn created_count(&self, kind: ResourceKind) -> usize {
        self.inner.refs.created_count(kind)
    }

    /// Number of resources of `kind` with a positive reference count.
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.inner.refs.live_count(kind)
    }

    /// Whether every resource of `kind` has balanced retains and releases.
    pub fn all_released(&self, kind: ResourceKind) -> bool {
        self.inner.refs.all_released(kind)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }

    pub(crate) fn created_event(&self, raw: RawEvent) {
        self.inner.refs.created(ResourceKind::Event, raw.0);
    }

    pub(crate) fn mem_ops(&self) -> Arc<dyn ResourceOps<RawMem>> {
        Arc::clone(&self.ops) as Arc<dyn ResourceOps<RawMem>>
    }

    pub(crate) fn kernel_ops(&self) -> Arc<dyn ResourceOps<RawKernel>> {
        Arc::clone(&self.ops) as Arc<dyn ResourceOps<RawKernel>>
    }

    pub(crate) fn event_ops(&self) -> Arc<dyn ResourceOps<RawEvent>> {
        Arc::clone(&self.ops) as Arc<dyn ResourceOps<RawEvent>>
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new("relaykernel-cpu")
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDevice")
            .field("name", &self.inner.name)
            .field("buffers", &self.inner.buffers.lock().len())
            .field("kernels", &self.inner.kernels.lock().len())
            .finish()
    }
}

/// Discovery provider exposing CPU simulation devices.
pub struct CpuPlatform {
    devices: Vec<CpuDevice>,
}

impl CpuPlatform {
    /// Create a platform over the given devices.
    pub fn new(devices: Vec<CpuDevice>) -> Self {
        Self { devices }
    }
}

impl PlatformProvider for CpuPlatform {
    fn name(&self) -> &str {
        "relaykernel-cpu"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let mut info = device.info();
                info.id = DeviceId(index as u32);
                info
            })
            .collect()
    }
}
