//! Reference-counted ownership of native device resources.
//!
//! Device APIs hand out raw handles whose lifetime is governed by a
//! retain/release pair on the device side. [`DeviceHandle`] wraps one such
//! handle and keeps the device-side count balanced: cloning retains, drop
//! releases, and a plain Rust move transfers the raw value with no
//! ref-count traffic at all.

use std::fmt;
use std::sync::Arc;

/// Retain/release operations for one kind of native device resource.
///
/// Backends implement this against their own resource tables. The
/// operations are infallible from the wrapper's point of view; a device
/// API that cannot retain a valid handle has already lost the plot.
pub trait ResourceOps<R>: Send + Sync {
    /// Increment the device-side reference count of `raw`.
    fn retain(&self, raw: R);

    /// Decrement the device-side reference count of `raw`, destroying the
    /// resource when it reaches zero.
    fn release(&self, raw: R);
}

/// Owning wrapper around a raw device resource handle.
///
/// A null handle (no wrapped resource) never touches the reference count.
pub struct DeviceHandle<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> {
    raw: Option<R>,
    ops: Arc<dyn ResourceOps<R>>,
}

impl<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> DeviceHandle<R> {
    /// Wrap `raw`, retaining it. Use when the source keeps its own
    /// reference to the handle.
    pub fn retained(ops: Arc<dyn ResourceOps<R>>, raw: R) -> Self {
        ops.retain(raw);
        Self { raw: Some(raw), ops }
    }

    /// Wrap `raw` without retaining. Use when the device API already
    /// transferred one owned reference to the caller.
    pub fn adopted(ops: Arc<dyn ResourceOps<R>>, raw: R) -> Self {
        Self { raw: Some(raw), ops }
    }

    /// Create a null handle.
    pub fn null(ops: Arc<dyn ResourceOps<R>>) -> Self {
        Self { raw: None, ops }
    }

    /// The wrapped raw handle, if any.
    pub fn raw(&self) -> Option<R> {
        self.raw
    }

    /// Whether this handle wraps no resource.
    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Release the current resource, if any, leaving the handle null.
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.ops.release(raw);
        }
    }

    /// Release the current resource and store `raw`, retaining it.
    pub fn replace(&mut self, raw: R) {
        self.reset();
        self.ops.retain(raw);
        self.raw = Some(raw);
    }

    /// Release the current resource and store `raw` without retaining it.
    pub fn adopt(&mut self, raw: R) {
        self.reset();
        self.raw = Some(raw);
    }

    /// Steal the raw handle, leaving this handle null. No ref-count
    /// traffic; the caller now owns the reference this handle held.
    pub fn take(&mut self) -> Option<R> {
        self.raw.take()
    }
}

impl<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> Clone for DeviceHandle<R> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            self.ops.retain(raw);
        }
        Self {
            raw: self.raw,
            ops: Arc::clone(&self.ops),
        }
    }
}

impl<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> Drop for DeviceHandle<R> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> fmt::Debug for DeviceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => write!(f, "DeviceHandle({:?})", raw),
            None => write!(f, "DeviceHandle(null)"),
        }
    }
}

impl<R: Copy + Eq + fmt::Debug + Send + Sync + 'static> PartialEq for DeviceHandle<R> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
