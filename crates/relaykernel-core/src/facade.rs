//! The kernel facade shared by all commands that invoke one kernel.

use std::sync::Arc;

use crate::config::LaunchConfig;
use crate::device::{DeviceQueue, KernelHandle};
use crate::output::{MapResults, Reply};

/// Everything the dispatch engine needs to invoke one compiled kernel: the
/// device queue, the kernel handle, the launch configuration, and an
/// optional transform applied to decoded outputs before delivery.
///
/// A facade is shared read-only across all in-flight commands referencing
/// it; commands extend its lifetime via `Arc` but never mutate it.
pub struct KernelFacade {
    queue: Arc<dyn DeviceQueue>,
    kernel: KernelHandle,
    config: LaunchConfig,
    map_results: Option<MapResults>,
}

impl KernelFacade {
    /// Create a facade for `kernel` on `queue` with the given launch
    /// configuration.
    pub fn new(queue: Arc<dyn DeviceQueue>, kernel: KernelHandle, config: LaunchConfig) -> Self {
        Self {
            queue,
            kernel,
            config,
            map_results: None,
        }
    }

    /// Attach a result-mapping function applied to the decoded outputs of
    /// every command before delivery.
    pub fn with_map_results<F>(mut self, map: F) -> Self
    where
        F: Fn(Reply) -> Reply + Send + Sync + 'static,
    {
        self.map_results = Some(Arc::new(map));
        self
    }

    /// The device queue commands submit to.
    pub fn queue(&self) -> &Arc<dyn DeviceQueue> {
        &self.queue
    }

    /// The compiled kernel handle.
    pub fn kernel(&self) -> &KernelHandle {
        &self.kernel
    }

    /// The launch configuration.
    pub fn launch_config(&self) -> &LaunchConfig {
        &self.config
    }

    /// The optional result transform.
    pub fn map_results(&self) -> Option<&MapResults> {
        self.map_results.as_ref()
    }
}

impl std::fmt::Debug for KernelFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelFacade")
            .field("kernel", &self.kernel)
            .field("config", &self.config)
            .field("map_results", &self.map_results.is_some())
            .finish()
    }
}
