//! Compute device management for expression execution.
//!
//! The manager hands out a device id per task. Selection precedence: a
//! device pinned through the effective descriptor (ignored when out of
//! range), then the fixed position-modulo strategy, then a round-robin
//! counter shared across calls — the mechanism that spreads load across
//! devices over the lifetime of a library instance. Selections within one
//! `fetch_devices` call are consistent with each other but not across calls.
//!
//! This hosted build synthesizes a logical device inventory from the
//! library configuration; the concrete kernels behind a device are opaque
//! host callables, so a "device" is a queue target, not a driver handle.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{trace, warn};

use crate::descriptor::{Descriptor, Param};
use crate::error::{Error, Result};
use crate::LibraryConfig;

/// Kind of compute device requested from the platform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Gpu,
    Cpu,
    Accelerator,
}

impl DeviceType {
    fn tag(self) -> &'static str {
        match self {
            DeviceType::Gpu => "gpu",
            DeviceType::Cpu => "cpu",
            DeviceType::Accelerator => "acc",
        }
    }
}

/// How many matching devices to claim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceAmount {
    One,
    All,
}

/// Identifier handed to tasks; indexes the manager's device list.
pub type DeviceId = usize;

/// A logical compute device.
#[derive(Clone, Debug)]
pub struct Device {
    pub name: String,
    pub device_type: DeviceType,
}

/// Synthesize the hosted device inventory matching `config`.
///
/// The host platform is named `"host"` and exposes one logical device per
/// available core for each device type. An empty selection after filtering
/// fails with `DeviceNotPresent`.
pub fn discover(config: &LibraryConfig) -> Result<Vec<Device>> {
    if let Some(platform) = &config.platform_name {
        if platform != "host" {
            return Err(Error::device_not_present(format!(
                "no platform named `{platform}`"
            )));
        }
    }

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let ty = config.device_type;
    let mut inventory: Vec<Device> = (0..cores)
        .map(|i| Device {
            name: format!("host-{}-{i}", ty.tag()),
            device_type: ty,
        })
        .collect();

    if let Some(names) = &config.device_names {
        inventory.retain(|d| names.iter().any(|n| n == &d.name));
    }
    if config.device_amount == DeviceAmount::One {
        inventory.truncate(1);
    }
    if inventory.is_empty() {
        return Err(Error::device_not_present(
            "no device matches the requested constraints",
        ));
    }
    Ok(inventory)
}

/// Hands out device ids for sequential or parallel equally-complex parts of
/// expression nodes.
pub struct DeviceManager {
    devices: Vec<Device>,
    next: Mutex<usize>,
}

impl DeviceManager {
    pub fn new(devices: Vec<Device>) -> Self {
        debug_assert!(!devices.is_empty());
        Self {
            devices,
            next: Mutex::new(0),
        }
    }

    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id]
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Fetch a device id for a single task of a node with the given
    /// effective descriptor.
    pub fn fetch_device(&self, desc: &Descriptor) -> Result<DeviceId> {
        let mut next = self.next.lock().expect("device manager poisoned");

        if let Some(id) = desc.get_param_t::<DeviceId>(Param::DeviceId)? {
            if id < self.devices.len() {
                return Ok(id);
            }
        }
        if desc.is_param_set(Param::DeviceFixedStrategy) {
            return Ok(0);
        }
        Ok(Self::advance(&mut next, self.devices.len()))
    }

    /// Fetch `required` device ids for equally-complex per-block tasks.
    pub fn fetch_devices(&self, required: usize, desc: &Descriptor) -> Result<Vec<DeviceId>> {
        let mut next = self.next.lock().expect("device manager poisoned");

        if required == 0 {
            return Ok(Vec::new());
        }
        if let Some(id) = desc.get_param_t::<DeviceId>(Param::DeviceId)? {
            if id < self.devices.len() {
                return Ok(vec![id; required]);
            }
        }
        if desc.is_param_set(Param::DeviceFixedStrategy) {
            // Fill positions from zero.
            return Ok((0..required).map(|i| i % self.devices.len()).collect());
        }
        // Even work distribution across all tasks.
        Ok((0..required)
            .map(|_| Self::advance(&mut next, self.devices.len()))
            .collect())
    }

    fn advance(next: &mut usize, count: usize) -> DeviceId {
        let id = *next;
        *next = (*next + 1) % count;
        id
    }
}

/// Per-task command queue on a chosen device.
///
/// Kernels are enqueued in order and the queue must be finished before the
/// task returns; no side effect of a task becomes visible to successors
/// until then. The hosted build executes kernels eagerly, so `finish` is
/// the synchronisation point in name and in profiling only.
pub struct CommandQueue {
    device_name: String,
    started: Instant,
    kernels: usize,
    finished: bool,
}

impl CommandQueue {
    pub fn new(device: &Device) -> Self {
        Self {
            device_name: device.name.clone(),
            started: Instant::now(),
            kernels: 0,
            finished: false,
        }
    }

    /// Record a kernel dispatch on this queue.
    pub fn enqueue(&mut self, kernel: &str) {
        self.kernels += 1;
        trace!(device = %self.device_name, kernel, "enqueue kernel");
    }

    /// Finish the queue; returns the elapsed time for profiling.
    pub fn finish(mut self) -> std::time::Duration {
        self.finished = true;
        let elapsed = self.started.elapsed();
        trace!(
            device = %self.device_name,
            kernels = self.kernels,
            ?elapsed,
            "queue finished"
        );
        elapsed
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if !self.finished {
            warn!(device = %self.device_name, "command queue dropped without finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| Device {
                name: format!("host-cpu-{i}"),
                device_type: DeviceType::Cpu,
            })
            .collect()
    }

    #[test]
    fn round_robin_distributes() {
        let man = DeviceManager::new(devices(3));
        let desc = Descriptor::new();
        let ids: Vec<_> = (0..6).map(|_| man.fetch_device(&desc).unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn pinned_device_wins() {
        let man = DeviceManager::new(devices(3));
        let mut desc = Descriptor::new();
        desc.set_param_value(Param::DeviceId, 2usize);
        assert_eq!(man.fetch_device(&desc).unwrap(), 2);
        assert_eq!(man.fetch_devices(4, &desc).unwrap(), vec![2, 2, 2, 2]);
    }

    #[test]
    fn out_of_range_pin_falls_through() {
        let man = DeviceManager::new(devices(2));
        let mut desc = Descriptor::new();
        desc.set_param_value(Param::DeviceId, 9usize);
        // Falls back to round-robin.
        assert_eq!(man.fetch_device(&desc).unwrap(), 0);
        assert_eq!(man.fetch_device(&desc).unwrap(), 1);
    }

    #[test]
    fn fixed_strategy_fills_position_modulo() {
        let man = DeviceManager::new(devices(3));
        let mut desc = Descriptor::new();
        desc.set_param(Param::DeviceFixedStrategy);
        assert_eq!(man.fetch_devices(5, &desc).unwrap(), vec![0, 1, 2, 0, 1]);
        assert_eq!(man.fetch_device(&desc).unwrap(), 0);
    }

    #[test]
    fn zero_required_yields_empty() {
        let man = DeviceManager::new(devices(2));
        assert!(man.fetch_devices(0, &Descriptor::new()).unwrap().is_empty());
    }

    #[test]
    fn queue_must_finish_before_the_task_returns() {
        let d = Device {
            name: "host-cpu-0".into(),
            device_type: DeviceType::Cpu,
        };
        let mut q = CommandQueue::new(&d);
        q.enqueue("ewise_add_coo");
        q.enqueue("sort_by_key");
        let _elapsed = q.finish();
    }
}
