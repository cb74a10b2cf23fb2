use std::cell::Cell;

pub mod pressure;

pub use pressure::{
    CgroupV2Source, DefaultSystemMemory, MemInfoSource, MemoryPressureMonitor,
    MemoryPressureThresholds, PressureReading,
};

/// Interface to the host's physical memory counters.
///
/// Values are in megabytes. A source that cannot read its counters reports
/// zero, which the pressure monitor treats as "unknown".
pub trait SystemMemory {
    fn total_physical_mb(&self) -> u64;

    fn available_physical_mb(&self) -> u64;
}

/// Settable memory figures for embedders that measure memory themselves.
#[derive(Debug, Default)]
pub struct FixedSystemMemory {
    total_mb: Cell<u64>,
    available_mb: Cell<u64>,
}

impl FixedSystemMemory {
    pub fn new(total_mb: u64, available_mb: u64) -> Self {
        Self {
            total_mb: Cell::new(total_mb),
            available_mb: Cell::new(available_mb.min(total_mb)),
        }
    }

    pub fn set_available_mb(&self, available_mb: u64) {
        self.available_mb.set(available_mb.min(self.total_mb.get()));
    }

    pub fn set_total_mb(&self, total_mb: u64) {
        self.total_mb.set(total_mb);
        self.available_mb.set(self.available_mb.get().min(total_mb));
    }
}

impl SystemMemory for FixedSystemMemory {
    fn total_physical_mb(&self) -> u64 {
        self.total_mb.get()
    }

    fn available_physical_mb(&self) -> u64 {
        self.available_mb.get()
    }
}

impl<T: SystemMemory + ?Sized> SystemMemory for std::rc::Rc<T> {
    fn total_physical_mb(&self) -> u64 {
        (**self).total_physical_mb()
    }

    fn available_physical_mb(&self) -> u64 {
        (**self).available_physical_mb()
    }
}
