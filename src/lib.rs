//! NVMe storage driver for uintOS.
//!
//! This crate implements the command-queue engine of the uintOS NVMe driver:
//! controller bring-up over memory-mapped registers, admin and I/O queue
//! pairs in DMA memory, polled command completion, namespace discovery, and a
//! block-level interface the kernel's device layer can register.
//!
//! The kernel supplies memory, time, and device registration through the
//! [`hal::Platform`] trait; everything device-specific lives here. Completion
//! is polling-only: the controller is configured with interrupts disabled
//! and every wait is a bounded poll loop.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hal;
pub mod registers;
pub mod commands;
pub mod identify;
pub mod queue;
pub mod request;
pub mod namespace;
pub mod controller;
pub mod block;

#[cfg(test)]
pub mod testing;


pub use block::{BlockDevice, BlockDeviceRegistry, Geometry, NvmeBlockDevice, register_namespaces};
pub use controller::{ControllerInfo, ControllerState, NvmeController};
pub use hal::{DmaBuffer, MmioRegion, Platform};
pub use namespace::Namespace;

/// NVMe driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// A bounded wait elapsed before the awaited condition held.
    Timeout,
    /// The controller reported a fatal status or has left the operational
    /// state.
    ControllerFatal,
    /// No request slot (or submission ring entry) is available.
    NoFreeSlot,
    /// A caller-supplied argument is out of range for the device.
    InvalidParameter,
    /// The platform could not provide DMA or MMIO resources.
    ResourceExhausted,
    /// The controller completed the command with a nonzero status code.
    DeviceError(u16),
    /// The namespace id is not in the table.
    NotFound,
}
